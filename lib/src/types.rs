// Copyright 2024 The Pagestore Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![expect(missing_docs)]

use bstr::BString;
use thiserror::Error;

use crate::object_id::ObjectId;
use crate::object_id::StorageId;

/// Per-entry synchronization policy. Eager values are prefetched together
/// with their commit; lazy values are fetched on demand.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash)]
pub enum KeyPriority {
    Eager,
    Lazy,
}

/// A single key-value binding inside a tree node.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Hash)]
pub struct Entry {
    pub key: BString,
    pub object_id: ObjectId,
    pub priority: KeyPriority,
}

impl Entry {
    pub fn new(key: impl Into<BString>, object_id: ObjectId, priority: KeyPriority) -> Self {
        Self {
            key: key.into(),
            object_id,
            priority,
        }
    }
}

/// One element of an edit stream: either an insertion/update of `entry`, or
/// the deletion of `entry.key`. For deletions only the key is meaningful.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct EntryChange {
    pub entry: Entry,
    pub deleted: bool,
}

/// Where a commit entered this device: created locally, or shipped in by the
/// cloud sync layer.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ChangeSource {
    Local,
    Sync,
}

/// Whether a journal's staged edits survive a crash. Implicit journals are
/// replayed at page-init time; explicit journals are discarded.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum JournalType {
    Explicit,
    Implicit,
}

/// Error kinds surfaced by the storage layer.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Object {hash} of type {object_type} not found")]
    NotFound { object_type: String, hash: String },
    #[error("Object {hash} of type {object_type} failed to decode: {reason}")]
    Format {
        object_type: String,
        hash: String,
        reason: String,
    },
    #[error("Received incorrect number of bytes, expected {expected}, got {actual}")]
    Io { expected: i64, actual: u64 },
    #[error("{context}")]
    InternalIo {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Traversal descended into an empty child")]
    NoSuchChild,
    #[error("{0} is not implemented")]
    NotImplemented(&'static str),
}

pub type StorageResult<T> = Result<T, StorageError>;

impl StorageError {
    pub(crate) fn not_found(id: &impl StorageId) -> Self {
        Self::NotFound {
            object_type: id.object_type(),
            hash: id.hex(),
        }
    }

    pub(crate) fn format(id: &impl StorageId, reason: impl Into<String>) -> Self {
        Self::Format {
            object_type: id.object_type(),
            hash: id.hex(),
            reason: reason.into(),
        }
    }

    pub(crate) fn internal_io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::InternalIo {
            context: context.into(),
            source,
        }
    }
}

/// Maps a filesystem read error for `id` to `NotFound` or `InternalIo`.
pub(crate) fn map_not_found_err(err: std::io::Error, id: &impl StorageId) -> StorageError {
    if err.kind() == std::io::ErrorKind::NotFound {
        StorageError::not_found(id)
    } else {
        StorageError::internal_io(format!("Error reading object {}", id.hex()), err)
    }
}
