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

//! Canonical tree-node serialization.
//!
//! Two nodes with equal logical content must have byte-identical encodings,
//! since a node's id is the digest of its encoding. The format is
//! `(entry_count, [entry] * entry_count, [child_id] * (entry_count + 1))`
//! where an entry is `(key_len, key, value_id, priority)` and a child id is
//! `(id_len, id)` with `id_len == 0` denoting the empty child. All length
//! prefixes are fixed-width little-endian.

use bstr::BString;

use crate::object_id::ID_LEN;
use crate::object_id::ObjectId;
use crate::object_id::StorageId;
use crate::types::Entry;
use crate::types::KeyPriority;

const PRIORITY_EAGER: u8 = 0;
const PRIORITY_LAZY: u8 = 1;

pub(super) fn encode_node(entries: &[Entry], children: &[Option<ObjectId>]) -> Vec<u8> {
    assert_eq!(entries.len() + 1, children.len());
    let mut out = Vec::new();
    out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    for entry in entries {
        out.extend_from_slice(&(entry.key.len() as u32).to_le_bytes());
        out.extend_from_slice(&entry.key);
        out.extend_from_slice(entry.object_id.as_bytes());
        out.push(match entry.priority {
            KeyPriority::Eager => PRIORITY_EAGER,
            KeyPriority::Lazy => PRIORITY_LAZY,
        });
    }
    for child in children {
        match child {
            Some(id) => {
                out.push(ID_LEN as u8);
                out.extend_from_slice(id.as_bytes());
            }
            None => out.push(0),
        }
    }
    out
}

/// Strictly decodes `data`, returning `None` on any malformed length prefix,
/// unknown priority, bad child-id length, or trailing garbage.
pub(super) fn decode_node(data: &[u8]) -> Option<(Vec<Entry>, Vec<Option<ObjectId>>)> {
    let mut reader = Reader(data);
    let entry_count = reader.read_u32()? as usize;
    let mut entries = Vec::with_capacity(entry_count);
    for _ in 0..entry_count {
        let key_len = reader.read_u32()? as usize;
        let key = BString::from(reader.read_bytes(key_len)?);
        let object_id = ObjectId::try_from_bytes(reader.read_bytes(ID_LEN)?).unwrap();
        let priority = match reader.read_u8()? {
            PRIORITY_EAGER => KeyPriority::Eager,
            PRIORITY_LAZY => KeyPriority::Lazy,
            _ => return None,
        };
        entries.push(Entry {
            key,
            object_id,
            priority,
        });
    }
    let mut children = Vec::with_capacity(entry_count + 1);
    for _ in 0..=entry_count {
        match reader.read_u8()? as usize {
            0 => children.push(None),
            ID_LEN => {
                children.push(Some(ObjectId::try_from_bytes(reader.read_bytes(ID_LEN)?).unwrap()));
            }
            _ => return None,
        }
    }
    reader.0.is_empty().then_some((entries, children))
}

struct Reader<'a>(&'a [u8]);

impl Reader<'_> {
    fn read_bytes(&mut self, len: usize) -> Option<&[u8]> {
        if self.0.len() < len {
            return None;
        }
        let (bytes, rest) = self.0.split_at(len);
        self.0 = rest;
        Some(bytes)
    }

    fn read_u8(&mut self) -> Option<u8> {
        self.read_bytes(1).map(|b| b[0])
    }

    fn read_u32(&mut self) -> Option<u32> {
        self.read_bytes(4).map(|b| u32::from_le_bytes(b.try_into().unwrap()))
    }
}
