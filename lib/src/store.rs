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

use std::fmt::Debug;
use std::fmt::Formatter;
use std::fs;
use std::io::Write as _;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use clru::CLruCache;
use tempfile::NamedTempFile;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt as _;

use crate::content_hash;
use crate::content_hash::StreamingHasher;
use crate::file_util::create_or_reuse_dir;
use crate::file_util::persist_content_addressed_temp_file;
use crate::hex_util;
use crate::object_id::ObjectId;
use crate::object_id::StorageId as _;
use crate::types::StorageError;
use crate::types::StorageResult;
use crate::types::map_not_found_err;

// Tree nodes are read repeatedly during iteration and diffing; values are
// usually read once.
const OBJECT_CACHE_CAPACITY: usize = 1000;

const OBJECTS_DIR: &str = "objects";
const STAGING_DIR: &str = "staging";

/// An immutable content-addressed blob loaded from the store.
#[derive(Clone, PartialEq, Eq)]
pub struct Object {
    id: ObjectId,
    data: Arc<[u8]>,
}

impl Object {
    pub fn id(&self) -> &ObjectId {
        &self.id
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl Debug for Object {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        f.debug_struct("Object")
            .field("id", &self.id)
            .field("len", &self.data.len())
            .finish()
    }
}

/// Seam through which the tree layer reads and writes content-addressed
/// blobs. Implemented by [`ObjectStore`] for purely local access and by the
/// page storage facade, whose asynchronous getter escalates misses to the
/// sync delegate.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn get_object(&self, id: &ObjectId) -> StorageResult<Object>;

    /// Local-only lookup, callable from blocking contexts. Never escalates.
    fn get_object_sync(&self, id: &ObjectId) -> StorageResult<Object>;

    fn add_object_sync(&self, data: &[u8]) -> StorageResult<ObjectId>;

    fn object_exists(&self, id: &ObjectId) -> StorageResult<bool>;
}

/// Content-addressed blob storage backed by two directories: `objects/`
/// holds finished blobs named by their uppercase hex digest, `staging/`
/// holds in-progress writes that are renamed into place once their content
/// is durable.
pub struct ObjectStore {
    objects_dir: PathBuf,
    staging_dir: PathBuf,
    cache: Mutex<CLruCache<ObjectId, Arc<[u8]>>>,
}

impl Debug for ObjectStore {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        f.debug_struct("ObjectStore")
            .field("objects_dir", &self.objects_dir)
            .finish_non_exhaustive()
    }
}

impl ObjectStore {
    /// Creates the store's directories under `page_dir` if missing and
    /// returns a handle to them.
    pub fn init(page_dir: &Path) -> StorageResult<Self> {
        let objects_dir = page_dir.join(OBJECTS_DIR);
        let staging_dir = page_dir.join(STAGING_DIR);
        create_or_reuse_dir(&objects_dir)
            .and_then(|()| create_or_reuse_dir(&staging_dir))
            .map_err(|err| {
                StorageError::internal_io("Unable to create object store directories", err)
            })?;
        Ok(Self {
            objects_dir,
            staging_dir,
            cache: Mutex::new(CLruCache::new(OBJECT_CACHE_CAPACITY.try_into().unwrap())),
        })
    }

    fn object_path(&self, id: &ObjectId) -> PathBuf {
        self.objects_dir.join(hex_util::encode_file_hex(id.as_bytes()))
    }

    /// Digests `data` and writes it under the resulting id.
    pub fn put_bytes(&self, data: &[u8]) -> StorageResult<ObjectId> {
        let id = ObjectId::new(content_hash::hash_bytes(data));
        let path = self.object_path(&id);
        if path.is_file() {
            return Ok(id);
        }
        let mut temp_file = NamedTempFile::new_in(&self.staging_dir)
            .map_err(|err| StorageError::internal_io("Unable to create staging file", err))?;
        temp_file
            .write_all(data)
            .map_err(|err| StorageError::internal_io("Unable to write staging file", err))?;
        persist_content_addressed_temp_file(temp_file, path, data.len() as u64)
            .map_err(|err| StorageError::internal_io("Unable to persist object", err))?;
        Ok(id)
    }

    /// Drains `source` into a staging file while digesting it, then promotes
    /// the file into `objects/`.
    ///
    /// A non-negative `expected_size` is verified against the byte count
    /// actually read; a mismatch fails the write. The returned id is the
    /// digest of the bytes observed. On any error the staging file is
    /// removed.
    pub async fn put_stream(
        &self,
        source: &mut (dyn AsyncRead + Send + Unpin),
        expected_size: i64,
    ) -> StorageResult<ObjectId> {
        let temp_file = NamedTempFile::new_in(&self.staging_dir)
            .map_err(|err| StorageError::internal_io("Unable to create staging file", err))?;
        let mut file = temp_file.as_file();
        let mut hasher = StreamingHasher::new();
        let mut size: u64 = 0;
        let mut buf: Vec<u8> = vec![0; 1 << 14];
        loop {
            let bytes_read = source
                .read(&mut buf)
                .await
                .map_err(|err| StorageError::internal_io("Error reading object data", err))?;
            if bytes_read == 0 {
                break;
            }
            let bytes = &buf[..bytes_read];
            file.write_all(bytes)
                .map_err(|err| StorageError::internal_io("Error writing data to disk", err))?;
            hasher.update(bytes);
            size += bytes_read as u64;
        }
        file.flush()
            .map_err(|err| StorageError::internal_io("Error writing data to disk", err))?;
        if expected_size >= 0 && size != expected_size as u64 {
            return Err(StorageError::Io {
                expected: expected_size,
                actual: size,
            });
        }

        let id = ObjectId::new(hasher.finish());
        persist_content_addressed_temp_file(temp_file, self.object_path(&id), size)
            .map_err(|err| StorageError::internal_io("Unable to persist object", err))?;
        Ok(id)
    }

    fn read_object(&self, id: &ObjectId) -> StorageResult<Object> {
        {
            let mut locked_cache = self.cache.lock().unwrap();
            if let Some(data) = locked_cache.get(id).cloned() {
                return Ok(Object { id: *id, data });
            }
        }
        let data: Arc<[u8]> = fs::read(self.object_path(id))
            .map_err(|err| map_not_found_err(err, id))?
            .into();
        let mut locked_cache = self.cache.lock().unwrap();
        locked_cache.put(*id, data.clone());
        Ok(Object { id: *id, data })
    }
}

#[async_trait]
impl ObjectStorage for ObjectStore {
    async fn get_object(&self, id: &ObjectId) -> StorageResult<Object> {
        self.read_object(id)
    }

    fn get_object_sync(&self, id: &ObjectId) -> StorageResult<Object> {
        self.read_object(id)
    }

    fn add_object_sync(&self, data: &[u8]) -> StorageResult<ObjectId> {
        self.put_bytes(data)
    }

    fn object_exists(&self, id: &ObjectId) -> StorageResult<bool> {
        Ok(self.object_path(id).is_file())
    }
}
