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

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use pagestore_lib::btree;
use pagestore_lib::btree::TreeNode;
use pagestore_lib::content_hash;
use pagestore_lib::db::MemoryPageDb;
use pagestore_lib::object_id::ObjectId;
use pagestore_lib::page_storage::PageStorage;
use pagestore_lib::store::Object;
use pagestore_lib::store::ObjectStorage;
use pagestore_lib::sync::PageSyncDelegate;
use pagestore_lib::types::Entry;
use pagestore_lib::types::EntryChange;
use pagestore_lib::types::KeyPriority;
use pagestore_lib::types::StorageError;
use pagestore_lib::types::StorageResult;
use pollster::FutureExt as _;
use tempfile::TempDir;
use tokio::io::AsyncRead;

pub fn new_temp_dir() -> TempDir {
    tempfile::Builder::new()
        .prefix("pagestore-test-")
        .tempdir()
        .unwrap()
}

/// A page backed by a temp directory and an in-process metadata map, with
/// the pieces needed to simulate process restarts.
pub struct TestPage {
    pub temp_dir: TempDir,
    pub db: Arc<MemoryPageDb>,
    pub storage: PageStorage,
}

impl TestPage {
    pub fn init() -> Self {
        let temp_dir = new_temp_dir();
        let db = Arc::new(MemoryPageDb::new());
        let storage = PageStorage::init(temp_dir.path(), "test-page", db.clone()).unwrap();
        Self {
            temp_dir,
            db,
            storage,
        }
    }

    /// Re-runs page initialization over the same directory and metadata
    /// map, as a process restart would.
    pub fn reinit(self) -> StorageResult<Self> {
        let Self {
            temp_dir,
            db,
            storage,
        } = self;
        drop(storage);
        let storage = PageStorage::init(temp_dir.path(), "test-page", db.clone())?;
        Ok(Self {
            temp_dir,
            db,
            storage,
        })
    }
}

/// "keyNN", zero-padded, so that lexicographic and numeric order agree.
pub fn test_key(index: usize) -> String {
    format!("key{index:02}")
}

/// Stores "objectNN" as a value object and returns its id.
pub fn add_test_value(storage: &dyn ObjectStorage, index: usize) -> ObjectId {
    storage
        .add_object_sync(format!("object{index:02}").as_bytes())
        .unwrap()
}

/// `size` insertions of "keyNN" -> "objectNN", eager, in key order.
pub fn create_entry_changes(storage: &dyn ObjectStorage, size: usize) -> Vec<EntryChange> {
    (0..size)
        .map(|i| EntryChange {
            entry: Entry::new(test_key(i), add_test_value(storage, i), KeyPriority::Eager),
            deleted: false,
        })
        .collect()
}

/// Builds a tree from `changes` over the empty root and returns its root
/// id.
pub fn create_tree(
    storage: &dyn ObjectStorage,
    changes: &[EntryChange],
    node_size: usize,
) -> ObjectId {
    let root_id = TreeNode::from_entries(storage, vec![], vec![None]).unwrap();
    let (new_root_id, _new_nodes) = btree::apply_changes(storage, &root_id, node_size, changes)
        .block_on()
        .unwrap();
    new_root_id
}

/// Object storage wrapper recording which ids the asynchronous getter was
/// asked for.
pub struct TrackingStorage<'a> {
    inner: &'a dyn ObjectStorage,
    pub object_requests: Mutex<BTreeSet<ObjectId>>,
}

impl<'a> TrackingStorage<'a> {
    pub fn new(inner: &'a dyn ObjectStorage) -> Self {
        Self {
            inner,
            object_requests: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn requests(&self) -> BTreeSet<ObjectId> {
        self.object_requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ObjectStorage for TrackingStorage<'_> {
    async fn get_object(&self, id: &ObjectId) -> StorageResult<Object> {
        self.object_requests.lock().unwrap().insert(*id);
        self.inner.get_object(id).await
    }

    fn get_object_sync(&self, id: &ObjectId) -> StorageResult<Object> {
        self.inner.get_object_sync(id)
    }

    fn add_object_sync(&self, data: &[u8]) -> StorageResult<ObjectId> {
        self.inner.add_object_sync(data)
    }

    fn object_exists(&self, id: &ObjectId) -> StorageResult<bool> {
        self.inner.object_exists(id)
    }
}

/// Sync delegate serving objects from memory and recording every request.
#[derive(Default)]
pub struct TestSyncDelegate {
    objects: Mutex<BTreeMap<ObjectId, Vec<u8>>>,
    pub requests: Mutex<Vec<ObjectId>>,
}

impl TestSyncDelegate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `data` available for fetching and returns its id.
    pub fn add_object(&self, data: &[u8]) -> ObjectId {
        let id = ObjectId::new(content_hash::hash_bytes(data));
        self.add_object_with_id(id, data);
        id
    }

    /// Registers `data` under an arbitrary id, which may not be its digest.
    /// Lets tests exercise content-address verification of fetched objects.
    pub fn add_object_with_id(&self, id: ObjectId, data: &[u8]) {
        self.objects.lock().unwrap().insert(id, data.to_vec());
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl PageSyncDelegate for TestSyncDelegate {
    async fn get_object(
        &self,
        id: &ObjectId,
    ) -> StorageResult<(u64, Pin<Box<dyn AsyncRead + Send>>)> {
        self.requests.lock().unwrap().push(*id);
        let data = self
            .objects
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                object_type: "object".to_string(),
                hash: format!("{id}"),
            })?;
        let size = data.len() as u64;
        Ok((size, Box::pin(std::io::Cursor::new(data))))
    }
}
