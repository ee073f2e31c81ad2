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

use std::collections::BTreeSet;
use std::fmt::Debug;
use std::fmt::Formatter;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use itertools::Itertools as _;
use pollster::FutureExt as _;
use tokio::io::AsyncRead;
use tracing::debug;
use tracing::warn;

use crate::btree;
use crate::btree::TreeNode;
use crate::commit::Commit;
use crate::commit::FIRST_COMMIT_ID;
use crate::db::Batch;
use crate::db::JournalEdit;
use crate::db::JournalId;
use crate::db::JournalRecord;
use crate::db::PageDb;
use crate::journal::Journal;
use crate::object_id::CommitId;
use crate::object_id::ObjectId;
use crate::object_id::StorageId as _;
use crate::store::Object;
use crate::store::ObjectStorage;
use crate::store::ObjectStore;
use crate::sync::PageSyncDelegate;
use crate::types::ChangeSource;
use crate::types::Entry;
use crate::types::EntryChange;
use crate::types::JournalType;
use crate::types::KeyPriority;
use crate::types::StorageError;
use crate::types::StorageResult;

/// Entry count above which a node is split. Stored in the metadata map so
/// that every journal commit of a page agrees on it.
pub const DEFAULT_NODE_SIZE: usize = 1024;

pub type PageId = String;

/// Observer of commits entering the page. Notified synchronously on the
/// inserting caller's thread, after the metadata batch has been applied.
pub trait CommitWatcher: Send + Sync {
    fn on_new_commit(&self, commit: &Commit, source: ChangeSource);
}

/// Token returned by watcher registration, used for removal.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct WatcherHandle(u64);

/// A commit shipped in by sync: its claimed id plus its storage bytes.
pub type CommitIdAndBytes = (CommitId, Vec<u8>);

/// Local storage of a single page: the page's commit graph in the metadata
/// map, plus the content-addressed objects (tree nodes and values) those
/// commits reach.
pub struct PageStorage {
    page_id: PageId,
    db: Arc<dyn PageDb>,
    store: ObjectStore,
    watchers: Mutex<WatcherSet>,
    untracked_objects: Mutex<BTreeSet<ObjectId>>,
    sync_delegate: Mutex<Option<Arc<dyn PageSyncDelegate>>>,
}

#[derive(Default)]
struct WatcherSet {
    next_handle: u64,
    watchers: Vec<(u64, Box<dyn CommitWatcher>)>,
}

impl Debug for PageStorage {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        f.debug_struct("PageStorage")
            .field("page_id", &self.page_id)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl PageStorage {
    /// Opens (or creates) the page stored under `page_dir`.
    ///
    /// Creates the object directories, seeds the head set with
    /// [`FIRST_COMMIT_ID`] when the page is empty, records the node size,
    /// discards leftover explicit journals and replays implicit ones. A
    /// failing replay fails the whole initialization.
    pub fn init(
        page_dir: &Path,
        page_id: impl Into<PageId>,
        db: Arc<dyn PageDb>,
    ) -> StorageResult<Self> {
        let store = ObjectStore::init(page_dir)?;
        let this = Self {
            page_id: page_id.into(),
            db,
            store,
            watchers: Mutex::new(WatcherSet::default()),
            untracked_objects: Mutex::new(BTreeSet::new()),
            sync_delegate: Mutex::new(None),
        };

        // The empty commit's root must be readable from the very start.
        let empty_id = TreeNode::from_entries(&this.store, vec![], vec![None])?;
        debug_assert_eq!(&empty_id, TreeNode::empty_node_id());

        if this.db.heads()?.is_empty() {
            this.db.add_head(&FIRST_COMMIT_ID)?;
        }
        // TODO(sync): the node size should be negotiated across devices.
        if this.db.node_size()?.is_none() {
            this.db.set_node_size(DEFAULT_NODE_SIZE)?;
        }

        for journal_id in this.db.journal_ids()? {
            let Some(record) = this.db.journal_record(journal_id)? else {
                continue;
            };
            match record.journal_type {
                JournalType::Explicit => this.db.remove_journal(journal_id)?,
                JournalType::Implicit => {
                    debug!(journal_id, "replaying implicit journal");
                    let journal = Journal::new(&this, journal_id, record);
                    if let Err(err) = journal.commit().block_on() {
                        warn!(journal_id, %err, "implicit journal replay failed");
                        this.db.remove_journal(journal_id)?;
                        return Err(err);
                    }
                }
            }
        }
        Ok(this)
    }

    pub fn id(&self) -> &PageId {
        &self.page_id
    }

    pub(crate) fn db(&self) -> &dyn PageDb {
        self.db.as_ref()
    }

    /// The configured split threshold of this page's trees.
    pub fn node_size(&self) -> StorageResult<usize> {
        Ok(self.db.node_size()?.unwrap_or(DEFAULT_NODE_SIZE))
    }

    pub fn get_head_commit_ids(&self) -> StorageResult<Vec<CommitId>> {
        self.db.heads()
    }

    pub fn get_commit(&self, commit_id: &CommitId) -> StorageResult<Commit> {
        if *commit_id == FIRST_COMMIT_ID {
            return Ok(Commit::empty());
        }
        let bytes = self
            .db
            .commit_bytes(commit_id)?
            .ok_or_else(|| StorageError::not_found(commit_id))?;
        Commit::from_storage_bytes(*commit_id, bytes)
            .ok_or_else(|| StorageError::format(commit_id, "invalid commit storage bytes"))
    }

    /// Starts a journal for a new commit on top of `base`.
    pub fn start_commit(
        &self,
        base: &CommitId,
        journal_type: JournalType,
    ) -> StorageResult<Journal<'_>> {
        self.get_commit(base)?;
        let record = JournalRecord {
            journal_type,
            base: *base,
            other: None,
        };
        let journal_id = self.db.create_journal(record.clone())?;
        Ok(Journal::new(self, journal_id, record))
    }

    /// Starts a journal for a merge commit with parents `left` and `right`.
    /// The merged content is staged on top of `left`. Merge journals never
    /// survive a crash.
    pub fn start_merge_commit(
        &self,
        left: &CommitId,
        right: &CommitId,
    ) -> StorageResult<Journal<'_>> {
        self.get_commit(left)?;
        self.get_commit(right)?;
        let record = JournalRecord {
            journal_type: JournalType::Explicit,
            base: *left,
            other: Some(*right),
        };
        let journal_id = self.db.create_journal(record.clone())?;
        Ok(Journal::new(self, journal_id, record))
    }

    pub fn add_commit_watcher(&self, watcher: Box<dyn CommitWatcher>) -> WatcherHandle {
        let mut set = self.watchers.lock().unwrap();
        let handle = set.next_handle;
        set.next_handle += 1;
        set.watchers.push((handle, watcher));
        WatcherHandle(handle)
    }

    /// Removes a previously registered watcher. Returns whether it was
    /// still registered.
    pub fn remove_commit_watcher(&self, handle: WatcherHandle) -> bool {
        let mut set = self.watchers.lock().unwrap();
        let len_before = set.watchers.len();
        set.watchers.retain(|(id, _)| *id != handle.0);
        set.watchers.len() != len_before
    }

    fn notify_watchers(&self, commit: &Commit, source: ChangeSource) {
        let set = self.watchers.lock().unwrap();
        for (_, watcher) in &set.watchers {
            watcher.on_new_commit(commit, source);
        }
    }

    pub async fn add_commit_from_local(&self, commit: Commit) -> StorageResult<()> {
        self.add_commits(vec![commit], ChangeSource::Local, None).await
    }

    /// Decodes and inserts a batch of commits shipped in by sync. All of
    /// them are inserted in one metadata batch; watchers observe the batch
    /// only after it has been applied in full.
    pub async fn add_commits_from_sync(
        &self,
        ids_and_bytes: Vec<CommitIdAndBytes>,
    ) -> StorageResult<()> {
        let commits: Vec<Commit> = ids_and_bytes
            .into_iter()
            .map(|(id, bytes)| {
                Commit::from_storage_bytes(id, bytes)
                    .ok_or_else(|| StorageError::format(&id, "invalid commit storage bytes"))
            })
            .try_collect()?;
        self.add_commits(commits, ChangeSource::Sync, None).await
    }

    /// Inserts `commits` atomically: stores their bytes, makes each one a
    /// head, unseats their parents from the head set, and (for local
    /// commits) marks them unsynced. Re-adding a known commit is a no-op.
    async fn add_commits(
        &self,
        commits: Vec<Commit>,
        source: ChangeSource,
        finished_journal: Option<JournalId>,
    ) -> StorageResult<()> {
        let mut batch = Batch::new();
        let mut added = vec![];
        for commit in commits {
            let known = *commit.id() == FIRST_COMMIT_ID
                || self.db.commit_bytes(commit.id())?.is_some();
            if known {
                continue;
            }
            batch.add_commit(*commit.id(), commit.storage_bytes().to_vec());
            if source == ChangeSource::Local {
                batch.mark_commit_unsynced(*commit.id());
            }
            batch.add_head(*commit.id());
            for parent_id in commit.parent_ids() {
                batch.remove_head(*parent_id);
            }
            added.push(commit);
        }
        if let Some(journal_id) = finished_journal {
            batch.remove_journal(journal_id);
        }
        self.db.commit_batch(batch)?;

        for commit in &added {
            debug!(commit_id = %commit.id(), generation = commit.generation(), ?source, "added commit");
            if source == ChangeSource::Local {
                self.mark_reachable_objects_tracked(commit)?;
            }
        }
        for commit in &added {
            self.notify_watchers(commit, source);
        }
        Ok(())
    }

    /// Commits a journal: materializes its edits into a new tree, then
    /// inserts the resulting commit and drops the journal's records in one
    /// metadata batch.
    pub(crate) async fn commit_journal(
        &self,
        journal_id: JournalId,
        record: &JournalRecord,
    ) -> StorageResult<CommitId> {
        let changes: Vec<EntryChange> = self
            .db
            .journal_edits(journal_id)?
            .into_iter()
            .map(|(key, edit)| match edit {
                JournalEdit::Put {
                    object_id,
                    priority,
                } => EntryChange {
                    entry: Entry {
                        key,
                        object_id,
                        priority,
                    },
                    deleted: false,
                },
                JournalEdit::Delete => EntryChange {
                    entry: Entry {
                        key,
                        object_id: ObjectId::new([0; 32]),
                        priority: KeyPriority::Eager,
                    },
                    deleted: true,
                },
            })
            .collect();

        let base = self.get_commit(&record.base)?;
        let mut parents = vec![base];
        if let Some(other) = &record.other {
            parents.push(self.get_commit(other)?);
        }
        let base_root_id = *parents[0].root_id();
        let node_size = self.node_size()?;
        let (new_root_id, _new_nodes) =
            btree::apply_changes(self, &base_root_id, node_size, &changes).await?;
        let commit = Commit::from_content_and_parents(new_root_id, &parents);
        let commit_id = *commit.id();
        self.add_commits(vec![commit], ChangeSource::Local, Some(journal_id))
            .await?;
        Ok(commit_id)
    }

    pub fn get_unsynced_commits(&self) -> StorageResult<Vec<Commit>> {
        self.db
            .unsynced_commit_ids()?
            .iter()
            .map(|id| self.get_commit(id))
            .try_collect()
    }

    pub fn mark_commit_synced(&self, commit_id: &CommitId) -> StorageResult<()> {
        self.db.mark_commit_synced(commit_id)
    }

    pub fn get_delta_objects(&self, _commit_id: &CommitId) -> StorageResult<Vec<ObjectId>> {
        Err(StorageError::NotImplemented("get_delta_objects"))
    }

    /// Every object reachable from `commit_id` that has not been marked
    /// synced yet, in id order.
    pub fn get_unsynced_object_ids(&self, commit_id: &CommitId) -> StorageResult<Vec<ObjectId>> {
        let commit = self.get_commit(commit_id)?;
        let ids = btree::get_object_ids(&self.store, commit.root_id())?;
        ids.into_iter()
            .filter_map(|id| match self.db.is_object_synced(&id) {
                Ok(true) => None,
                Ok(false) => Some(Ok(id)),
                Err(err) => Some(Err(err)),
            })
            .collect()
    }

    pub fn mark_object_synced(&self, object_id: &ObjectId) -> StorageResult<()> {
        self.db.mark_object_synced(object_id)
    }

    pub fn set_sync_metadata(&self, data: &[u8]) -> StorageResult<()> {
        self.db.set_sync_metadata(data)
    }

    pub fn get_sync_metadata(&self) -> StorageResult<Option<Vec<u8>>> {
        self.db.sync_metadata()
    }

    pub fn set_sync_delegate(&self, delegate: Arc<dyn PageSyncDelegate>) {
        *self.sync_delegate.lock().unwrap() = Some(delegate);
    }

    /// Streams a locally produced value into the object store. The object
    /// is untracked until some commit references it.
    pub async fn add_object_from_local(
        &self,
        source: &mut (dyn AsyncRead + Send + Unpin),
        expected_size: i64,
    ) -> StorageResult<ObjectId> {
        let object_id = self.store.put_stream(source, expected_size).await?;
        self.untracked_objects.lock().unwrap().insert(object_id);
        Ok(object_id)
    }

    /// Streams an object fetched by sync into the object store, verifying
    /// that the bytes actually digest to `object_id`.
    pub async fn add_object_from_sync(
        &self,
        object_id: &ObjectId,
        source: &mut (dyn AsyncRead + Send + Unpin),
        expected_size: i64,
    ) -> StorageResult<()> {
        let actual_id = self.store.put_stream(source, expected_size).await?;
        if actual_id != *object_id {
            return Err(StorageError::format(
                object_id,
                format!("content digests to {}", actual_id.hex()),
            ));
        }
        Ok(())
    }

    /// Whether `object_id` was produced locally without any commit
    /// referencing it yet.
    pub fn object_is_untracked(&self, object_id: &ObjectId) -> bool {
        self.untracked_objects.lock().unwrap().contains(object_id)
    }

    fn mark_reachable_objects_tracked(&self, commit: &Commit) -> StorageResult<()> {
        {
            let untracked = self.untracked_objects.lock().unwrap();
            if untracked.is_empty() {
                return Ok(());
            }
        }
        let reachable = btree::get_object_ids(&self.store, commit.root_id())?;
        let mut untracked = self.untracked_objects.lock().unwrap();
        untracked.retain(|id| !reachable.contains(id));
        Ok(())
    }

    async fn get_object_from_sync(&self, object_id: &ObjectId) -> StorageResult<Object> {
        let delegate = self.sync_delegate.lock().unwrap().clone();
        let Some(delegate) = delegate else {
            return Err(StorageError::not_found(object_id));
        };
        let (size, mut stream) = delegate.get_object(object_id).await?;
        self.add_object_from_sync(object_id, &mut stream, size as i64)
            .await?;
        self.store.get_object_sync(object_id)
    }
}

#[async_trait]
impl ObjectStorage for PageStorage {
    /// Local lookup, escalating misses to the sync delegate.
    async fn get_object(&self, object_id: &ObjectId) -> StorageResult<Object> {
        match self.store.get_object_sync(object_id) {
            Err(StorageError::NotFound { .. }) => self.get_object_from_sync(object_id).await,
            result => result,
        }
    }

    fn get_object_sync(&self, object_id: &ObjectId) -> StorageResult<Object> {
        self.store.get_object_sync(object_id)
    }

    fn add_object_sync(&self, data: &[u8]) -> StorageResult<ObjectId> {
        self.store.put_bytes(data)
    }

    fn object_exists(&self, object_id: &ObjectId) -> StorageResult<bool> {
        self.store.object_exists(object_id)
    }
}
