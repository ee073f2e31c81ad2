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

//! Typed surface of the page's metadata map.
//!
//! The metadata map records everything about a page that is not a
//! content-addressed blob: heads, commit storage bytes, the unsynced sets,
//! journals and their staged edits, sync metadata, and the node-size
//! configuration. The map itself is an external collaborator (an ordered
//! transactional key-value store); [`PageDb`] is the contract this engine
//! programs against and [`MemoryPageDb`] is the in-process implementation.
//!
//! All mutations that must be atomic go through a [`Batch`]; a batch either
//! applies entirely or leaves the map untouched.

#![expect(missing_docs)]

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt::Debug;
use std::sync::Mutex;

use bstr::BStr;
use bstr::BString;

use crate::object_id::CommitId;
use crate::object_id::ObjectId;
use crate::types::JournalType;
use crate::types::KeyPriority;
use crate::types::StorageResult;

pub type JournalId = u64;

/// The durable part of a journal: its type and base commit(s).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalRecord {
    pub journal_type: JournalType,
    pub base: CommitId,
    /// Second parent for merge journals.
    pub other: Option<CommitId>,
}

/// A staged edit inside a journal, keyed by the user key it affects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalEdit {
    Put {
        object_id: ObjectId,
        priority: KeyPriority,
    },
    Delete,
}

/// An atomic group of metadata mutations.
#[derive(Debug, Default)]
pub struct Batch {
    ops: Vec<BatchOp>,
}

#[derive(Debug)]
pub enum BatchOp {
    AddCommit { id: CommitId, bytes: Vec<u8> },
    MarkCommitUnsynced { id: CommitId },
    AddHead { id: CommitId },
    RemoveHead { id: CommitId },
    RemoveJournal { id: JournalId },
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_commit(&mut self, id: CommitId, bytes: Vec<u8>) {
        self.ops.push(BatchOp::AddCommit { id, bytes });
    }

    pub fn mark_commit_unsynced(&mut self, id: CommitId) {
        self.ops.push(BatchOp::MarkCommitUnsynced { id });
    }

    pub fn add_head(&mut self, id: CommitId) {
        self.ops.push(BatchOp::AddHead { id });
    }

    pub fn remove_head(&mut self, id: CommitId) {
        self.ops.push(BatchOp::RemoveHead { id });
    }

    pub fn remove_journal(&mut self, id: JournalId) {
        self.ops.push(BatchOp::RemoveJournal { id });
    }

    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }
}

/// Contract of the page metadata map.
pub trait PageDb: Send + Sync + Debug {
    fn heads(&self) -> StorageResult<Vec<CommitId>>;
    fn add_head(&self, id: &CommitId) -> StorageResult<()>;

    fn commit_bytes(&self, id: &CommitId) -> StorageResult<Option<Vec<u8>>>;

    /// Ids of commits created locally and not yet uploaded, in id order.
    fn unsynced_commit_ids(&self) -> StorageResult<Vec<CommitId>>;
    fn mark_commit_synced(&self, id: &CommitId) -> StorageResult<()>;

    fn is_object_synced(&self, id: &ObjectId) -> StorageResult<bool>;
    fn mark_object_synced(&self, id: &ObjectId) -> StorageResult<()>;

    fn sync_metadata(&self) -> StorageResult<Option<Vec<u8>>>;
    fn set_sync_metadata(&self, data: &[u8]) -> StorageResult<()>;

    fn node_size(&self) -> StorageResult<Option<usize>>;
    fn set_node_size(&self, size: usize) -> StorageResult<()>;

    fn create_journal(&self, record: JournalRecord) -> StorageResult<JournalId>;
    fn journal_record(&self, id: JournalId) -> StorageResult<Option<JournalRecord>>;
    /// All live journal ids, in creation order.
    fn journal_ids(&self) -> StorageResult<Vec<JournalId>>;
    /// Stages an edit. A later edit for the same key supersedes the earlier
    /// one.
    fn put_journal_edit(&self, id: JournalId, key: &BStr, edit: JournalEdit) -> StorageResult<()>;
    /// The journal's staged edits in ascending key order.
    fn journal_edits(&self, id: JournalId) -> StorageResult<Vec<(BString, JournalEdit)>>;
    fn remove_journal(&self, id: JournalId) -> StorageResult<()>;

    /// Applies all mutations in `batch` atomically.
    fn commit_batch(&self, batch: Batch) -> StorageResult<()>;
}

/// In-process implementation of [`PageDb`] over ordered maps.
#[derive(Debug, Default)]
pub struct MemoryPageDb {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    heads: BTreeSet<CommitId>,
    commits: BTreeMap<CommitId, Vec<u8>>,
    unsynced_commits: BTreeSet<CommitId>,
    synced_objects: BTreeSet<ObjectId>,
    sync_metadata: Option<Vec<u8>>,
    node_size: Option<usize>,
    next_journal_id: JournalId,
    journals: BTreeMap<JournalId, JournalRecord>,
    journal_edits: BTreeMap<JournalId, BTreeMap<BString, JournalEdit>>,
}

impl Inner {
    fn apply(&mut self, op: BatchOp) {
        match op {
            BatchOp::AddCommit { id, bytes } => {
                self.commits.insert(id, bytes);
            }
            BatchOp::MarkCommitUnsynced { id } => {
                self.unsynced_commits.insert(id);
            }
            BatchOp::AddHead { id } => {
                self.heads.insert(id);
            }
            BatchOp::RemoveHead { id } => {
                self.heads.remove(&id);
            }
            BatchOp::RemoveJournal { id } => {
                self.journals.remove(&id);
                self.journal_edits.remove(&id);
            }
        }
    }
}

impl MemoryPageDb {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PageDb for MemoryPageDb {
    fn heads(&self) -> StorageResult<Vec<CommitId>> {
        Ok(self.inner.lock().unwrap().heads.iter().copied().collect())
    }

    fn add_head(&self, id: &CommitId) -> StorageResult<()> {
        self.inner.lock().unwrap().heads.insert(*id);
        Ok(())
    }

    fn commit_bytes(&self, id: &CommitId) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.inner.lock().unwrap().commits.get(id).cloned())
    }

    fn unsynced_commit_ids(&self) -> StorageResult<Vec<CommitId>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .unsynced_commits
            .iter()
            .copied()
            .collect())
    }

    fn mark_commit_synced(&self, id: &CommitId) -> StorageResult<()> {
        self.inner.lock().unwrap().unsynced_commits.remove(id);
        Ok(())
    }

    fn is_object_synced(&self, id: &ObjectId) -> StorageResult<bool> {
        Ok(self.inner.lock().unwrap().synced_objects.contains(id))
    }

    fn mark_object_synced(&self, id: &ObjectId) -> StorageResult<()> {
        self.inner.lock().unwrap().synced_objects.insert(*id);
        Ok(())
    }

    fn sync_metadata(&self) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.inner.lock().unwrap().sync_metadata.clone())
    }

    fn set_sync_metadata(&self, data: &[u8]) -> StorageResult<()> {
        self.inner.lock().unwrap().sync_metadata = Some(data.to_vec());
        Ok(())
    }

    fn node_size(&self) -> StorageResult<Option<usize>> {
        Ok(self.inner.lock().unwrap().node_size)
    }

    fn set_node_size(&self, size: usize) -> StorageResult<()> {
        self.inner.lock().unwrap().node_size = Some(size);
        Ok(())
    }

    fn create_journal(&self, record: JournalRecord) -> StorageResult<JournalId> {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_journal_id;
        inner.next_journal_id += 1;
        inner.journals.insert(id, record);
        inner.journal_edits.insert(id, BTreeMap::new());
        Ok(id)
    }

    fn journal_record(&self, id: JournalId) -> StorageResult<Option<JournalRecord>> {
        Ok(self.inner.lock().unwrap().journals.get(&id).cloned())
    }

    fn journal_ids(&self) -> StorageResult<Vec<JournalId>> {
        Ok(self.inner.lock().unwrap().journals.keys().copied().collect())
    }

    fn put_journal_edit(&self, id: JournalId, key: &BStr, edit: JournalEdit) -> StorageResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .journal_edits
            .entry(id)
            .or_default()
            .insert(key.to_owned(), edit);
        Ok(())
    }

    fn journal_edits(&self, id: JournalId) -> StorageResult<Vec<(BString, JournalEdit)>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .journal_edits
            .get(&id)
            .map(|edits| edits.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    fn remove_journal(&self, id: JournalId) -> StorageResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.journals.remove(&id);
        inner.journal_edits.remove(&id);
        Ok(())
    }

    fn commit_batch(&self, batch: Batch) -> StorageResult<()> {
        let mut inner = self.inner.lock().unwrap();
        for op in batch.into_ops() {
            inner.apply(op);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commit_id(byte: u8) -> CommitId {
        CommitId::new([byte; 32])
    }

    #[test]
    fn test_heads() {
        let db = MemoryPageDb::new();
        assert_eq!(db.heads().unwrap(), vec![]);
        db.add_head(&commit_id(2)).unwrap();
        db.add_head(&commit_id(1)).unwrap();
        assert_eq!(db.heads().unwrap(), vec![commit_id(1), commit_id(2)]);
    }

    #[test]
    fn test_batch_updates_heads_and_commits() {
        let db = MemoryPageDb::new();
        db.add_head(&commit_id(1)).unwrap();

        let mut batch = Batch::new();
        batch.add_commit(commit_id(2), b"bytes".to_vec());
        batch.mark_commit_unsynced(commit_id(2));
        batch.add_head(commit_id(2));
        batch.remove_head(commit_id(1));
        db.commit_batch(batch).unwrap();

        assert_eq!(db.heads().unwrap(), vec![commit_id(2)]);
        assert_eq!(db.commit_bytes(&commit_id(2)).unwrap(), Some(b"bytes".to_vec()));
        assert_eq!(db.unsynced_commit_ids().unwrap(), vec![commit_id(2)]);
        db.mark_commit_synced(&commit_id(2)).unwrap();
        assert_eq!(db.unsynced_commit_ids().unwrap(), vec![]);
    }

    #[test]
    fn test_journal_edits_last_write_wins_and_sorted() {
        let db = MemoryPageDb::new();
        let journal_id = db
            .create_journal(JournalRecord {
                journal_type: JournalType::Implicit,
                base: commit_id(0),
                other: None,
            })
            .unwrap();
        let put = |id: ObjectId| JournalEdit::Put {
            object_id: id,
            priority: KeyPriority::Eager,
        };
        db.put_journal_edit(journal_id, "b".into(), put(ObjectId::new([1; 32])))
            .unwrap();
        db.put_journal_edit(journal_id, "a".into(), put(ObjectId::new([2; 32])))
            .unwrap();
        db.put_journal_edit(journal_id, "b".into(), JournalEdit::Delete)
            .unwrap();

        let edits = db.journal_edits(journal_id).unwrap();
        assert_eq!(
            edits,
            vec![
                (BString::from("a"), put(ObjectId::new([2; 32]))),
                (BString::from("b"), JournalEdit::Delete),
            ]
        );

        db.remove_journal(journal_id).unwrap();
        assert_eq!(db.journal_ids().unwrap(), vec![]);
        assert_eq!(db.journal_edits(journal_id).unwrap(), vec![]);
    }
}
