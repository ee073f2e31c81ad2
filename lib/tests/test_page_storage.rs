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

use std::sync::Arc;
use std::sync::Mutex;

use assert_matches::assert_matches;
use bstr::BStr;
use pagestore_lib::btree;
use pagestore_lib::btree::TreeNode;
use pagestore_lib::commit::Commit;
use pagestore_lib::commit::FIRST_COMMIT_ID;
use pagestore_lib::db::PageDb as _;
use pagestore_lib::object_id::CommitId;
use pagestore_lib::object_id::ObjectId;
use pagestore_lib::page_storage::CommitWatcher;
use pagestore_lib::page_storage::DEFAULT_NODE_SIZE;
use pagestore_lib::store::ObjectStorage as _;
use pagestore_lib::types::ChangeSource;
use pagestore_lib::types::Entry;
use pagestore_lib::types::JournalType;
use pagestore_lib::types::KeyPriority;
use pagestore_lib::types::StorageError;
use pollster::FutureExt as _;
use pretty_assertions::assert_eq;
use testutils::TestPage;
use testutils::TestSyncDelegate;
use testutils::test_key;

fn scan(page: &TestPage, commit_id: &CommitId) -> Vec<Entry> {
    let commit = page.storage.get_commit(commit_id).unwrap();
    let mut entries = vec![];
    btree::for_each_entry(&page.storage, commit.root_id(), BStr::new(b""), |entry, _| {
        entries.push(entry.clone());
        true
    })
    .block_on()
    .unwrap();
    entries
}

#[test]
fn test_init_seeds_first_commit_head() {
    let page = TestPage::init();
    assert_eq!(page.storage.get_head_commit_ids().unwrap(), vec![FIRST_COMMIT_ID]);
    assert_eq!(page.storage.node_size().unwrap(), DEFAULT_NODE_SIZE);

    let first = page.storage.get_commit(&FIRST_COMMIT_ID).unwrap();
    assert_eq!(first.generation(), 0);
    assert!(first.parent_ids().is_empty());
    assert_eq!(scan(&page, &FIRST_COMMIT_ID), vec![]);
}

#[test]
fn test_put_and_commit() {
    let page = TestPage::init();
    let value_id = page.storage.add_object_sync(b"value1").unwrap();

    let mut journal = page
        .storage
        .start_commit(&FIRST_COMMIT_ID, JournalType::Explicit)
        .unwrap();
    journal.put("k", value_id, KeyPriority::Eager).unwrap();
    let commit_id = journal.commit().block_on().unwrap();

    assert_eq!(page.storage.get_head_commit_ids().unwrap(), vec![commit_id]);
    let commit = page.storage.get_commit(&commit_id).unwrap();
    assert_eq!(commit.parent_ids(), &[FIRST_COMMIT_ID]);
    assert_eq!(commit.generation(), 1);
    assert_eq!(
        scan(&page, &commit_id),
        vec![Entry::new("k", value_id, KeyPriority::Eager)]
    );
}

#[test]
fn test_delete_and_commit() {
    let page = TestPage::init();
    let value_id = page.storage.add_object_sync(b"value1").unwrap();

    let mut journal = page
        .storage
        .start_commit(&FIRST_COMMIT_ID, JournalType::Explicit)
        .unwrap();
    journal.put("k", value_id, KeyPriority::Eager).unwrap();
    let first = journal.commit().block_on().unwrap();

    let mut journal = page.storage.start_commit(&first, JournalType::Explicit).unwrap();
    journal.delete("k").unwrap();
    let second = journal.commit().block_on().unwrap();

    assert_eq!(page.storage.get_head_commit_ids().unwrap(), vec![second]);
    assert_eq!(scan(&page, &second), vec![]);
    assert_eq!(page.storage.get_commit(&second).unwrap().generation(), 2);
}

#[test]
fn test_journal_edits_are_last_write_wins() {
    let page = TestPage::init();
    let old_value = page.storage.add_object_sync(b"old").unwrap();
    let new_value = page.storage.add_object_sync(b"new").unwrap();

    let mut journal = page
        .storage
        .start_commit(&FIRST_COMMIT_ID, JournalType::Explicit)
        .unwrap();
    journal.put("a", old_value, KeyPriority::Eager).unwrap();
    journal.put("a", new_value, KeyPriority::Lazy).unwrap();
    journal.delete("b").unwrap();
    journal.put("b", new_value, KeyPriority::Eager).unwrap();
    let commit_id = journal.commit().block_on().unwrap();

    assert_eq!(
        scan(&page, &commit_id),
        vec![
            Entry::new("a", new_value, KeyPriority::Lazy),
            Entry::new("b", new_value, KeyPriority::Eager),
        ]
    );
}

#[test]
fn test_journal_rollback() {
    let page = TestPage::init();
    let value_id = page.storage.add_object_sync(b"value1").unwrap();

    let mut journal = page
        .storage
        .start_commit(&FIRST_COMMIT_ID, JournalType::Explicit)
        .unwrap();
    journal.put("k", value_id, KeyPriority::Eager).unwrap();
    journal.rollback().unwrap();

    assert_eq!(page.storage.get_head_commit_ids().unwrap(), vec![FIRST_COMMIT_ID]);
    assert_eq!(page.db.journal_ids().unwrap(), vec![]);
}

#[test]
fn test_many_entries_in_one_journal() {
    let page = TestPage::init();
    page.db.set_node_size(4).unwrap();

    let mut journal = page
        .storage
        .start_commit(&FIRST_COMMIT_ID, JournalType::Explicit)
        .unwrap();
    let mut expected = vec![];
    for i in 0..11 {
        let value_id = page
            .storage
            .add_object_sync(format!("object{i:02}").as_bytes())
            .unwrap();
        journal.put(test_key(i), value_id, KeyPriority::Eager).unwrap();
        expected.push(Entry::new(test_key(i), value_id, KeyPriority::Eager));
    }
    let commit_id = journal.commit().block_on().unwrap();

    assert_eq!(scan(&page, &commit_id), expected);
    // Three leaves plus a two-entry root.
    let commit = page.storage.get_commit(&commit_id).unwrap();
    let root = TreeNode::from_id_sync(&page.storage, commit.root_id()).unwrap();
    assert_eq!(root.key_count(), 2);
    let object_ids = btree::get_object_ids(&page.storage, commit.root_id()).unwrap();
    assert_eq!(object_ids.len(), 11 + 4);
}

#[test]
fn test_implicit_journal_replayed_on_init() {
    let page = TestPage::init();
    let value_id = page.storage.add_object_sync(b"value1").unwrap();

    let mut journal = page
        .storage
        .start_commit(&FIRST_COMMIT_ID, JournalType::Implicit)
        .unwrap();
    journal.put("k", value_id, KeyPriority::Eager).unwrap();
    // The journal is dropped uncommitted, as a crash would leave it.
    drop(journal);

    let page = page.reinit().unwrap();
    assert_eq!(page.db.journal_ids().unwrap(), vec![]);
    let heads = page.storage.get_head_commit_ids().unwrap();
    assert_eq!(heads.len(), 1);
    assert_ne!(heads[0], FIRST_COMMIT_ID);
    assert_eq!(
        scan(&page, &heads[0]),
        vec![Entry::new("k", value_id, KeyPriority::Eager)]
    );
}

#[test]
fn test_explicit_journal_dropped_on_init() {
    let page = TestPage::init();
    let value_id = page.storage.add_object_sync(b"value1").unwrap();

    let mut journal = page
        .storage
        .start_commit(&FIRST_COMMIT_ID, JournalType::Explicit)
        .unwrap();
    journal.put("k", value_id, KeyPriority::Eager).unwrap();
    drop(journal);

    let page = page.reinit().unwrap();
    assert_eq!(page.db.journal_ids().unwrap(), vec![]);
    assert_eq!(page.storage.get_head_commit_ids().unwrap(), vec![FIRST_COMMIT_ID]);
}

#[derive(Default)]
struct RecordingWatcher {
    seen: Mutex<Vec<(CommitId, ChangeSource)>>,
}

#[derive(Clone, Default)]
struct RecordingWatcherHandle(Arc<RecordingWatcher>);

impl CommitWatcher for RecordingWatcherHandle {
    fn on_new_commit(&self, commit: &Commit, source: ChangeSource) {
        self.0.seen.lock().unwrap().push((*commit.id(), source));
    }
}

#[test]
fn test_watchers() {
    let page = TestPage::init();
    let watcher = RecordingWatcherHandle::default();
    let handle = page.storage.add_commit_watcher(Box::new(watcher.clone()));

    let value_id = page.storage.add_object_sync(b"value1").unwrap();
    let mut journal = page
        .storage
        .start_commit(&FIRST_COMMIT_ID, JournalType::Explicit)
        .unwrap();
    journal.put("k", value_id, KeyPriority::Eager).unwrap();
    let commit_id = journal.commit().block_on().unwrap();
    assert_eq!(
        watcher.0.seen.lock().unwrap().clone(),
        vec![(commit_id, ChangeSource::Local)]
    );

    assert!(page.storage.remove_commit_watcher(handle));
    assert!(!page.storage.remove_commit_watcher(handle));

    let mut journal = page.storage.start_commit(&commit_id, JournalType::Explicit).unwrap();
    journal.delete("k").unwrap();
    journal.commit().block_on().unwrap();
    assert_eq!(watcher.0.seen.lock().unwrap().len(), 1);
}

#[test]
fn test_add_commits_from_sync() {
    let page = TestPage::init();
    let watcher = RecordingWatcherHandle::default();
    page.storage.add_commit_watcher(Box::new(watcher.clone()));

    let base = page.storage.get_commit(&FIRST_COMMIT_ID).unwrap();
    let commit = Commit::from_content_and_parents(*TreeNode::empty_node_id(), &[base]);
    page.storage
        .add_commits_from_sync(vec![(*commit.id(), commit.storage_bytes().to_vec())])
        .block_on()
        .unwrap();

    // The new commit replaced its parent as head and is already synced.
    assert_eq!(page.storage.get_head_commit_ids().unwrap(), vec![*commit.id()]);
    assert!(page.storage.get_unsynced_commits().unwrap().is_empty());
    assert_eq!(
        watcher.0.seen.lock().unwrap().clone(),
        vec![(*commit.id(), ChangeSource::Sync)]
    );

    // Re-adding the same commit is idempotent and does not notify again.
    page.storage
        .add_commits_from_sync(vec![(*commit.id(), commit.storage_bytes().to_vec())])
        .block_on()
        .unwrap();
    assert_eq!(page.storage.get_head_commit_ids().unwrap(), vec![*commit.id()]);
    assert_eq!(watcher.0.seen.lock().unwrap().len(), 1);
}

#[test]
fn test_add_commits_from_sync_rejects_bad_bytes() {
    let page = TestPage::init();
    let result = page
        .storage
        .add_commits_from_sync(vec![(CommitId::new([7; 32]), b"garbage".to_vec())])
        .block_on();
    assert_matches!(result, Err(StorageError::Format { .. }));
    assert_eq!(page.storage.get_head_commit_ids().unwrap(), vec![FIRST_COMMIT_ID]);
}

#[test]
fn test_get_commit_not_found() {
    let page = TestPage::init();
    assert_matches!(
        page.storage.get_commit(&CommitId::new([9; 32])),
        Err(StorageError::NotFound { .. })
    );
}

#[test]
fn test_unsynced_commits() {
    let page = TestPage::init();
    let value_id = page.storage.add_object_sync(b"value1").unwrap();
    let mut journal = page
        .storage
        .start_commit(&FIRST_COMMIT_ID, JournalType::Explicit)
        .unwrap();
    journal.put("k", value_id, KeyPriority::Eager).unwrap();
    let commit_id = journal.commit().block_on().unwrap();

    let unsynced = page.storage.get_unsynced_commits().unwrap();
    assert_eq!(unsynced.len(), 1);
    assert_eq!(unsynced[0].id(), &commit_id);

    page.storage.mark_commit_synced(&commit_id).unwrap();
    assert!(page.storage.get_unsynced_commits().unwrap().is_empty());
}

#[test]
fn test_unsynced_object_ids() {
    let page = TestPage::init();
    let value_id = page.storage.add_object_sync(b"value1").unwrap();
    let mut journal = page
        .storage
        .start_commit(&FIRST_COMMIT_ID, JournalType::Explicit)
        .unwrap();
    journal.put("k", value_id, KeyPriority::Eager).unwrap();
    let commit_id = journal.commit().block_on().unwrap();

    // One root node and one value.
    let unsynced = page.storage.get_unsynced_object_ids(&commit_id).unwrap();
    assert_eq!(unsynced.len(), 2);
    assert!(unsynced.contains(&value_id));

    page.storage.mark_object_synced(&value_id).unwrap();
    let unsynced = page.storage.get_unsynced_object_ids(&commit_id).unwrap();
    assert_eq!(unsynced.len(), 1);
    assert!(!unsynced.contains(&value_id));
}

#[test]
fn test_get_delta_objects_is_not_implemented() {
    let page = TestPage::init();
    assert_matches!(
        page.storage.get_delta_objects(&FIRST_COMMIT_ID),
        Err(StorageError::NotImplemented(_))
    );
}

#[test]
fn test_sync_metadata() {
    let page = TestPage::init();
    assert_eq!(page.storage.get_sync_metadata().unwrap(), None);
    page.storage.set_sync_metadata(b"cloud position").unwrap();
    assert_eq!(
        page.storage.get_sync_metadata().unwrap(),
        Some(b"cloud position".to_vec())
    );
}

#[test]
fn test_untracked_objects() {
    let page = TestPage::init();
    let mut source = std::io::Cursor::new(b"value1".to_vec());
    let tracked_id = page.storage.add_object_from_local(&mut source, 6).block_on().unwrap();
    let mut source = std::io::Cursor::new(b"value2".to_vec());
    let loose_id = page.storage.add_object_from_local(&mut source, -1).block_on().unwrap();
    assert!(page.storage.object_is_untracked(&tracked_id));
    assert!(page.storage.object_is_untracked(&loose_id));

    let mut journal = page
        .storage
        .start_commit(&FIRST_COMMIT_ID, JournalType::Explicit)
        .unwrap();
    journal.put("k", tracked_id, KeyPriority::Eager).unwrap();
    journal.commit().block_on().unwrap();

    // The committed value is tracked now; the unreferenced one is not.
    assert!(!page.storage.object_is_untracked(&tracked_id));
    assert!(page.storage.object_is_untracked(&loose_id));
}

#[test]
fn test_get_object_escalates_to_sync() {
    let page = TestPage::init();
    let delegate = Arc::new(TestSyncDelegate::new());
    let remote_id = delegate.add_object(b"remote data");
    page.storage.set_sync_delegate(delegate.clone());

    assert!(!page.storage.object_exists(&remote_id).unwrap());
    let object = page.storage.get_object(&remote_id).block_on().unwrap();
    assert_eq!(object.data(), b"remote data");
    assert_eq!(delegate.request_count(), 1);

    // The fetched object is now local; sync is not asked again.
    assert!(page.storage.object_exists(&remote_id).unwrap());
    page.storage.get_object(&remote_id).block_on().unwrap();
    assert_eq!(delegate.request_count(), 1);
}

#[test]
fn test_get_object_without_delegate_is_not_found() {
    let page = TestPage::init();
    assert_matches!(
        page.storage.get_object(&ObjectId::new([5; 32])).block_on(),
        Err(StorageError::NotFound { .. })
    );
}

#[test]
fn test_get_object_from_sync_verifies_content() {
    let page = TestPage::init();
    let delegate = Arc::new(TestSyncDelegate::new());
    // The delegate serves data whose digest is not the requested id.
    let bogus_id = ObjectId::new([6; 32]);
    delegate.add_object_with_id(bogus_id, b"not what was asked for");
    let real_id = delegate.add_object(b"actual bytes");
    page.storage.set_sync_delegate(delegate.clone());

    assert_matches!(
        page.storage.get_object(&bogus_id).block_on(),
        Err(StorageError::Format { .. })
    );
    page.storage.get_object(&real_id).block_on().unwrap();
}

#[test]
fn test_eager_values_fetched_lazy_skipped() {
    let page = TestPage::init();
    let delegate = Arc::new(TestSyncDelegate::new());
    let eager_id = delegate.add_object(b"eager value");
    let lazy_id = delegate.add_object(b"lazy value");
    page.storage.set_sync_delegate(delegate.clone());

    let mut journal = page
        .storage
        .start_commit(&FIRST_COMMIT_ID, JournalType::Explicit)
        .unwrap();
    journal.put("eager", eager_id, KeyPriority::Eager).unwrap();
    journal.put("lazy", lazy_id, KeyPriority::Lazy).unwrap();
    let commit_id = journal.commit().block_on().unwrap();
    let commit = page.storage.get_commit(&commit_id).unwrap();

    btree::get_objects_from_sync(&page.storage, commit.root_id())
        .block_on()
        .unwrap();

    // Only the eager value was missing locally and fetched.
    assert_eq!(delegate.requests.lock().unwrap().clone(), vec![eager_id]);
    assert!(page.storage.object_exists(&eager_id).unwrap());
    assert!(!page.storage.object_exists(&lazy_id).unwrap());
}

#[test]
fn test_merge_commit() {
    let page = TestPage::init();
    let value_a = page.storage.add_object_sync(b"a").unwrap();
    let value_b = page.storage.add_object_sync(b"b").unwrap();

    let mut journal = page
        .storage
        .start_commit(&FIRST_COMMIT_ID, JournalType::Explicit)
        .unwrap();
    journal.put("a", value_a, KeyPriority::Eager).unwrap();
    let left = journal.commit().block_on().unwrap();

    let mut journal = page
        .storage
        .start_commit(&FIRST_COMMIT_ID, JournalType::Explicit)
        .unwrap();
    journal.put("b", value_b, KeyPriority::Eager).unwrap();
    let right = journal.commit().block_on().unwrap();

    let mut journal = page.storage.start_merge_commit(&left, &right).unwrap();
    journal.put("b", value_b, KeyPriority::Eager).unwrap();
    let merge = journal.commit().block_on().unwrap();

    let commit = page.storage.get_commit(&merge).unwrap();
    assert_eq!(commit.parent_ids(), &[left, right]);
    assert_eq!(commit.generation(), 2);
    assert_eq!(page.storage.get_head_commit_ids().unwrap(), vec![merge]);
    assert_eq!(
        scan(&page, &merge),
        vec![
            Entry::new("a", value_a, KeyPriority::Eager),
            Entry::new("b", value_b, KeyPriority::Eager),
        ]
    );
}
