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

use crate::db::JournalEdit;
use crate::db::JournalId;
use crate::db::JournalRecord;
use crate::object_id::CommitId;
use crate::object_id::ObjectId;
use crate::page_storage::PageStorage;
use crate::types::KeyPriority;
use crate::types::StorageResult;

/// An ordered batch of staged key edits scoped to a base commit (or two,
/// for a merge). Edits on the same key are last-write-wins. A journal ends
/// in exactly one of [`commit`](Self::commit) or
/// [`rollback`](Self::rollback), both of which consume it.
#[derive(Debug)]
pub struct Journal<'a> {
    page: &'a PageStorage,
    id: JournalId,
    record: JournalRecord,
}

impl<'a> Journal<'a> {
    pub(crate) fn new(page: &'a PageStorage, id: JournalId, record: JournalRecord) -> Self {
        Self { page, id, record }
    }

    pub fn id(&self) -> JournalId {
        self.id
    }

    pub fn base(&self) -> &CommitId {
        &self.record.base
    }

    /// Stages an insertion or update of `key`.
    pub fn put(
        &mut self,
        key: impl Into<BString>,
        object_id: ObjectId,
        priority: KeyPriority,
    ) -> StorageResult<()> {
        let key = key.into();
        self.page.db().put_journal_edit(
            self.id,
            key.as_ref(),
            JournalEdit::Put {
                object_id,
                priority,
            },
        )
    }

    /// Stages a deletion of `key`. Deleting a key the base tree doesn't
    /// contain is a no-op at commit time.
    pub fn delete(&mut self, key: impl Into<BString>) -> StorageResult<()> {
        let key = key.into();
        self.page
            .db()
            .put_journal_edit(self.id, key.as_ref(), JournalEdit::Delete)
    }

    /// Materializes the staged edits into a new commit on top of the
    /// journal's base. On success the journal's records are gone from the
    /// metadata map, atomically with the commit's insertion.
    pub async fn commit(self) -> StorageResult<CommitId> {
        self.page.commit_journal(self.id, &self.record).await
    }

    /// Discards the journal and its staged edits without committing.
    pub fn rollback(self) -> StorageResult<()> {
        self.page.db().remove_journal(self.id)
    }
}
