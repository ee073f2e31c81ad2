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

use std::cmp::Ordering;

use crate::btree::iterator::BTreeIterator;
use crate::object_id::ObjectId;
use crate::store::ObjectStorage;
use crate::types::EntryChange;
use crate::types::StorageResult;

enum Emit {
    Done,
    DeletedLeft,
    AddedRight,
    Changed { identical: bool },
}

/// Walks two trees in lockstep and yields the changes that turn `left_root`
/// into `right_root`, in ascending key order:
///
/// - key only in the left tree: the left entry, deleted;
/// - key only in the right tree: the right entry;
/// - key in both with a different value or priority: the right entry;
/// - identical entries are suppressed.
///
/// When both walks stand before the same subtree (equal node ids) that
/// subtree is skipped wholesale. Returning `false` from `on_change` stops
/// the walk without error.
pub async fn for_each_diff(
    store: &dyn ObjectStorage,
    left_root: &ObjectId,
    right_root: &ObjectId,
    mut on_change: impl FnMut(EntryChange) -> bool,
) -> StorageResult<()> {
    if left_root == right_root {
        return Ok(());
    }
    let mut left = BTreeIterator::begin(store, left_root).await?;
    let mut right = BTreeIterator::begin(store, right_root).await?;
    let mut left_entry = None;
    let mut right_entry = None;
    loop {
        if left_entry.is_none() && right_entry.is_none() {
            // Both sides advance together; shared subtrees contribute
            // nothing to the diff.
            loop {
                match (left.pending_descent(), right.pending_descent()) {
                    (Some(left_id), Some(right_id)) if left_id == right_id => {
                        left.skip_descent();
                        right.skip_descent();
                    }
                    _ => break,
                }
            }
        }
        if left_entry.is_none() {
            left_entry = left.next().await?.map(|(entry, _)| entry);
        }
        if right_entry.is_none() {
            right_entry = right.next().await?.map(|(entry, _)| entry);
        }

        let emit = match (&left_entry, &right_entry) {
            (None, None) => Emit::Done,
            (Some(_), None) => Emit::DeletedLeft,
            (None, Some(_)) => Emit::AddedRight,
            (Some(left), Some(right)) => match left.key.cmp(&right.key) {
                Ordering::Less => Emit::DeletedLeft,
                Ordering::Greater => Emit::AddedRight,
                Ordering::Equal => Emit::Changed {
                    identical: left == right,
                },
            },
        };
        let change = match emit {
            Emit::Done => break,
            Emit::DeletedLeft => EntryChange {
                entry: left_entry.take().unwrap(),
                deleted: true,
            },
            Emit::AddedRight => EntryChange {
                entry: right_entry.take().unwrap(),
                deleted: false,
            },
            Emit::Changed { identical } => {
                left_entry.take();
                let entry = right_entry.take().unwrap();
                if identical {
                    continue;
                }
                EntryChange {
                    entry,
                    deleted: false,
                }
            }
        };
        if !on_change(change) {
            return Ok(());
        }
    }
    Ok(())
}
