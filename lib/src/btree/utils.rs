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

//! Whole-tree algorithms: bulk edits, reachability, and sync prefetch.

#![expect(missing_docs)]

use std::collections::BTreeSet;
use std::collections::HashSet;

use bstr::BStr;
use futures::future::BoxFuture;

use crate::btree::tree_node::FinishResult;
use crate::btree::tree_node::TreeNode;
use crate::object_id::ObjectId;
use crate::store::ObjectStorage;
use crate::types::EntryChange;
use crate::types::KeyPriority;
use crate::types::StorageResult;

/// Rebuilds the tree rooted at `root_id` by merging `changes` into it,
/// splitting and merging nodes as needed while sharing every unmodified
/// subtree with the input tree.
///
/// `changes` must be sorted by strictly ascending key. Returns the new root
/// id together with the ids of all nodes written in the process. An empty
/// change stream returns the input root untouched; deleting an absent key is
/// a no-op.
pub async fn apply_changes(
    store: &dyn ObjectStorage,
    root_id: &ObjectId,
    node_size: usize,
    changes: &[EntryChange],
) -> StorageResult<(ObjectId, HashSet<ObjectId>)> {
    debug_assert!(changes.windows(2).all(|w| w[0].entry.key < w[1].entry.key));
    let mut new_nodes = HashSet::new();
    if changes.is_empty() {
        return Ok((*root_id, new_nodes));
    }
    let root = TreeNode::from_id(store, root_id).await?;
    let result = apply_node(store, &root, changes, node_size, true, None, &mut new_nodes).await?;
    match result {
        FinishResult::NewRoot(id) => Ok((id, new_nodes)),
        FinishResult::Parent(_) => unreachable!("the root never reports to a parent"),
    }
}

/// Applies a change slice to the subtree rooted at `node`.
///
/// Changes addressed to one child are batched into a single recursion; a
/// deletion of an entry merges the subtrees on both sides of it and replays
/// the surviving in-range changes against the merged subtree.
fn apply_node<'a>(
    store: &'a dyn ObjectStorage,
    node: &'a TreeNode,
    changes: &'a [EntryChange],
    node_size: usize,
    is_root: bool,
    max_key: Option<&'a BStr>,
    new_nodes: &'a mut HashSet<ObjectId>,
) -> BoxFuture<'a, StorageResult<FinishResult>> {
    Box::pin(async move {
        let mut mutation = node.start_mutation();
        let mut i = 0;
        while i < changes.len() {
            let change = &changes[i];
            if let Ok(_index) = node.find_key_or_child(change.entry.key.as_ref())
                && !change.deleted
            {
                mutation.update_entry(change.entry.clone());
                i += 1;
                continue;
            }

            // Either a run of changes addressed to a single child, or a
            // deletion group: one or more adjacent entry deletions plus all
            // changes falling between them.
            let mut slot = match node.find_key_or_child(change.entry.key.as_ref()) {
                Ok(index) => index,
                Err(index) => index,
            };
            let first_slot = slot;
            let mut deleted_entries: Vec<usize> = vec![];
            let mut sub_changes: Vec<EntryChange> = vec![];
            while i < changes.len() {
                let change = &changes[i];
                match node.find_key_or_child(change.entry.key.as_ref()) {
                    Err(index) if index == slot => {
                        sub_changes.push(change.clone());
                        i += 1;
                    }
                    Ok(index) if change.deleted && index == slot => {
                        deleted_entries.push(index);
                        slot = index + 1;
                        i += 1;
                    }
                    _ => break,
                }
            }
            let upper = if slot < node.key_count() {
                Some(node.entry(slot).key.as_ref())
            } else {
                max_key
            };

            if deleted_entries.is_empty() {
                match node.child_id(first_slot) {
                    None => {
                        // Bottom of the tree: insertions land here directly,
                        // deletions of absent keys are no-ops.
                        for change in &sub_changes {
                            if !change.deleted {
                                mutation.add_entry(change.entry.clone(), None, None);
                            }
                        }
                    }
                    Some(child_id) => {
                        let child = TreeNode::from_id(store, &child_id).await?;
                        let result = apply_node(
                            store,
                            &child,
                            &sub_changes,
                            node_size,
                            false,
                            upper,
                            new_nodes,
                        )
                        .await?;
                        let FinishResult::Parent(updater) = result else {
                            unreachable!("non-root finish always reports to the parent");
                        };
                        updater.apply(&mut mutation);
                    }
                }
                continue;
            }

            // Deletion group: merge the children surrounding the deleted
            // entries, then apply the in-range changes to the merged subtree.
            let mut merged = node.child_id(first_slot);
            for merged_slot in first_slot + 1..=slot {
                merged = merge_subtrees(store, merged, node.child_id(merged_slot), new_nodes)
                    .await?;
            }
            let has_insertions = sub_changes.iter().any(|change| !change.deleted);
            let replacement = match merged {
                Some(id) => {
                    let subtree = TreeNode::from_id(store, &id).await?;
                    Some(
                        apply_node(store, &subtree, &sub_changes, node_size, false, upper, new_nodes)
                            .await?,
                    )
                }
                None if has_insertions => {
                    let subtree = TreeNode::empty();
                    Some(
                        apply_node(store, &subtree, &sub_changes, node_size, false, upper, new_nodes)
                            .await?,
                    )
                }
                None => None,
            };
            match replacement {
                None => {
                    for &index in &deleted_entries {
                        mutation.remove_entry(node.entry(index).key.as_ref(), None);
                    }
                }
                Some(result) => {
                    let FinishResult::Parent(updater) = result else {
                        unreachable!("non-root finish always reports to the parent");
                    };
                    let (pivots, children) = updater.into_parts();
                    let first_child =
                        (children[0] != *TreeNode::empty_node_id()).then_some(children[0]);
                    for &index in &deleted_entries {
                        mutation.remove_entry(node.entry(index).key.as_ref(), first_child);
                    }
                    for (k, pivot) in pivots.into_iter().enumerate() {
                        mutation.add_entry(pivot, Some(children[k]), Some(children[k + 1]));
                    }
                }
            }
        }
        mutation.finish(store, node_size, is_root, max_key, new_nodes)
    })
}

/// Structurally merges two sibling subtrees into one, recursing down their
/// shared boundary. Newly written nodes land in `new_nodes`. The merged
/// nodes may exceed the configured size; the caller's follow-up
/// [`apply_node`] pass renormalizes them.
fn merge_subtrees<'a>(
    store: &'a dyn ObjectStorage,
    left: Option<ObjectId>,
    right: Option<ObjectId>,
    new_nodes: &'a mut HashSet<ObjectId>,
) -> BoxFuture<'a, StorageResult<Option<ObjectId>>> {
    Box::pin(async move {
        let (left_id, right_id) = match (left, right) {
            (None, right) => return Ok(right),
            (left, None) => return Ok(left),
            (Some(left_id), Some(right_id)) => (left_id, right_id),
        };
        let left_node = TreeNode::from_id(store, &left_id).await?;
        let right_node = TreeNode::from_id(store, &right_id).await?;
        let boundary = merge_subtrees(
            store,
            left_node.child_id(left_node.key_count()),
            right_node.child_id(0),
            new_nodes,
        )
        .await?;
        let merged_id = TreeNode::merge(store, &left_node, &right_node, boundary)?;
        new_nodes.insert(merged_id);
        Ok(Some(merged_id))
    })
}

/// Returns every object id reachable from `root_id`: all tree nodes plus
/// every entry's value id.
pub fn get_object_ids(
    store: &dyn ObjectStorage,
    root_id: &ObjectId,
) -> StorageResult<BTreeSet<ObjectId>> {
    fn walk(
        store: &dyn ObjectStorage,
        id: &ObjectId,
        ids: &mut BTreeSet<ObjectId>,
    ) -> StorageResult<()> {
        let node = TreeNode::from_id_sync(store, id)?;
        ids.insert(*id);
        for entry in node.entries() {
            ids.insert(entry.object_id);
        }
        for index in 0..=node.key_count() {
            if let Some(child_id) = node.child_id(index) {
                walk(store, &child_id, ids)?;
            }
        }
        Ok(())
    }
    let mut ids = BTreeSet::new();
    walk(store, root_id, &mut ids)?;
    Ok(ids)
}

/// Walks the tree through `store`'s escalating getter and additionally
/// requests every eager entry value, so that after a successful return all
/// nodes and eager values are present locally. Lazy values are skipped.
pub async fn get_objects_from_sync(
    store: &dyn ObjectStorage,
    root_id: &ObjectId,
) -> StorageResult<()> {
    fn walk<'a>(
        store: &'a dyn ObjectStorage,
        id: &'a ObjectId,
    ) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            let node = TreeNode::from_id(store, id).await?;
            for entry in node.entries() {
                if entry.priority == KeyPriority::Eager {
                    store.get_object(&entry.object_id).await?;
                }
            }
            for index in 0..=node.key_count() {
                if let Some(child_id) = node.child_id(index) {
                    walk(store, &child_id).await?;
                }
            }
            Ok(())
        })
    }
    walk(store, root_id).await
}
