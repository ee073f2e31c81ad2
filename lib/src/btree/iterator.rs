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

use bstr::BStr;

use crate::btree::tree_node::TreeNode;
use crate::object_id::ObjectId;
use crate::store::ObjectStorage;
use crate::types::Entry;
use crate::types::StorageResult;

/// Stateful in-order iterator over the entries of a tree.
///
/// Holds one loaded node per level of the current descent; nodes are
/// dropped as soon as their subtree is exhausted.
pub struct BTreeIterator<'a> {
    store: &'a dyn ObjectStorage,
    stack: Vec<Frame>,
}

struct Frame {
    node: TreeNode,
    /// Index of the next entry to emit from this node.
    index: usize,
    /// Whether the child preceding that entry still has to be visited.
    on_child: bool,
}

impl<'a> BTreeIterator<'a> {
    /// Positions the iterator before the smallest entry of the tree. Only
    /// the root is loaded up front; children are loaded as the walk reaches
    /// them, so whole subtrees can still be skipped.
    pub async fn begin(store: &'a dyn ObjectStorage, root_id: &ObjectId) -> StorageResult<Self> {
        let root = TreeNode::from_id(store, root_id).await?;
        Ok(Self {
            store,
            stack: vec![Frame {
                node: root,
                index: 0,
                on_child: true,
            }],
        })
    }

    /// Positions the iterator at the smallest entry whose key is `>= key`.
    /// If there is none the iterator starts out exhausted.
    pub async fn find(
        store: &'a dyn ObjectStorage,
        root_id: &ObjectId,
        key: &BStr,
    ) -> StorageResult<Self> {
        let mut stack = vec![];
        let mut node = TreeNode::from_id(store, root_id).await?;
        loop {
            match node.find_key_or_child(key) {
                Ok(index) => {
                    // Exact match; everything below the preceding child is
                    // smaller.
                    stack.push(Frame {
                        node,
                        index,
                        on_child: false,
                    });
                    break;
                }
                Err(index) => {
                    let child_id = node.child_id(index);
                    stack.push(Frame {
                        node,
                        index,
                        on_child: false,
                    });
                    match child_id {
                        Some(child_id) => node = TreeNode::from_id(store, &child_id).await?,
                        None => break,
                    }
                }
            }
        }
        Ok(Self { store, stack })
    }

    /// Emits the next entry together with the id of the node holding it, or
    /// `None` once the tree is exhausted.
    pub async fn next(&mut self) -> StorageResult<Option<(Entry, ObjectId)>> {
        loop {
            let Some(top) = self.stack.last_mut() else {
                return Ok(None);
            };
            if top.on_child {
                top.on_child = false;
                if let Some(child_id) = top.node.child_id(top.index) {
                    let child = TreeNode::from_id(self.store, &child_id).await?;
                    self.stack.push(Frame {
                        node: child,
                        index: 0,
                        on_child: true,
                    });
                }
                continue;
            }
            if top.index < top.node.key_count() {
                let entry = top.node.entry(top.index).clone();
                let node_id = *top.node.id();
                top.index += 1;
                top.on_child = true;
                return Ok(Some((entry, node_id)));
            }
            self.stack.pop();
        }
    }

    /// Id of the subtree the iterator is about to descend into, if its very
    /// next step is a descent.
    pub(super) fn pending_descent(&self) -> Option<ObjectId> {
        let top = self.stack.last()?;
        if top.on_child {
            top.node.child_id(top.index)
        } else {
            None
        }
    }

    /// Skips the pending descent; the subtree's entries are never emitted.
    pub(super) fn skip_descent(&mut self) {
        let top = self.stack.last_mut().expect("a descent is pending");
        debug_assert!(top.on_child);
        top.on_child = false;
    }
}

/// Calls `on_next` for every entry with key `>= min_key`, in ascending key
/// order, together with the id of the node holding the entry. Returning
/// `false` from the callback stops the scan without error.
pub async fn for_each_entry(
    store: &dyn ObjectStorage,
    root_id: &ObjectId,
    min_key: &BStr,
    mut on_next: impl FnMut(&Entry, &ObjectId) -> bool,
) -> StorageResult<()> {
    let mut iterator = BTreeIterator::find(store, root_id, min_key).await?;
    while let Some((entry, node_id)) = iterator.next().await? {
        if !on_next(&entry, &node_id) {
            return Ok(());
        }
    }
    Ok(())
}
