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

use std::collections::HashSet;
use std::sync::LazyLock;

use bstr::BStr;
use bstr::BString;

use crate::btree::encoding::decode_node;
use crate::btree::encoding::encode_node;
use crate::content_hash;
use crate::object_id::ObjectId;
use crate::store::Object;
use crate::store::ObjectStorage;
use crate::types::Entry;
use crate::types::StorageError;
use crate::types::StorageResult;

/// In-memory view of a single B-tree node: `entries.len() + 1` children,
/// keys strictly ascending. An absent (`None`) child denotes an empty
/// subtree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeNode {
    id: ObjectId,
    entries: Vec<Entry>,
    children: Vec<Option<ObjectId>>,
}

static EMPTY_NODE_ID: LazyLock<ObjectId> =
    LazyLock::new(|| ObjectId::new(content_hash::hash_bytes(&encode_node(&[], &[None]))));

impl TreeNode {
    pub async fn from_id(store: &dyn ObjectStorage, id: &ObjectId) -> StorageResult<Self> {
        Self::from_object(store.get_object(id).await?)
    }

    pub fn from_id_sync(store: &dyn ObjectStorage, id: &ObjectId) -> StorageResult<Self> {
        Self::from_object(store.get_object_sync(id)?)
    }

    fn from_object(object: Object) -> StorageResult<Self> {
        let (entries, children) = decode_node(object.data())
            .ok_or_else(|| StorageError::format(object.id(), "invalid tree node"))?;
        Ok(Self {
            id: *object.id(),
            entries,
            children,
        })
    }

    /// The node of the empty tree: no entries, one absent child. Not written
    /// anywhere until [`Self::from_entries`] persists it.
    pub fn empty() -> Self {
        Self {
            id: *EMPTY_NODE_ID,
            entries: vec![],
            children: vec![None],
        }
    }

    /// Id of the empty node, without touching any store.
    pub fn empty_node_id() -> &'static ObjectId {
        &EMPTY_NODE_ID
    }

    /// Serializes and stores a node, returning its content-addressed id.
    pub fn from_entries(
        store: &dyn ObjectStorage,
        entries: Vec<Entry>,
        children: Vec<Option<ObjectId>>,
    ) -> StorageResult<ObjectId> {
        debug_assert!(entries.is_sorted_by(|a, b| a.key < b.key));
        store.add_object_sync(&encode_node(&entries, &children))
    }

    /// Concatenates `left`'s entries with `right`'s; the boundary pair of
    /// children (left's last and right's first) is replaced by
    /// `merged_child_id`.
    pub fn merge(
        store: &dyn ObjectStorage,
        left: &Self,
        right: &Self,
        merged_child_id: Option<ObjectId>,
    ) -> StorageResult<ObjectId> {
        let mut entries = left.entries.clone();
        entries.extend(right.entries.iter().cloned());
        let mut children = left.children[..left.children.len() - 1].to_vec();
        children.push(merged_child_id);
        children.extend(right.children[1..].iter().copied());
        Self::from_entries(store, entries, children)
    }

    /// Partitions the node around the entry at `index`. The pivot entry
    /// itself ends up in neither half; the caller reinserts it one level
    /// up, bracketed by the two returned nodes.
    pub fn split(
        &self,
        store: &dyn ObjectStorage,
        index: usize,
        left_rightmost_child: Option<ObjectId>,
        right_leftmost_child: Option<ObjectId>,
    ) -> StorageResult<(ObjectId, ObjectId)> {
        assert!(index < self.key_count());
        let left_entries = self.entries[..index].to_vec();
        let mut left_children = self.children[..index].to_vec();
        left_children.push(left_rightmost_child);
        let left_id = Self::from_entries(store, left_entries, left_children)?;

        let right_entries = self.entries[index + 1..].to_vec();
        let mut right_children = vec![right_leftmost_child];
        right_children.extend(self.children[index + 2..].iter().copied());
        let right_id = Self::from_entries(store, right_entries, right_children)?;
        Ok((left_id, right_id))
    }

    pub fn id(&self) -> &ObjectId {
        &self.id
    }

    pub fn key_count(&self) -> usize {
        self.entries.len()
    }

    pub fn entry(&self, index: usize) -> &Entry {
        &self.entries[index]
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn child_id(&self, index: usize) -> Option<ObjectId> {
        self.children[index]
    }

    /// Loads the child at `index`. An absent child yields `NoSuchChild`.
    pub fn child(&self, store: &dyn ObjectStorage, index: usize) -> StorageResult<Self> {
        match self.children[index] {
            Some(id) => Self::from_id_sync(store, &id),
            None => Err(StorageError::NoSuchChild),
        }
    }

    /// Binary search. `Ok(index)` means `entries[index].key == key`;
    /// `Err(index)` gives both the insertion point and the child to descend
    /// into.
    pub fn find_key_or_child(&self, key: &BStr) -> Result<usize, usize> {
        self.entries
            .binary_search_by(|entry| <&BStr>::from(&entry.key[..]).cmp(key))
    }

    pub fn start_mutation(&self) -> Mutation<'_> {
        Mutation {
            node: self,
            node_index: 0,
            entries: vec![],
            children: vec![],
        }
    }
}

/// Builder producing a new node from an existing one plus a sequence of
/// edits issued in strictly ascending key order. Finishing consumes the
/// builder, so a mutation cannot be finished twice.
pub struct Mutation<'a> {
    node: &'a TreeNode,
    node_index: usize,
    entries: Vec<Entry>,
    children: Vec<Option<ObjectId>>,
}

impl Mutation<'_> {
    /// Copies original entries with keys smaller than `key` (all remaining
    /// entries if `None`). A copied entry keeps its left child unless an
    /// earlier edit already rewrote that slot.
    fn copy_until(&mut self, key: Option<&BStr>) {
        while self.node_index < self.node.key_count()
            && key.is_none_or(|key| self.node.entry(self.node_index).key < key)
        {
            self.entries.push(self.node.entry(self.node_index).clone());
            if self.children.len() < self.entries.len() {
                self.children.push(self.node.child_id(self.node_index));
            }
            self.node_index += 1;
        }
    }

    /// Inserts a new entry bracketed by its two children.
    pub fn add_entry(
        &mut self,
        entry: Entry,
        left_id: Option<ObjectId>,
        right_id: Option<ObjectId>,
    ) {
        debug_assert!(self.entries.last().is_none_or(|prev| prev.key < entry.key));
        self.copy_until(Some(entry.key.as_ref()));

        self.entries.push(entry);
        if self.children.len() < self.entries.len() {
            self.children.push(left_id);
        } else {
            // On two consecutive edits touching this boundary the slot is
            // already defined and must match the given left child.
            debug_assert_eq!(self.children.last(), Some(&left_id));
        }
        self.children.push(right_id);
    }

    /// Replaces the value of an existing entry in place.
    pub fn update_entry(&mut self, entry: Entry) {
        debug_assert!(self.entries.last().is_none_or(|prev| prev.key <= entry.key));
        self.copy_until(Some(entry.key.as_ref()));

        debug_assert_eq!(self.node.entry(self.node_index).key, entry.key);
        self.entries.push(entry);
        if self.children.len() < self.entries.len() {
            self.children.push(self.node.child_id(self.node_index));
        }
        self.node_index += 1;
    }

    /// Drops the entry with `key`. `child_id` takes the place of the removed
    /// entry's left child unless an earlier edit already rewrote that slot;
    /// the right child is dropped either way.
    pub fn remove_entry(&mut self, key: &BStr, child_id: Option<ObjectId>) {
        debug_assert!(self.entries.last().is_none_or(|prev| prev.key < key));
        self.copy_until(Some(key));

        debug_assert_eq!(self.node.entry(self.node_index).key, key);
        if self.children.len() == self.entries.len() {
            self.children.push(child_id);
        }
        self.node_index += 1;
    }

    /// Rewrites the child slot preceding `key_after` (the last slot if
    /// `None`).
    pub fn update_child_id(&mut self, key_after: Option<&BStr>, child_id: Option<ObjectId>) {
        debug_assert!(
            self.entries.last().is_none_or(|prev| {
                key_after.is_none_or(|key| prev.key < key)
            })
        );
        self.copy_until(key_after);
        self.children.push(child_id);
    }

    fn finalize(mut self) -> (Vec<Entry>, Vec<Option<ObjectId>>) {
        self.copy_until(None);
        // If the last edit was not an add_entry, the right child of the last
        // entry has not been added yet.
        if self.children.len() == self.entries.len() {
            debug_assert_eq!(self.node_index, self.node.key_count());
            self.children.push(self.node.child_id(self.node_index));
        }
        (self.entries, self.children)
    }

    /// Writes out the mutated node, splitting it when it exceeds `max_size`
    /// entries. Ids of every node written (that differs from the input) are
    /// added to `new_nodes`.
    ///
    /// Without a split the result is a single replacement child; a split
    /// lifts one pivot entry per boundary into the parent. When there is no
    /// parent a fresh root level is grown, repeatedly if the pivots
    /// themselves overflow.
    pub fn finish(
        self,
        store: &dyn ObjectStorage,
        max_size: usize,
        is_root: bool,
        max_key: Option<&BStr>,
        new_nodes: &mut HashSet<ObjectId>,
    ) -> StorageResult<FinishResult> {
        let mut unsplit_id = Some(*self.node.id());
        let max_key = max_key.map(BString::from);
        let (mut entries, mut children) = self.finalize();
        loop {
            // If we want N nodes, each with S entries, separated by 1 entry,
            // then the total number of entries E is E = N*S+(N-1), leading to
            // N = (E+1)/(S+1), rounded up.
            let new_node_count = 1 + entries.len() / (max_size + 1);
            if new_node_count == 1 {
                let id = TreeNode::from_entries(store, entries, children)?;
                if unsplit_id != Some(id) {
                    new_nodes.insert(id);
                }
                return Ok(if is_root {
                    FinishResult::NewRoot(id)
                } else {
                    FinishResult::Parent(Updater {
                        pivots: vec![],
                        children: vec![id],
                        max_key,
                    })
                });
            }

            let elements_per_node = 1 + (entries.len() - new_node_count) / new_node_count;
            let mut pivots = Vec::with_capacity(new_node_count - 1);
            let mut split_children = Vec::with_capacity(new_node_count);
            for _ in 0..new_node_count {
                let element_count = elements_per_node.min(entries.len());
                let node_entries: Vec<_> = entries.drain(..element_count).collect();
                let node_children: Vec<_> = children.drain(..=element_count).collect();
                let id = TreeNode::from_entries(store, node_entries, node_children)?;
                new_nodes.insert(id);
                split_children.push(id);
                if !entries.is_empty() {
                    // The pivot moves up one level in the tree.
                    pivots.push(entries.remove(0));
                }
            }
            debug_assert!(entries.is_empty());
            debug_assert!(children.is_empty());

            if !is_root {
                return Ok(FinishResult::Parent(Updater {
                    pivots,
                    children: split_children,
                    max_key,
                }));
            }
            // No parent node; grow a new root level from the pivots.
            entries = pivots;
            children = split_children.into_iter().map(Some).collect();
            unsplit_id = None;
        }
    }
}

/// Outcome of [`Mutation::finish`].
#[derive(Debug)]
pub enum FinishResult {
    /// The (possibly regrown) root of the whole tree.
    NewRoot(ObjectId),
    /// Instructions for splicing this level's result into the parent node.
    Parent(Updater),
}

/// Describes how a parent mutation must incorporate a finished child level:
/// either a single replacement child, or `pivots.len()` lifted entries
/// bracketed by `pivots.len() + 1` split children.
#[derive(Debug)]
pub struct Updater {
    pivots: Vec<Entry>,
    children: Vec<ObjectId>,
    max_key: Option<BString>,
}

impl Updater {
    /// Applies this update to the parent's child slot it was produced for.
    pub fn apply(self, mutation: &mut Mutation<'_>) {
        let (pivots, children, max_key) = (self.pivots, self.children, self.max_key);
        if pivots.is_empty() {
            let child = children.into_iter().next().unwrap();
            let child = (child != *TreeNode::empty_node_id()).then_some(child);
            mutation.update_child_id(max_key.as_ref().map(|key| BStr::new(key)), child);
        } else {
            for (i, pivot) in pivots.into_iter().enumerate() {
                mutation.add_entry(pivot, Some(children[i]), Some(children[i + 1]));
            }
        }
    }

    /// The pieces of this update, for callers that splice them around an
    /// entry removal instead of into a plain child slot.
    pub fn into_parts(self) -> (Vec<Entry>, Vec<ObjectId>) {
        (self.pivots, self.children)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ObjectStore;
    use crate::tests::new_temp_dir;
    use crate::types::KeyPriority;

    fn entry(key: &str, value_byte: u8) -> Entry {
        Entry::new(key, ObjectId::new([value_byte; 32]), KeyPriority::Eager)
    }

    fn new_store() -> (tempfile::TempDir, ObjectStore) {
        let temp_dir = new_temp_dir();
        let store = ObjectStore::init(temp_dir.path()).unwrap();
        (temp_dir, store)
    }

    #[test]
    fn test_find_key_or_child() {
        let (_dir, store) = new_store();
        let entries = vec![entry("b", 1), entry("d", 2), entry("f", 3)];
        let id = TreeNode::from_entries(&store, entries, vec![None; 4]).unwrap();
        let node = TreeNode::from_id_sync(&store, &id).unwrap();

        assert_eq!(node.find_key_or_child("b".into()), Ok(0));
        assert_eq!(node.find_key_or_child("f".into()), Ok(2));
        assert_eq!(node.find_key_or_child("a".into()), Err(0));
        assert_eq!(node.find_key_or_child("c".into()), Err(1));
        assert_eq!(node.find_key_or_child("g".into()), Err(3));
    }

    #[test]
    fn test_mutation_without_split() {
        let (_dir, store) = new_store();
        let id =
            TreeNode::from_entries(&store, vec![entry("b", 1), entry("d", 2)], vec![None; 3])
                .unwrap();
        let node = TreeNode::from_id_sync(&store, &id).unwrap();

        let mut mutation = node.start_mutation();
        mutation.add_entry(entry("a", 9), None, None);
        mutation.update_entry(entry("b", 8));
        mutation.remove_entry("d".into(), None);
        let mut new_nodes = HashSet::new();
        let result = mutation.finish(&store, 4, true, None, &mut new_nodes).unwrap();
        let FinishResult::NewRoot(new_id) = result else {
            panic!("expected a new root");
        };
        assert_eq!(new_nodes, HashSet::from([new_id]));

        let new_node = TreeNode::from_id_sync(&store, &new_id).unwrap();
        assert_eq!(new_node.entries(), &[entry("a", 9), entry("b", 8)]);
    }

    #[test]
    fn test_mutation_without_changes_keeps_id() {
        let (_dir, store) = new_store();
        let id =
            TreeNode::from_entries(&store, vec![entry("b", 1), entry("d", 2)], vec![None; 3])
                .unwrap();
        let node = TreeNode::from_id_sync(&store, &id).unwrap();

        let mut new_nodes = HashSet::new();
        let result = node
            .start_mutation()
            .finish(&store, 4, true, None, &mut new_nodes)
            .unwrap();
        let FinishResult::NewRoot(new_id) = result else {
            panic!("expected a new root");
        };
        assert_eq!(new_id, id);
        assert!(new_nodes.is_empty());
    }

    #[test]
    fn test_mutation_split_arithmetic() {
        let (_dir, store) = new_store();
        let root = TreeNode::empty();
        let mut mutation = root.start_mutation();
        for i in 0..11 {
            mutation.add_entry(entry(&format!("key{i:02}"), i), None, None);
        }
        let mut new_nodes = HashSet::new();
        let result = mutation.finish(&store, 4, true, None, &mut new_nodes).unwrap();
        let FinishResult::NewRoot(root_id) = result else {
            panic!("expected a new root");
        };
        // Three leaves of three entries each, two pivots in the new root.
        assert_eq!(new_nodes.len(), 4);
        let root = TreeNode::from_id_sync(&store, &root_id).unwrap();
        assert_eq!(root.key_count(), 2);
        assert_eq!(root.entry(0).key, "key03");
        assert_eq!(root.entry(1).key, "key07");
        for index in 0..=2 {
            let child = root.child(&store, index).unwrap();
            assert_eq!(child.key_count(), 3);
        }
    }

    #[test]
    fn test_mutation_split_reports_pivots_to_parent() {
        let (_dir, store) = new_store();
        let root = TreeNode::empty();
        let mut mutation = root.start_mutation();
        for i in 0..5 {
            mutation.add_entry(entry(&format!("key{i:02}"), i), None, None);
        }
        let mut new_nodes = HashSet::new();
        let result = mutation.finish(&store, 4, false, None, &mut new_nodes).unwrap();
        let FinishResult::Parent(updater) = result else {
            panic!("expected a parent update");
        };
        let (pivots, children) = updater.into_parts();
        assert_eq!(pivots, vec![entry("key02", 2)]);
        assert_eq!(children.len(), 2);
        assert_eq!(new_nodes.len(), 2);
    }
}
