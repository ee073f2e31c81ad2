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

use chrono::Utc;
use smallvec::SmallVec;
use smallvec::smallvec;

use crate::btree::TreeNode;
use crate::content_hash;
use crate::object_id::CommitId;
use crate::object_id::ID_LEN;
use crate::object_id::ObjectId;
use crate::object_id::StorageId;

/// Id of the reserved empty commit every page starts from. All devices of a
/// deployment must agree on this constant; it is all zeroes by convention.
pub const FIRST_COMMIT_ID: CommitId = CommitId::new([0; ID_LEN]);

/// An immutable snapshot of a page: a root node plus the commit's position
/// in the version DAG. Identified by the digest of its canonical storage
/// bytes.
#[derive(Clone)]
pub struct Commit {
    id: CommitId,
    root_id: ObjectId,
    /// Nanoseconds since epoch.
    timestamp: i64,
    generation: u64,
    parent_ids: SmallVec<[CommitId; 2]>,
    storage_bytes: Vec<u8>,
}

impl Debug for Commit {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        f.debug_struct("Commit")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .finish()
    }
}

impl PartialEq for Commit {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Commit {}

impl Commit {
    /// Builds a new commit on top of `parents`, which must not be empty.
    /// The generation is one above the highest parent generation.
    pub fn from_content_and_parents(root_id: ObjectId, parents: &[Self]) -> Self {
        assert!(!parents.is_empty());
        let generation = parents.iter().map(|parent| parent.generation).max().unwrap() + 1;
        // i64 nanoseconds cover timestamps until the year 2262.
        let timestamp = Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX);
        let parent_ids: SmallVec<[CommitId; 2]> =
            parents.iter().map(|parent| parent.id).collect();
        let storage_bytes = encode(&root_id, timestamp, generation, &parent_ids);
        Self {
            id: CommitId::new(content_hash::hash_bytes(&storage_bytes)),
            root_id,
            timestamp,
            generation,
            parent_ids,
            storage_bytes,
        }
    }

    /// Decodes a commit from its storage bytes. Returns `None` if decoding
    /// fails or if the claimed id does not match the digest of `bytes`.
    pub fn from_storage_bytes(id: CommitId, bytes: Vec<u8>) -> Option<Self> {
        if CommitId::new(content_hash::hash_bytes(&bytes)) != id {
            return None;
        }
        let (root_id, timestamp, generation, parent_ids) = decode(&bytes)?;
        Some(Self {
            id,
            root_id,
            timestamp,
            generation,
            parent_ids,
            storage_bytes: bytes,
        })
    }

    /// The reserved empty commit: no parents, generation zero, empty tree.
    pub fn empty() -> Self {
        let root_id = *TreeNode::empty_node_id();
        let storage_bytes = encode(&root_id, 0, 0, &[]);
        Self {
            id: FIRST_COMMIT_ID,
            root_id,
            timestamp: 0,
            generation: 0,
            parent_ids: smallvec![],
            storage_bytes,
        }
    }

    pub fn id(&self) -> &CommitId {
        &self.id
    }

    pub fn root_id(&self) -> &ObjectId {
        &self.root_id
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn parent_ids(&self) -> &[CommitId] {
        &self.parent_ids
    }

    pub fn storage_bytes(&self) -> &[u8] {
        &self.storage_bytes
    }
}

/// Canonical commit encoding: `(root_id, timestamp i64 LE, generation u64
/// LE, parent_count u8, [parent_id] * parent_count)`.
fn encode(root_id: &ObjectId, timestamp: i64, generation: u64, parent_ids: &[CommitId]) -> Vec<u8> {
    assert!(parent_ids.len() <= 2);
    let mut out = Vec::with_capacity(ID_LEN + 8 + 8 + 1 + ID_LEN * parent_ids.len());
    out.extend_from_slice(root_id.as_bytes());
    out.extend_from_slice(&timestamp.to_le_bytes());
    out.extend_from_slice(&generation.to_le_bytes());
    out.push(parent_ids.len() as u8);
    for parent_id in parent_ids {
        out.extend_from_slice(parent_id.as_bytes());
    }
    out
}

fn decode(bytes: &[u8]) -> Option<(ObjectId, i64, u64, SmallVec<[CommitId; 2]>)> {
    let header_len = ID_LEN + 8 + 8 + 1;
    if bytes.len() < header_len {
        return None;
    }
    let root_id = ObjectId::try_from_bytes(&bytes[..ID_LEN]).unwrap();
    let timestamp = i64::from_le_bytes(bytes[ID_LEN..ID_LEN + 8].try_into().unwrap());
    let generation = u64::from_le_bytes(bytes[ID_LEN + 8..ID_LEN + 16].try_into().unwrap());
    let parent_count = bytes[ID_LEN + 16] as usize;
    if parent_count > 2 || bytes.len() != header_len + parent_count * ID_LEN {
        return None;
    }
    let parent_ids = bytes[header_len..]
        .chunks_exact(ID_LEN)
        .map(|chunk| CommitId::try_from_bytes(chunk).unwrap())
        .collect();
    Some((root_id, timestamp, generation, parent_ids))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn test_storage_bytes_round_trip() {
        let base = Commit::empty();
        let commit = Commit::from_content_and_parents(ObjectId::new([3; ID_LEN]), &[base]);
        let decoded =
            Commit::from_storage_bytes(*commit.id(), commit.storage_bytes().to_vec()).unwrap();
        assert_eq!(decoded.root_id(), commit.root_id());
        assert_eq!(decoded.timestamp(), commit.timestamp());
        assert_eq!(decoded.generation(), 1);
        assert_eq!(decoded.parent_ids(), &[FIRST_COMMIT_ID]);
        assert_eq!(decoded.storage_bytes(), commit.storage_bytes());
    }

    #[test]
    fn test_merge_commit_generation() {
        let base = Commit::empty();
        let left = Commit::from_content_and_parents(ObjectId::new([1; ID_LEN]), &[base.clone()]);
        let right = Commit::from_content_and_parents(ObjectId::new([2; ID_LEN]), &[base]);
        let upper =
            Commit::from_content_and_parents(ObjectId::new([3; ID_LEN]), &[left.clone(), right]);
        let merge = Commit::from_content_and_parents(ObjectId::new([4; ID_LEN]), &[left, upper]);
        // One above the highest parent, not the lowest.
        assert_eq!(merge.generation(), 3);
        assert_eq!(merge.parent_ids().len(), 2);
    }

    #[test]
    fn test_from_storage_bytes_rejects_wrong_id() {
        let base = Commit::empty();
        let commit = Commit::from_content_and_parents(ObjectId::new([3; ID_LEN]), &[base]);
        let wrong_id = CommitId::new([9; ID_LEN]);
        assert_matches!(
            Commit::from_storage_bytes(wrong_id, commit.storage_bytes().to_vec()),
            None
        );
    }

    #[test]
    fn test_from_storage_bytes_rejects_malformed_bytes() {
        let truncated = vec![0; 10];
        let id = CommitId::new(crate::content_hash::hash_bytes(&truncated));
        assert_matches!(Commit::from_storage_bytes(id, truncated), None);

        // Claimed parent count larger than the payload
        let base = Commit::empty();
        let commit = Commit::from_content_and_parents(ObjectId::new([3; ID_LEN]), &[base]);
        let mut bytes = commit.storage_bytes().to_vec();
        bytes[ID_LEN + 16] = 2;
        let id = CommitId::new(crate::content_hash::hash_bytes(&bytes));
        assert_matches!(Commit::from_storage_bytes(id, bytes), None);
    }

    #[test]
    fn test_empty_commit() {
        let commit = Commit::empty();
        assert_eq!(commit.id(), &FIRST_COMMIT_ID);
        assert_eq!(commit.generation(), 0);
        assert_eq!(commit.timestamp(), 0);
        assert!(commit.parent_ids().is_empty());
        assert_eq!(commit.root_id(), TreeNode::empty_node_id());
        // The sentinel id is fixed, not content-derived.
        assert_eq!(FIRST_COMMIT_ID.hex(), "00".repeat(ID_LEN));
    }
}
