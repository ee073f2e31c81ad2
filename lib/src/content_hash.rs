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

//! Content hashing behind every object id.
//!
//! All identifiers in the storage layer are the 256-bit digest of the bytes
//! they name. The concrete hash function is an implementation detail of this
//! module; nothing outside of it should assume a particular algorithm.

use blake2::Blake2b;
use blake2::digest::consts::U32;
use digest::Digest as _;

/// Length in bytes of every digest produced by this module.
pub const DIGEST_LEN: usize = 32;

type Blake2b256 = Blake2b<U32>;

/// Hashes `data` in one shot.
pub fn hash_bytes(data: &[u8]) -> [u8; DIGEST_LEN] {
    let mut hasher = Blake2b256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Incremental digest over a byte stream. Used when ingesting objects whose
/// size isn't known up front.
pub struct StreamingHasher(Blake2b256);

impl StreamingHasher {
    pub fn new() -> Self {
        Self(Blake2b256::new())
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finish(self) -> [u8; DIGEST_LEN] {
        self.0.finalize().into()
    }
}

impl Default for StreamingHasher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_streaming_matches_one_shot() {
        let mut hasher = StreamingHasher::new();
        hasher.update(b"hello ");
        hasher.update(b"");
        hasher.update(b"world");
        assert_eq!(hasher.finish(), hash_bytes(b"hello world"));
    }

    #[test]
    fn test_distinct_inputs_distinct_digests() {
        assert_ne!(hash_bytes(b""), hash_bytes(b"\x00"));
        assert_ne!(hash_bytes(b"a"), hash_bytes(b"b"));
    }
}
