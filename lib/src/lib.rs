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

//! Local page storage engine for a distributed, syncable key-value ledger.
//!
//! A *page* is an independently versioned keyspace. Its state at any
//! instant is an immutable [`commit`](commit::Commit) whose content is a
//! content-addressed B-tree mapping user keys to value-object ids. This
//! crate persists commits, the tree nodes they reference, and the value
//! objects those nodes point to; mutations enter through
//! [`journals`](journal::Journal), reads through the tree algorithms in
//! [`btree`].

#![deny(unused_must_use)]
#![warn(missing_docs)]

pub mod btree;
pub mod commit;
pub mod content_hash;
pub mod db;
pub mod file_util;
pub mod hex_util;
pub mod journal;
pub mod object_id;
pub mod page_storage;
pub mod store;
pub mod sync;
pub mod types;
