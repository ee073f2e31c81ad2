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

//! The content-addressed B-tree backing every commit.

mod diff;
mod encoding;
mod iterator;
mod tree_node;
mod utils;

pub use self::diff::for_each_diff;
pub use self::iterator::BTreeIterator;
pub use self::iterator::for_each_entry;
pub use self::tree_node::FinishResult;
pub use self::tree_node::Mutation;
pub use self::tree_node::TreeNode;
pub use self::tree_node::Updater;
pub use self::utils::apply_changes;
pub use self::utils::get_object_ids;
pub use self::utils::get_objects_from_sync;
