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

//! Seam to the cloud sync layer.

use std::pin::Pin;

use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::object_id::ObjectId;
use crate::types::StorageResult;

/// Delegate responsible for retrieving on-demand storage objects from the
/// cloud. The sync protocol behind it is not this crate's concern.
#[async_trait]
pub trait PageSyncDelegate: Send + Sync {
    /// Retrieves the object with `id`. The object's size is returned along
    /// with the byte stream so that the caller can verify that all data was
    /// received when draining it.
    async fn get_object(
        &self,
        id: &ObjectId,
    ) -> StorageResult<(u64, Pin<Box<dyn AsyncRead + Send>>)>;
}
