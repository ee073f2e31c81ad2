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

//! Hex string helpers.

/// Encodes `data` as a lowercase hex string.
pub fn encode_hex(data: &[u8]) -> String {
    hex::encode(data)
}

/// Encodes `data` as an uppercase hex string.
///
/// Object file names use this form; everything user-facing uses
/// [`encode_hex`].
pub fn encode_file_hex(data: &[u8]) -> String {
    hex::encode_upper(data)
}

/// Decodes `hex` into bytes. Returns `None` if the input is not a valid hex
/// string. Both digit cases are accepted.
pub fn decode_hex(hex: impl AsRef<[u8]>) -> Option<Vec<u8>> {
    hex::decode(hex.as_ref()).ok()
}
