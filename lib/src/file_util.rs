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

use std::fs;
use std::io;
use std::path::Path;

use tempfile::NamedTempFile;
use tempfile::PersistError;

/// Creates a directory or does nothing if the directory already exists.
///
/// Returns the underlying error if the directory can't be created.
/// The function will also fail if intermediate directories on the path do not
/// already exist.
pub fn create_or_reuse_dir(dirname: &Path) -> io::Result<()> {
    match fs::create_dir(dirname) {
        Ok(()) => Ok(()),
        Err(_) if dirname.is_dir() => Ok(()),
        Err(e) => Err(e),
    }
}

/// Persists a staged object file at its content-addressed path.
///
/// The file content is synchronized to disk before the rename, so after a
/// system crash the persisted file has valid content if it exists at all.
/// Concurrent writers of the same content race harmlessly: if `new_path`
/// already holds a file of `expected_len` bytes, the staged copy is simply
/// discarded. A pre-existing file of any other length means the store is
/// corrupt and an error of kind `InvalidData` is returned.
pub fn persist_content_addressed_temp_file(
    temp_file: NamedTempFile,
    new_path: impl AsRef<Path>,
    expected_len: u64,
) -> io::Result<()> {
    let new_path = new_path.as_ref();
    let verify_existing = |source: io::Error| match fs::metadata(new_path) {
        Ok(metadata) if metadata.len() == expected_len => Ok(()),
        Ok(metadata) => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "{} has wrong size, expected {expected_len}, found {}",
                new_path.display(),
                metadata.len()
            ),
        )),
        Err(_) => Err(source),
    };
    if let Ok(metadata) = fs::metadata(new_path) {
        // Another writer got there first; the staged copy is redundant.
        return verify_existing(io::Error::other("unreachable: destination exists"))
            .map(|()| drop(metadata));
    }
    temp_file.as_file().sync_data()?;
    match temp_file.persist(new_path) {
        Ok(_) => Ok(()),
        // If the rename failed, the file might have been saved by a racing
        // writer in the meantime.
        Err(PersistError { error, file: _ }) => verify_existing(error),
    }
}
