// Copyright 2025 Helsing GmbH
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Small filesystem helpers shared by the stores and the lock writer.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tokio::fs;

use crate::errors::Error;

/// Sibling path used as the staging target for atomic writes.
pub(crate) fn staging_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(OsString::from)
        .unwrap_or_else(|| OsString::from("file"));
    name.push(".tmp");
    path.with_file_name(name)
}

/// Writes `contents` to `path` atomically: the bytes land in a sibling
/// temp file which is then renamed over the target, so a partial file is
/// never observable.
pub(crate) async fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), Error> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|err| Error::filesystem(format!("failed to create {}", parent.display()), err))?;
    }

    let staging = staging_path(path);

    fs::write(&staging, contents)
        .await
        .map_err(|err| Error::filesystem(format!("failed to write {}", staging.display()), err))?;

    fs::rename(&staging, path)
        .await
        .map_err(|err| Error::filesystem(format!("failed to rename into {}", path.display()), err))
}

/// Recursively copies a directory. Existing files are overwritten,
/// permissions are carried over by the underlying copy.
pub(crate) async fn copy_dir(src: &Path, dest: &Path) -> Result<(), Error> {
    for entry in walkdir::WalkDir::new(src) {
        let entry = entry.map_err(|err| Error::Extraction {
            archive: src.display().to_string(),
            reason: err.to_string(),
        })?;

        let rel = entry
            .path()
            .strip_prefix(src)
            .expect("walkdir yields paths under its root");
        let target = dest.join(rel);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).await.map_err(|err| {
                Error::filesystem(format!("failed to create {}", target.display()), err)
            })?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).await.map_err(|err| {
                    Error::filesystem(format!("failed to create {}", parent.display()), err)
                })?;
            }
            fs::copy(entry.path(), &target).await.map_err(|err| {
                Error::filesystem(format!("failed to copy into {}", target.display()), err)
            })?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn atomic_write_leaves_no_staging_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("data.json");

        write_atomic(&target, b"{}").await.unwrap();

        assert_eq!(std::fs::read(&target).unwrap(), b"{}");
        assert!(!staging_path(&target).exists());
    }

    #[tokio::test]
    async fn atomic_write_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("data.json");

        write_atomic(&target, b"one").await.unwrap();
        write_atomic(&target, b"two").await.unwrap();

        assert_eq!(std::fs::read(&target).unwrap(), b"two");
    }

    #[tokio::test]
    async fn copy_dir_copies_nested_files() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir_all(src.join("lib")).unwrap();
        std::fs::write(src.join("package.json"), b"{}").unwrap();
        std::fs::write(src.join("lib/index.js"), b"module.exports = 1;").unwrap();

        let dest = dir.path().join("dest");
        copy_dir(&src, &dest).await.unwrap();

        assert!(dest.join("package.json").exists());
        assert_eq!(
            std::fs::read(dest.join("lib/index.js")).unwrap(),
            b"module.exports = 1;"
        );
    }
}
