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

use std::path::PathBuf;
use std::sync::Arc;

use tokio::fs;

use crate::cache::TarballCache;
use crate::config::Config;
use crate::errors::Error;
use crate::manifest::MANIFEST_FILE;
use crate::package::{PackageName, extract};
use crate::sync::KeyedLocks;

/// IO abstraction layer over the store of extracted package trees.
///
/// Directories are named `<effective-name>@<version>` and are the
/// authoritative source for installation; they are never mutated in
/// place. A directory whose `package.json` is missing or empty is
/// considered corrupt, removed, and re-extracted once from the cached
/// archive.
#[derive(Debug)]
pub struct PackageStore {
    root: PathBuf,
    cache: Arc<TarballCache>,
    locks: KeyedLocks,
}

impl PackageStore {
    pub fn new(config: &Config, cache: Arc<TarballCache>) -> Self {
        Self {
            root: config.packages_dir(),
            cache,
            locks: KeyedLocks::default(),
        }
    }

    /// The directory holding the extracted tree for `name@version`.
    pub fn locate(&self, name: &PackageName, version: &str) -> PathBuf {
        self.root.join(format!("{name}@{version}"))
    }

    /// Returns the extracted directory for `name@version`, acquiring and
    /// extracting the archive first when needed.
    pub async fn materialize(
        &self,
        name: &PackageName,
        version: &str,
        url: &str,
        sri: Option<&str>,
    ) -> Result<PathBuf, Error> {
        let lock = self.locks.get(&format!("{name}@{version}"));
        let _guard = lock.lock().await;

        let dir = self.locate(name, version);

        if self.is_intact(&dir).await {
            return Ok(dir);
        }

        let archive = self.cache.acquire(name, version, url, sri).await?;

        self.extract_into(&archive, &dir).await?;

        if !self.is_intact(&dir).await {
            // One retry from the cached archive before giving up.
            tracing::warn!("warning: extraction of {name}@{version} produced a corrupt tree, retrying");
            self.extract_into(&archive, &dir).await?;

            if !self.is_intact(&dir).await {
                return Err(Error::Extraction {
                    archive: archive.display().to_string(),
                    reason: format!("{MANIFEST_FILE} missing or empty after extraction"),
                });
            }
        }

        tracing::debug!(":: unpacked {name}@{version} into {}", dir.display());

        Ok(dir)
    }

    async fn extract_into(&self, archive: &PathBuf, dir: &PathBuf) -> Result<(), Error> {
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(Error::filesystem(format!("failed to clear {}", dir.display()), err));
            }
        }

        extract(archive, dir)
    }

    /// A populated directory must carry a non-empty `package.json`.
    async fn is_intact(&self, dir: &PathBuf) -> bool {
        match fs::metadata(dir.join(MANIFEST_FILE)).await {
            Ok(metadata) => metadata.len() > 0,
            Err(_) => false,
        }
    }
}
