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

//! Materializes a resolved lock into a node_modules tree.
//!
//! Each non-link entry is copied from the package store to its
//! hierarchical placement path. Copies for distinct entries run in
//! parallel; a destination that already holds a package is left alone,
//! so re-installing is a no-op.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use tokio::task::JoinSet;

use crate::bins;
use crate::errors::Error;
use crate::fsutil;
use crate::lock::{Lockfile, entry_name};
use crate::manifest::MANIFEST_FILE;
use crate::package::{PackageName, PackageStore};

#[derive(Debug)]
pub struct Installer {
    store: Arc<PackageStore>,
}

impl Installer {
    pub fn new(store: Arc<PackageStore>) -> Self {
        Self { store }
    }

    /// Copies every entry of the lock into `root`'s node_modules tree,
    /// skipping the paths in `prune` (production installs pass the
    /// dev-only closure here). Finishes by linking executable shims.
    pub async fn install(
        &self,
        lock: &Lockfile,
        root: &Path,
        prune: &BTreeSet<String>,
    ) -> miette::Result<usize> {
        let mut copies: JoinSet<Result<bool, Error>> = JoinSet::new();

        for (path, entry) in &lock.packages {
            if prune.contains(path) {
                continue;
            }

            // Workspace links and platform-skipped optionals carry no
            // files of their own.
            if entry.resolved.as_deref().is_none_or(str::is_empty) {
                continue;
            }

            if entry.link {
                self.link_workspace(root, path, entry.resolved.as_deref().unwrap_or_default())
                    .await?;
                continue;
            }

            let placement = entry_name(path);
            let effective = entry.effective_name(placement);

            let Ok(name) = effective.parse::<PackageName>() else {
                tracing::warn!("warning: skipping entry with invalid name at {path}");
                continue;
            };

            let Some(version) = entry.version.clone() else {
                continue;
            };

            let store = self.store.clone();
            let resolved = entry.resolved.clone().unwrap_or_default();
            let integrity = entry.integrity.clone();
            let dest = root.join(path);

            copies.spawn(async move {
                if dest.join(MANIFEST_FILE).exists() {
                    return Ok(false);
                }

                let source = store
                    .materialize(&name, &version, &resolved, integrity.as_deref())
                    .await?;

                fsutil::copy_dir(&source, &dest).await?;

                Ok(true)
            });
        }

        let mut installed = 0;
        while let Some(copied) = copies.join_next().await {
            let copied = copied.map_err(|err| miette::miette!("install task panicked: {err}"))?;
            if copied? {
                installed += 1;
            }
        }

        bins::link_all(&root.join("node_modules")).await?;

        Ok(installed)
    }

    /// Removes pruned or orphaned placement paths from the tree.
    pub async fn remove_paths(
        &self,
        root: &Path,
        paths: impl IntoIterator<Item = &String>,
    ) -> miette::Result<()> {
        for path in paths {
            let dir = root.join(path);
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => tracing::debug!(":: removed {}", dir.display()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(
                        Error::filesystem(format!("failed to remove {}", dir.display()), err).into(),
                    );
                }
            }
        }

        bins::prune_dangling(&root.join("node_modules")).await?;

        Ok(())
    }

    async fn link_workspace(&self, root: &Path, path: &str, resolved: &str) -> miette::Result<()> {
        let Some(target) = resolved.strip_prefix("file:") else {
            return Ok(());
        };

        let dest = root.join(path);
        if tokio::fs::symlink_metadata(&dest).await.is_ok() {
            return Ok(());
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| Error::filesystem(format!("failed to create {}", parent.display()), err))?;
        }

        symlink_dir(Path::new(target), &dest)
            .map_err(|err| Error::filesystem(format!("failed to link {}", dest.display()), err))?;

        tracing::debug!(":: linked workspace {} -> {target}", dest.display());

        Ok(())
    }
}

#[cfg(unix)]
fn symlink_dir(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(not(unix))]
fn symlink_dir(target: &Path, link: &Path) -> std::io::Result<()> {
    // Junctions need elevated rights on some setups; a copy is the
    // portable fallback.
    let mut stack = vec![(target.to_path_buf(), link.to_path_buf())];
    while let Some((from, to)) = stack.pop() {
        std::fs::create_dir_all(&to)?;
        for entry in std::fs::read_dir(&from)? {
            let entry = entry?;
            let dest = to.join(entry.file_name());
            if entry.file_type()?.is_dir() {
                stack.push((entry.path(), dest));
            } else {
                std::fs::copy(entry.path(), dest)?;
            }
        }
    }
    Ok(())
}
