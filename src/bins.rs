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

//! Executable shims for installed packages.
//!
//! Every installed package declaring `bin` entries gets a link in
//! `<node_modules>/.bin`, the directory lifecycle scripts and `run`
//! prepend to `PATH`.

use std::path::{Path, PathBuf};

use tokio::fs;

use crate::errors::Error;
use crate::manifest::{MANIFEST_FILE, Manifest};

const BIN_DIR: &str = ".bin";

/// Creates shims for every package installed directly under
/// `node_modules` (scoped packages included). Existing shims are
/// replaced, so the call is idempotent.
pub async fn link_all(node_modules: &Path) -> Result<(), Error> {
    link_into(node_modules, &node_modules.join(BIN_DIR)).await
}

/// Like [`link_all`], with an explicit shim directory. The global
/// installation points this at its own `bin/`.
pub async fn link_into(node_modules: &Path, bin_dir: &Path) -> Result<(), Error> {
    if !node_modules.exists() {
        return Ok(());
    }

    for package_dir in package_dirs(node_modules).await? {
        let manifest_path = package_dir.join(MANIFEST_FILE);
        let Ok(manifest) = Manifest::try_read_from(&manifest_path).await else {
            continue;
        };

        let package_name = manifest.name.clone().unwrap_or_else(|| {
            package_dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        });

        for (bin_name, relative) in manifest.bin.entries(&package_name) {
            // A shim name with path separators could escape .bin.
            if bin_name.contains('/') || bin_name.contains('\\') {
                tracing::warn!("warning: skipping suspicious bin name {bin_name:?} of {package_name}");
                continue;
            }

            let target = package_dir.join(&relative);
            if !target.exists() {
                tracing::warn!(
                    "warning: bin target {relative} of {package_name} does not exist, skipping"
                );
                continue;
            }

            fs::create_dir_all(&bin_dir)
                .await
                .map_err(|err| Error::filesystem(format!("failed to create {}", bin_dir.display()), err))?;

            make_executable(&target).await?;

            let link = bin_dir.join(&bin_name);
            match fs::remove_file(&link).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(Error::filesystem(format!("failed to replace {}", link.display()), err));
                }
            }

            link_shim(&target, &link)?;

            tracing::debug!(":: linked {} -> {}", link.display(), target.display());
        }
    }

    Ok(())
}

/// Drops shims whose target vanished, typically after a removal.
pub async fn prune_dangling(node_modules: &Path) -> Result<(), Error> {
    prune_dangling_in(&node_modules.join(BIN_DIR)).await
}

/// Like [`prune_dangling`], with an explicit shim directory.
pub async fn prune_dangling_in(bin_dir: &Path) -> Result<(), Error> {
    let mut entries = match fs::read_dir(&bin_dir).await {
        Ok(entries) => entries,
        Err(_) => return Ok(()),
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        // fs::metadata follows the link; a broken link fails the stat.
        if fs::metadata(&path).await.is_err() {
            fs::remove_file(&path).await.ok();
            tracing::debug!(":: pruned dangling shim {}", path.display());
        }
    }

    Ok(())
}

/// Directories holding installed packages: `node_modules/<name>` and
/// `node_modules/@scope/<name>`.
async fn package_dirs(node_modules: &Path) -> Result<Vec<PathBuf>, Error> {
    let mut dirs = Vec::new();

    let mut entries = fs::read_dir(node_modules)
        .await
        .map_err(|err| Error::filesystem(format!("failed to read {}", node_modules.display()), err))?;

    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };

        if !path.is_dir() || file_name == BIN_DIR {
            continue;
        }

        if file_name.starts_with('@') {
            let mut scoped = match fs::read_dir(&path).await {
                Ok(scoped) => scoped,
                Err(_) => continue,
            };
            while let Ok(Some(member)) = scoped.next_entry().await {
                if member.path().is_dir() {
                    dirs.push(member.path());
                }
            }
        } else {
            dirs.push(path);
        }
    }

    Ok(dirs)
}

#[cfg(unix)]
async fn make_executable(path: &Path) -> Result<(), Error> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = fs::metadata(path)
        .await
        .map_err(|err| Error::filesystem(format!("failed to stat {}", path.display()), err))?;

    let mut permissions = metadata.permissions();
    permissions.set_mode(permissions.mode() | 0o755);

    fs::set_permissions(path, permissions)
        .await
        .map_err(|err| Error::filesystem(format!("failed to chmod {}", path.display()), err))
}

#[cfg(not(unix))]
async fn make_executable(_path: &Path) -> Result<(), Error> {
    Ok(())
}

#[cfg(unix)]
fn link_shim(target: &Path, link: &Path) -> Result<(), Error> {
    std::os::unix::fs::symlink(target, link)
        .map_err(|err| Error::filesystem(format!("failed to link {}", link.display()), err))
}

#[cfg(not(unix))]
fn link_shim(target: &Path, link: &Path) -> Result<(), Error> {
    std::fs::copy(target, link)
        .map(|_| ())
        .map_err(|err| Error::filesystem(format!("failed to copy shim {}", link.display()), err))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed_package(node_modules: &Path, name: &str, manifest: &str, bin_file: Option<&str>) {
        let dir = node_modules.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(MANIFEST_FILE), manifest).unwrap();
        if let Some(file) = bin_file {
            let path = dir.join(file);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, "#!/usr/bin/env node\n").unwrap();
        }
    }

    #[tokio::test]
    async fn links_bin_map_entries() {
        let project = tempfile::tempdir().unwrap();
        let node_modules = project.path().join("node_modules");

        seed_package(
            &node_modules,
            "tool",
            r#"{"name": "tool", "version": "1.0.0", "bin": {"tool": "./cli.js"}}"#,
            Some("cli.js"),
        );

        link_all(&node_modules).await.unwrap();

        let shim = node_modules.join(".bin/tool");
        assert!(shim.exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(node_modules.join("tool/cli.js"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o111, 0o111);
        }
    }

    #[tokio::test]
    async fn links_single_string_bin_under_package_name() {
        let project = tempfile::tempdir().unwrap();
        let node_modules = project.path().join("node_modules");

        std::fs::create_dir_all(node_modules.join("@scope")).unwrap();
        seed_package(
            &node_modules,
            "@scope/tool",
            r#"{"name": "@scope/tool", "version": "1.0.0", "bin": "./run.js"}"#,
            Some("run.js"),
        );

        link_all(&node_modules).await.unwrap();

        assert!(node_modules.join(".bin/tool").exists());
    }

    #[tokio::test]
    async fn missing_bin_target_is_skipped() {
        let project = tempfile::tempdir().unwrap();
        let node_modules = project.path().join("node_modules");

        seed_package(
            &node_modules,
            "tool",
            r#"{"name": "tool", "bin": {"tool": "./gone.js"}}"#,
            None,
        );

        link_all(&node_modules).await.unwrap();
        assert!(!node_modules.join(".bin/tool").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn prunes_dangling_shims() {
        let project = tempfile::tempdir().unwrap();
        let node_modules = project.path().join("node_modules");
        let bin_dir = node_modules.join(".bin");
        std::fs::create_dir_all(&bin_dir).unwrap();

        std::os::unix::fs::symlink("/nonexistent/target", bin_dir.join("ghost")).unwrap();

        prune_dangling(&node_modules).await.unwrap();

        assert!(std::fs::symlink_metadata(bin_dir.join("ghost")).is_err());
    }
}
