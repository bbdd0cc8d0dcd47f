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

//! Lockfile model and writer.
//!
//! The lock pins the resolved tree: top-level dependency maps carry the
//! user's verbatim range strings, the `packages` map is keyed by
//! hierarchical `node_modules/...` paths. Serialization is
//! deterministic (sorted maps, fixed field order, two-space indent,
//! terminal newline) and writes are atomic.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs;

use crate::errors::Error;
use crate::fsutil;
use crate::manifest::{Bin, DependencyMap, PeerMeta};
use crate::solver;

/// The lock file written next to the project manifest
pub const LOCKFILE: &str = "package-lock.json";

const LOCKFILE_VERSION: u32 = 3;

fn lockfile_version_default() -> u32 {
    LOCKFILE_VERSION
}

fn requires_default() -> bool {
    true
}

fn is_false(value: &bool) -> bool {
    !value
}

/// One record in the lock's packages map.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LockEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity: Option<String>,
    /// Entity tag of the manifest this entry was resolved from.
    /// Implementation extension, not part of the well-known format.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub link: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub optional: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub dev: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dependencies: DependencyMap,
    #[serde(default, rename = "devDependencies", skip_serializing_if = "BTreeMap::is_empty")]
    pub dev_dependencies: DependencyMap,
    #[serde(
        default,
        rename = "optionalDependencies",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub optional_dependencies: DependencyMap,
    #[serde(default, rename = "peerDependencies", skip_serializing_if = "BTreeMap::is_empty")]
    pub peer_dependencies: DependencyMap,
    #[serde(
        default,
        rename = "peerDependenciesMeta",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub peer_dependencies_meta: BTreeMap<String, PeerMeta>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub os: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cpu: Vec<String>,
    #[serde(default, skip_serializing_if = "Bin::is_empty")]
    pub bin: Bin,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub engines: Value,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl LockEntry {
    /// The effective (registry) name behind this entry. For aliases it
    /// differs from the placement name and is recovered from the
    /// resolved tarball URL (`<registry>/<name>/-/<file>.tgz`).
    pub fn effective_name(&self, placement_name: &str) -> String {
        let Some(resolved) = self.resolved.as_deref() else {
            return placement_name.to_owned();
        };

        if let Ok(url) = url::Url::parse(resolved) {
            let path = url.path();
            if let Some((prefix, _)) = path.split_once("/-/") {
                let name = prefix.trim_start_matches('/');
                if !name.is_empty() {
                    return name.replace("%2F", "/").replace("%2f", "/");
                }
            }
        }

        placement_name.to_owned()
    }
}

/// The project's lock state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Lockfile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(rename = "lockfileVersion", default = "lockfile_version_default")]
    pub lockfile_version: u32,
    #[serde(default = "requires_default")]
    pub requires: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub workspaces: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dependencies: DependencyMap,
    #[serde(default, rename = "devDependencies", skip_serializing_if = "BTreeMap::is_empty")]
    pub dev_dependencies: DependencyMap,
    #[serde(
        default,
        rename = "optionalDependencies",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub optional_dependencies: DependencyMap,
    #[serde(default, rename = "peerDependencies", skip_serializing_if = "BTreeMap::is_empty")]
    pub peer_dependencies: DependencyMap,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub packages: BTreeMap<String, LockEntry>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Default for Lockfile {
    fn default() -> Self {
        Self {
            name: None,
            version: None,
            lockfile_version: LOCKFILE_VERSION,
            requires: true,
            workspaces: BTreeMap::new(),
            dependencies: DependencyMap::new(),
            dev_dependencies: DependencyMap::new(),
            optional_dependencies: DependencyMap::new(),
            peer_dependencies: DependencyMap::new(),
            packages: BTreeMap::new(),
            extra: BTreeMap::new(),
        }
    }
}

/// The placement name of a packages-map key: the segment after the
/// final `/node_modules/`, scope included.
pub fn entry_name(key: &str) -> &str {
    key.rsplit_once("/node_modules/")
        .map(|(_, name)| name)
        .or_else(|| key.strip_prefix("node_modules/"))
        .unwrap_or(key)
}

impl Lockfile {
    /// Whether a lock file exists in the current working directory.
    pub async fn exists() -> Result<bool, Error> {
        fs::try_exists(LOCKFILE)
            .await
            .map_err(|err| Error::filesystem("failed to detect lock file", err))
    }

    /// Reads the lock file from an explicit path.
    pub async fn read_from(path: &Path) -> Result<Self, Error> {
        let contents = fs::read(path)
            .await
            .map_err(|err| Error::filesystem(format!("failed to read {}", path.display()), err))?;

        serde_json::from_slice(&contents).map_err(|source| Error::MalformedLock {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Reads the lock file or starts a fresh one when absent.
    pub async fn read_or_default(path: &Path) -> Result<Self, Error> {
        if fs::try_exists(path).await.unwrap_or(false) {
            Self::read_from(path).await
        } else {
            Ok(Self::default())
        }
    }

    /// Renders the lock with the two-space indent and terminal newline
    /// the well-known format mandates.
    pub fn render(&self) -> String {
        let mut rendered = serde_json::to_string_pretty(self).expect("lockfile serializes");
        rendered.push('\n');
        rendered
    }

    /// Writes the full lock file atomically.
    pub async fn create(&self, path: &Path) -> Result<(), Error> {
        fsutil::write_atomic(path, self.render().as_bytes()).await
    }

    /// Applies this partial lock on top of the file at `path`: top-level
    /// maps merge in, conflicting packages keys go through nesting
    /// relocation, and the result is written atomically. Unknown fields
    /// of the existing file are preserved.
    pub async fn update(&self, path: &Path) -> Result<(), Error> {
        let mut existing = Self::read_or_default(path).await?;
        existing.merge(self.clone());
        existing.create(path).await
    }

    /// Merges a partial lock into this one.
    pub fn merge(&mut self, partial: Lockfile) {
        if partial.name.is_some() {
            self.name = partial.name;
        }
        if partial.version.is_some() {
            self.version = partial.version;
        }

        self.workspaces.extend(partial.workspaces);
        self.dependencies.extend(partial.dependencies);
        self.dev_dependencies.extend(partial.dev_dependencies);
        self.optional_dependencies.extend(partial.optional_dependencies);
        self.peer_dependencies.extend(partial.peer_dependencies);

        for (key, entry) in partial.packages {
            self.merge_entry(key, entry);
        }
    }

    /// Inserts one packages-map entry, relocating a conflicting occupant
    /// beneath its dependents when versions diverge.
    fn merge_entry(&mut self, key: String, entry: LockEntry) {
        let Some(occupant) = self.packages.remove(&key) else {
            self.packages.insert(key, entry);
            return;
        };

        if occupant.version == entry.version {
            self.packages.insert(key, entry);
            return;
        }

        let name = entry_name(&key).to_owned();
        let occupant_version = occupant.version.clone().unwrap_or_default();

        // Keep the displaced version reachable for dependents the new
        // version does not satisfy.
        let dependents: Vec<String> = self
            .packages
            .iter()
            .filter(|(path, candidate)| {
                **path != key
                    && candidate.dependencies.get(&name).is_some_and(|range| {
                        solver::satisfies(&occupant_version, range)
                            && !entry
                                .version
                                .as_deref()
                                .is_some_and(|version| solver::satisfies(version, range))
                    })
            })
            .map(|(path, _)| path.clone())
            .collect();

        for dependent in dependents {
            let nested = format!("{dependent}/node_modules/{name}");
            self.packages.entry(nested).or_insert_with(|| occupant.clone());
        }

        self.packages.insert(key, entry);
    }
}
