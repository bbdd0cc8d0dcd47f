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

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use glob::Pattern;
use miette::{IntoDiagnostic, WrapErr, miette};

use crate::manifest::{MANIFEST_FILE, Manifest};

/// Registry of locally declared workspace packages.
///
/// Resolved once from the project manifest's `workspaces` patterns and
/// consulted before any registry classification: a hit substitutes a
/// filesystem link for a registry fetch.
///
/// Constraints:
/// 1. Patterns go one level deep — `packages/*` or a literal directory
/// 2. Only directories with a `package.json` in their root count
#[derive(Debug, Default)]
pub struct WorkspaceSet {
    members: BTreeMap<String, WorkspaceMember>,
}

/// One resolved workspace member.
#[derive(Debug, Clone)]
pub struct WorkspaceMember {
    pub path: PathBuf,
    pub manifest: Manifest,
}

impl WorkspaceSet {
    /// Resolves workspace members beneath `root` from the manifest's
    /// patterns. Members are keyed by their manifest name.
    pub fn discover(root: impl AsRef<Path>, patterns: &[String]) -> miette::Result<Self> {
        let root = root.as_ref();
        let mut members = BTreeMap::new();

        for pattern in patterns {
            if pattern.contains(['*', '?', '[']) {
                let matcher = Pattern::new(pattern)
                    .into_diagnostic()
                    .wrap_err_with(|| miette!("invalid workspace pattern: {}", pattern))?;

                // Patterns may carry a directory prefix (`packages/*`);
                // walk the parent that precedes the first glob segment.
                let (prefix, _) = pattern
                    .split_once(['*', '?', '['])
                    .expect("pattern contains a glob character");
                let search_root = match prefix.rfind('/') {
                    Some(cut) => root.join(&prefix[..cut]),
                    None => root.to_path_buf(),
                };

                let entries = match fs::read_dir(&search_root) {
                    Ok(entries) => entries,
                    Err(_) => continue,
                };

                for entry in entries {
                    let entry = entry
                        .into_diagnostic()
                        .wrap_err_with(|| miette!("failed to read workspace directory entry"))?;

                    let path = entry.path();
                    let Ok(relative) = path.strip_prefix(root) else {
                        continue;
                    };
                    let Some(relative) = relative.to_str() else {
                        continue;
                    };

                    if path.is_dir()
                        && matcher.matches(relative)
                        && path.join(MANIFEST_FILE).exists()
                    {
                        Self::admit(&mut members, &path)?;
                    }
                }
            } else {
                let path = root.join(pattern);
                if path.is_dir() && path.join(MANIFEST_FILE).exists() {
                    Self::admit(&mut members, &path)?;
                }
            }
        }

        Ok(Self { members })
    }

    fn admit(members: &mut BTreeMap<String, WorkspaceMember>, path: &Path) -> miette::Result<()> {
        let raw = fs::read(path.join(MANIFEST_FILE))
            .into_diagnostic()
            .wrap_err_with(|| miette!("failed to read workspace manifest in {}", path.display()))?;

        let manifest: Manifest = serde_json::from_slice(&raw)
            .into_diagnostic()
            .wrap_err_with(|| miette!("invalid workspace manifest in {}", path.display()))?;

        let Some(name) = manifest.name.clone() else {
            tracing::warn!("warning: skipping unnamed workspace member in {}", path.display());
            return Ok(());
        };

        let absolute = path
            .canonicalize()
            .into_diagnostic()
            .wrap_err_with(|| miette!("failed to canonicalize {}", path.display()))?;

        members.insert(
            name,
            WorkspaceMember {
                path: absolute,
                manifest,
            },
        );

        Ok(())
    }

    /// Looks up a workspace member by package name.
    pub fn lookup(&self, name: &str) -> Option<&WorkspaceMember> {
        self.members.get(name)
    }

    /// All members, keyed by name.
    pub fn members(&self) -> &BTreeMap<String, WorkspaceMember> {
        &self.members
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn seed_member(root: &Path, dir: &str, name: &str) {
        let path = root.join(dir);
        fs::create_dir_all(&path).unwrap();
        fs::write(
            path.join(MANIFEST_FILE),
            format!(r#"{{"name": "{name}", "version": "1.0.0"}}"#),
        )
        .unwrap();
    }

    #[test]
    fn discovers_glob_members() {
        let dir = tempfile::tempdir().unwrap();
        seed_member(dir.path(), "packages/a", "pkg-a");
        seed_member(dir.path(), "packages/b", "pkg-b");
        fs::create_dir_all(dir.path().join("packages/no-manifest")).unwrap();

        let set = WorkspaceSet::discover(dir.path(), &["packages/*".into()]).unwrap();

        assert_eq!(set.members().len(), 2);
        assert!(set.lookup("pkg-a").is_some());
        assert!(set.lookup("pkg-b").is_some());
        assert!(set.lookup("no-manifest").is_none());
    }

    #[test]
    fn discovers_literal_members() {
        let dir = tempfile::tempdir().unwrap();
        seed_member(dir.path(), "special", "special-pkg");

        let set = WorkspaceSet::discover(dir.path(), &["special".into()]).unwrap();

        assert_eq!(set.members().len(), 1);
        let member = set.lookup("special-pkg").unwrap();
        assert!(member.path.ends_with("special"));
        assert_eq!(member.manifest.version.as_deref(), Some("1.0.0"));
    }

    #[test]
    fn empty_patterns_resolve_to_no_members() {
        let dir = tempfile::tempdir().unwrap();
        let set = WorkspaceSet::discover(dir.path(), &[]).unwrap();
        assert!(set.members().is_empty());
    }
}
