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

//! Yarn v1 lock import.
//!
//! A bootstrap path: when a project carries a `yarn.lock` but no native
//! lock file, the yarn resolution is converted into our lock shape so
//! the first install does not have to re-resolve the world.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::lock::{LockEntry, Lockfile};
use crate::manifest::{DependencyKind, DependencyMap, Manifest};
use crate::solver;

/// The yarn v1 lock file name
pub const YARN_LOCKFILE: &str = "yarn.lock";

/// One resolution block of a yarn v1 lock.
#[derive(Debug, Default, Clone, PartialEq)]
struct YarnEntry {
    descriptors: Vec<(String, String)>,
    version: String,
    resolved: Option<String>,
    integrity: Option<String>,
    dependencies: DependencyMap,
}

/// Splits `name@range`, keeping the scope marker with the name.
fn split_descriptor(descriptor: &str) -> Option<(String, String)> {
    if descriptor.len() < 2 {
        return None;
    }
    let at = descriptor[1..].find('@')? + 1;
    Some((
        descriptor[..at].to_owned(),
        descriptor[at + 1..].to_owned(),
    ))
}

fn unquote(raw: &str) -> &str {
    raw.trim_matches('"')
}

/// Parses the yarn v1 text format: unindented descriptor headers, two
/// space indented fields, four space indented dependency rows.
fn parse(text: &str) -> Vec<YarnEntry> {
    enum Section {
        Fields,
        Dependencies,
    }

    let mut entries: Vec<YarnEntry> = Vec::new();
    let mut section = Section::Fields;

    for line in text.lines() {
        if line.trim().is_empty() || line.trim_start().starts_with('#') {
            continue;
        }

        if !line.starts_with(' ') {
            // Header: `descriptor[, descriptor...]:`
            let Some(header) = line.strip_suffix(':') else {
                continue;
            };

            let descriptors = header
                .split(", ")
                .filter_map(|raw| split_descriptor(unquote(raw.trim())))
                .collect();

            entries.push(YarnEntry {
                descriptors,
                ..Default::default()
            });
            section = Section::Fields;
            continue;
        }

        let Some(entry) = entries.last_mut() else {
            continue;
        };

        let depth = line.len() - line.trim_start().len();
        let trimmed = line.trim_start();

        if depth == 2 {
            if trimmed == "dependencies:" || trimmed == "optionalDependencies:" {
                section = Section::Dependencies;
                continue;
            }
            section = Section::Fields;

            let Some((field, value)) = trimmed.split_once(' ') else {
                continue;
            };
            let value = unquote(value.trim()).to_owned();

            match field {
                "version" => entry.version = value,
                "resolved" => entry.resolved = Some(value),
                "integrity" => entry.integrity = Some(value),
                _ => {}
            }
        } else if depth >= 4 && matches!(section, Section::Dependencies) {
            let Some((name, range)) = trimmed.split_once(' ') else {
                continue;
            };
            entry
                .dependencies
                .insert(unquote(name).to_owned(), unquote(range.trim()).to_owned());
        }
    }

    entries.retain(|entry| !entry.version.is_empty() && !entry.descriptors.is_empty());
    entries
}

/// Finds the yarn resolution for a request, preferring the exact
/// descriptor and falling back to any satisfying version of the name.
fn find<'a>(entries: &'a [YarnEntry], name: &str, range: &str) -> Option<&'a YarnEntry> {
    entries
        .iter()
        .find(|entry| {
            entry
                .descriptors
                .iter()
                .any(|(n, r)| n == name && r == range)
        })
        .or_else(|| {
            entries.iter().find(|entry| {
                entry.descriptors.iter().any(|(n, _)| n == name)
                    && solver::satisfies(&entry.version, range)
            })
        })
        .or_else(|| {
            entries
                .iter()
                .find(|entry| entry.descriptors.iter().any(|(n, _)| n == name))
        })
}

/// Converts a yarn v1 lock into our lock shape, walking the project's
/// declared dependencies and applying the same hoist-first placement
/// the resolver uses.
pub fn convert(yarn_text: &str, manifest: &Manifest) -> Lockfile {
    let entries = parse(yarn_text);

    let mut lock = Lockfile {
        name: manifest.name.clone(),
        version: manifest.version.clone(),
        dependencies: manifest.dependencies.clone(),
        dev_dependencies: manifest.dev_dependencies.clone(),
        optional_dependencies: manifest.optional_dependencies.clone(),
        peer_dependencies: manifest.peer_dependencies.clone(),
        ..Default::default()
    };

    struct Request {
        name: String,
        range: String,
        parent: Option<String>,
        dev: bool,
        optional: bool,
    }

    let mut queue: VecDeque<Request> = manifest
        .declared(true)
        .into_iter()
        .map(|(name, range, kind)| Request {
            name,
            range,
            parent: None,
            dev: matches!(kind, DependencyKind::Dev),
            optional: matches!(kind, DependencyKind::Optional),
        })
        .collect();

    let mut hoisted: HashMap<String, String> = HashMap::new();
    let mut processed: HashSet<String> = HashSet::new();

    while let Some(request) = queue.pop_front() {
        let Some(entry) = find(&entries, &request.name, &request.range) else {
            tracing::warn!(
                "warning: yarn lock has no resolution for {}@{}",
                request.name,
                request.range
            );
            continue;
        };

        let path = match hoisted.get(&request.name) {
            Some(version)
                if *version == entry.version || solver::satisfies(version, &request.range) =>
            {
                continue;
            }
            Some(_) => match &request.parent {
                Some(parent) => format!("{parent}/node_modules/{}", request.name),
                None => continue,
            },
            None => {
                hoisted.insert(request.name.clone(), entry.version.clone());
                format!("node_modules/{}", request.name)
            }
        };

        if !processed.insert(format!("{path}@{}", entry.version)) {
            continue;
        }

        // Yarn appends the legacy hash as a URL fragment.
        let resolved = entry
            .resolved
            .as_deref()
            .map(|url| url.split('#').next().unwrap_or(url).to_owned());

        lock.packages.insert(
            path.clone(),
            LockEntry {
                name: Some(request.name.clone()),
                version: Some(entry.version.clone()),
                resolved,
                integrity: entry.integrity.clone(),
                dev: request.dev,
                optional: request.optional,
                dependencies: entry.dependencies.clone(),
                ..Default::default()
            },
        );

        for (child, range) in &entry.dependencies {
            if child == &request.name {
                continue;
            }
            queue.push_back(Request {
                name: child.clone(),
                range: range.clone(),
                parent: Some(path.clone()),
                dev: request.dev,
                optional: request.optional,
            });
        }
    }

    lock
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const YARN_LOCK: &str = r#"# THIS IS AN AUTOGENERATED FILE. DO NOT EDIT THIS FILE DIRECTLY.
# yarn lockfile v1


is-number@^6.0.0:
  version "6.0.0"
  resolved "https://registry.yarnpkg.com/is-number/-/is-number-6.0.0.tgz#1234abcd"
  integrity sha512-numbernumber==

is-odd@3.0.1:
  version "3.0.1"
  resolved "https://registry.yarnpkg.com/is-odd/-/is-odd-3.0.1.tgz#deadbeef"
  integrity sha512-oddodd==
  dependencies:
    is-number "^6.0.0"

"@scope/tool@^1.0.0", "@scope/tool@^1.2.0":
  version "1.5.0"
  resolved "https://registry.yarnpkg.com/@scope/tool/-/tool-1.5.0.tgz#cafebabe"
  integrity sha512-tooltool==
"#;

    #[test]
    fn parses_entries_and_descriptors() {
        let entries = parse(YARN_LOCK);
        assert_eq!(entries.len(), 3);

        let odd = entries.iter().find(|e| e.version == "3.0.1").unwrap();
        assert_eq!(odd.descriptors, vec![("is-odd".to_owned(), "3.0.1".to_owned())]);
        assert_eq!(odd.dependencies.get("is-number").unwrap(), "^6.0.0");
        assert_eq!(odd.integrity.as_deref(), Some("sha512-oddodd=="));

        let tool = entries.iter().find(|e| e.version == "1.5.0").unwrap();
        assert_eq!(tool.descriptors.len(), 2);
        assert_eq!(tool.descriptors[0].0, "@scope/tool");
    }

    #[test]
    fn converts_declared_graph() {
        let manifest: Manifest = serde_json::from_str(
            r#"{"name": "app", "version": "1.0.0", "dependencies": {"is-odd": "3.0.1"}}"#,
        )
        .unwrap();

        let lock = convert(YARN_LOCK, &manifest);

        assert_eq!(lock.dependencies.get("is-odd").unwrap(), "3.0.1");

        let odd = lock.packages.get("node_modules/is-odd").unwrap();
        assert_eq!(odd.version.as_deref(), Some("3.0.1"));
        // The legacy hash fragment is dropped.
        assert_eq!(
            odd.resolved.as_deref(),
            Some("https://registry.yarnpkg.com/is-odd/-/is-odd-3.0.1.tgz")
        );

        let number = lock.packages.get("node_modules/is-number").unwrap();
        assert_eq!(number.version.as_deref(), Some("6.0.0"));
    }

    #[test]
    fn dev_seeds_mark_their_closure() {
        let manifest: Manifest = serde_json::from_str(
            r#"{"devDependencies": {"is-odd": "3.0.1"}}"#,
        )
        .unwrap();

        let lock = convert(YARN_LOCK, &manifest);

        assert!(lock.packages.get("node_modules/is-odd").unwrap().dev);
        assert!(lock.packages.get("node_modules/is-number").unwrap().dev);
    }

    #[test]
    fn unknown_descriptor_is_skipped() {
        let manifest: Manifest =
            serde_json::from_str(r#"{"dependencies": {"ghost": "^1.0.0"}}"#).unwrap();

        let lock = convert(YARN_LOCK, &manifest);
        assert!(lock.packages.is_empty());
    }

    #[test]
    fn range_fallback_matches_satisfying_version() {
        let manifest: Manifest =
            serde_json::from_str(r#"{"dependencies": {"@scope/tool": "^1.1.0"}}"#).unwrap();

        let lock = convert(YARN_LOCK, &manifest);

        let tool = lock.packages.get("node_modules/@scope/tool").unwrap();
        assert_eq!(tool.version.as_deref(), Some("1.5.0"));
    }
}
