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

//! Reconciliation between the declared manifest and the recorded lock:
//! install/remove deltas, orphan analysis for removals, and the
//! production prune.

use std::collections::{BTreeSet, VecDeque};

use crate::lock::Lockfile;
use crate::manifest::{DependencyKind, Manifest};
use crate::resolver::Seed;

/// The work an incremental install has to do.
#[derive(Debug, Default, PartialEq)]
pub struct Delta {
    /// Declared entries missing from the lock or pinned differently.
    pub install: Vec<(String, String, DependencyKind)>,
    /// Locked top-level entries no longer declared anywhere.
    pub remove: Vec<String>,
}

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.install.is_empty() && self.remove.is_empty()
    }

    /// The install half as resolver seeds.
    pub fn seeds(&self) -> Vec<Seed> {
        self.install
            .iter()
            .map(|(name, spec, kind)| Seed::new(name.clone(), spec.clone(), *kind))
            .collect()
    }
}

/// Diffs the declared manifest against the recorded lock.
pub fn diff(manifest: &Manifest, lock: &Lockfile) -> Delta {
    let mut delta = Delta::default();

    let tables = [
        (&manifest.dependencies, &lock.dependencies, DependencyKind::Runtime),
        (&manifest.dev_dependencies, &lock.dev_dependencies, DependencyKind::Dev),
        (
            &manifest.optional_dependencies,
            &lock.optional_dependencies,
            DependencyKind::Optional,
        ),
    ];

    for (declared, locked, kind) in tables {
        for (name, spec) in declared {
            if locked.get(name) != Some(spec) {
                delta.install.push((name.clone(), spec.clone(), kind));
            }
        }
    }

    for name in lock.dependencies.keys() {
        if !manifest.declares(name) {
            delta.remove.push(name.clone());
        }
    }

    delta
}

/// The dependency edges leaving `path`, resolved against the tree:
/// nested entries shadow hoisted ones.
pub(crate) fn edges(lock: &Lockfile, path: &str) -> Vec<String> {
    let Some(entry) = lock.packages.get(path) else {
        return Vec::new();
    };

    entry
        .dependencies
        .keys()
        .chain(entry.optional_dependencies.keys())
        .chain(entry.peer_dependencies.keys())
        .filter_map(|name| {
            let nested = format!("{path}/node_modules/{name}");
            if lock.packages.contains_key(&nested) {
                Some(nested)
            } else {
                let hoisted = format!("node_modules/{name}");
                lock.packages.contains_key(&hoisted).then_some(hoisted)
            }
        })
        .collect()
}

/// All package paths reachable from the given top-level names.
pub fn reachable<'a>(
    lock: &Lockfile,
    roots: impl IntoIterator<Item = &'a str>,
) -> BTreeSet<String> {
    let mut seen = BTreeSet::new();
    let mut queue: VecDeque<String> = roots
        .into_iter()
        .map(|name| format!("node_modules/{name}"))
        .filter(|path| lock.packages.contains_key(path))
        .collect();

    while let Some(path) = queue.pop_front() {
        if !seen.insert(path.clone()) {
            continue;
        }

        for next in edges(lock, &path) {
            if !seen.contains(&next) {
                queue.push_back(next);
            }
        }
    }

    seen
}

/// The closure reachable only through `name`: packages reachable from
/// its root slot but from no other top-level dependency. These are the
/// paths a removal deletes.
pub fn orphans(lock: &Lockfile, name: &str) -> BTreeSet<String> {
    let other_roots: Vec<&str> = lock
        .dependencies
        .keys()
        .chain(lock.dev_dependencies.keys())
        .chain(lock.optional_dependencies.keys())
        .chain(lock.peer_dependencies.keys())
        .map(String::as_str)
        .filter(|root| *root != name)
        .collect();

    let keep = reachable(lock, other_roots);
    let candidates = reachable(lock, [name]);

    candidates.difference(&keep).cloned().collect()
}

/// Paths to drop from the tree for a production install: everything
/// not reachable through a non-dev top-level entry.
pub fn production_prune(lock: &Lockfile) -> BTreeSet<String> {
    let keep_roots: Vec<&str> = lock
        .dependencies
        .keys()
        .chain(lock.optional_dependencies.keys())
        .chain(lock.peer_dependencies.keys())
        .map(String::as_str)
        .collect();

    let keep = reachable(lock, keep_roots);

    lock.packages
        .keys()
        .filter(|path| !keep.contains(*path))
        .cloned()
        .collect()
}

/// Strips a removal closure out of the lock: the orphaned paths, every
/// entry nested beneath them, and the top-level table rows.
pub fn strip(lock: &mut Lockfile, name: &str, orphaned: &BTreeSet<String>) {
    lock.packages.retain(|path, _| {
        !orphaned.contains(path)
            && !orphaned
                .iter()
                .any(|orphan| path.starts_with(&format!("{orphan}/node_modules/")))
    });

    lock.dependencies.remove(name);
    lock.dev_dependencies.remove(name);
    lock.optional_dependencies.remove(name);
    lock.peer_dependencies.remove(name);
}
