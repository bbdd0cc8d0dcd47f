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

//! Version selection against a packument.
//!
//! Constraints are npm ranges as understood by `node-semver`. The
//! symbolic constraints `latest`, `*` and the empty string select the
//! `latest` dist-tag, `next` selects the `next` dist-tag. A range that
//! matches no published version falls back to `latest` with a warning
//! rather than failing the run.

use node_semver::{Range, Version};

use crate::errors::Error;
use crate::registry::Packument;

/// Whether the constraint is one of the symbolic "give me the newest"
/// spellings.
fn wants_latest(constraint: &str) -> bool {
    matches!(constraint.trim(), "" | "*" | "latest")
}

/// Picks the concrete version for `constraint` out of a packument.
///
/// Returns the highest version in the version map satisfying the
/// constraint; symbolic constraints and unsatisfiable ranges resolve
/// through dist-tags as documented on the module.
pub fn resolve(constraint: &str, packument: &Packument) -> Result<String, Error> {
    let constraint = constraint.trim();

    if wants_latest(constraint) {
        return dist_tag(packument, "latest");
    }

    if constraint == "next" {
        return dist_tag(packument, "next").or_else(|_| dist_tag(packument, "latest"));
    }

    let Ok(range) = Range::parse(constraint) else {
        tracing::warn!(
            "warning: unparseable constraint {constraint:?} for {}, using latest",
            packument.name
        );
        return dist_tag(packument, "latest");
    };

    let best = packument
        .versions
        .keys()
        .filter_map(|raw| Version::parse(raw).ok().map(|parsed| (raw, parsed)))
        .filter(|(_, parsed)| range.satisfies(parsed))
        .max_by(|(_, a), (_, b)| a.cmp(b))
        .map(|(raw, _)| raw.clone());

    match best {
        Some(version) => Ok(version),
        None => {
            tracing::warn!(
                "warning: no version of {} satisfies {constraint:?}, falling back to latest",
                packument.name
            );
            dist_tag(packument, "latest")
        }
    }
}

fn dist_tag(packument: &Packument, tag: &str) -> Result<String, Error> {
    packument
        .dist_tags
        .get(tag)
        .cloned()
        .ok_or_else(|| Error::NotFound(format!("{}@{tag}", packument.name)))
}

/// Whether a concrete version satisfies a constraint. Symbolic
/// constraints accept any version; unparseable input never satisfies.
pub fn satisfies(version: &str, constraint: &str) -> bool {
    if wants_latest(constraint) || constraint.trim() == "next" {
        return true;
    }

    let (Ok(version), Ok(range)) = (Version::parse(version), Range::parse(constraint.trim()))
    else {
        return false;
    };

    range.satisfies(&version)
}
