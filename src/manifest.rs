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
    collections::{BTreeMap, BTreeSet},
    fmt,
    path::Path,
};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tokio::fs;

use crate::errors::Error;
use crate::fsutil;

/// The project manifest read from the working directory
pub const MANIFEST_FILE: &str = "package.json";

/// Map of package name to constraint string
pub type DependencyMap = BTreeMap<String, String>;

/// Which dependency table an entry was declared in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DependencyKind {
    Runtime,
    Dev,
    Optional,
    Peer,
}

impl fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DependencyKind::Runtime => write!(f, "dependencies"),
            DependencyKind::Dev => write!(f, "devDependencies"),
            DependencyKind::Optional => write!(f, "optionalDependencies"),
            DependencyKind::Peer => write!(f, "peerDependencies"),
        }
    }
}

/// A `package.json` manifest.
///
/// This doubles as the project manifest and as the manifest read from an
/// extracted package, which is why every field is optional. Unknown
/// fields survive a read/modify/write cycle through the flattened map.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Manifest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "License::is_absent")]
    pub license: License,
    #[serde(
        default,
        deserialize_with = "lenient_map",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub dependencies: DependencyMap,
    #[serde(
        default,
        rename = "devDependencies",
        deserialize_with = "lenient_map",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub dev_dependencies: DependencyMap,
    #[serde(
        default,
        rename = "optionalDependencies",
        deserialize_with = "lenient_map",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub optional_dependencies: DependencyMap,
    #[serde(
        default,
        rename = "peerDependencies",
        deserialize_with = "lenient_map",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub peer_dependencies: DependencyMap,
    #[serde(
        default,
        rename = "peerDependenciesMeta",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub peer_dependencies_meta: BTreeMap<String, PeerMeta>,
    #[serde(default, skip_serializing_if = "Workspaces::is_empty")]
    pub workspaces: Workspaces,
    #[serde(
        default,
        rename = "trustedDependencies",
        skip_serializing_if = "BTreeSet::is_empty"
    )]
    pub trusted_dependencies: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub scripts: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub os: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cpu: Vec<String>,
    #[serde(default, skip_serializing_if = "Bin::is_empty")]
    pub bin: Bin,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Peer dependency metadata (`peerDependenciesMeta` values).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerMeta {
    #[serde(default)]
    pub optional: bool,
}

/// The `license` field, which may be an SPDX string, a legacy
/// `{ "type": ... }` object, or absent. Resolver logic never sees the
/// raw dynamic value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum License {
    Spdx(String),
    Object(String),
    #[default]
    Absent,
}

impl License {
    pub fn is_absent(&self) -> bool {
        matches!(self, License::Absent)
    }

    /// The license identifier, however it was spelled.
    pub fn id(&self) -> Option<&str> {
        match self {
            License::Spdx(id) | License::Object(id) => Some(id),
            License::Absent => None,
        }
    }
}

impl Serialize for License {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            License::Spdx(id) => id.serialize(serializer),
            License::Object(id) => {
                let mut object = BTreeMap::new();
                object.insert("type", id.as_str());
                object.serialize(serializer)
            }
            License::Absent => serializer.serialize_none(),
        }
    }
}

impl<'de> Deserialize<'de> for License {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;

        Ok(match value {
            Value::String(id) => License::Spdx(id),
            Value::Object(map) => match map.get("type").and_then(Value::as_str) {
                Some(id) => License::Object(id.to_owned()),
                None => License::Absent,
            },
            _ => License::Absent,
        })
    }
}

/// The `workspaces` field: either a bare pattern array or the legacy
/// `{ "packages": [...] }` object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Workspaces(pub Vec<String>);

impl Workspaces {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'de> Deserialize<'de> for Workspaces {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Patterns(Vec<String>),
            Object {
                #[serde(default)]
                packages: Vec<String>,
            },
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Patterns(patterns) => Workspaces(patterns),
            Raw::Object { packages } => Workspaces(packages),
        })
    }
}

/// The `bin` field: a single path (binary named after the package) or a
/// map of binary name to path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Bin {
    Single(String),
    Map(BTreeMap<String, String>),
    #[default]
    #[serde(skip)]
    Empty,
}

impl Bin {
    pub fn is_empty(&self) -> bool {
        matches!(self, Bin::Empty)
    }

    /// Normalizes to (binary name, relative path) pairs. A bare string
    /// takes the package's unscoped name.
    pub fn entries(&self, package: &str) -> Vec<(String, String)> {
        match self {
            Bin::Single(path) => {
                let bare = package.rsplit('/').next().unwrap_or(package);
                vec![(bare.to_owned(), path.clone())]
            }
            Bin::Map(map) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            Bin::Empty => Vec::new(),
        }
    }
}

/// Accepts a dependency map, the legacy empty-array spelling, or null.
fn lenient_map<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DependencyMap, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Map(DependencyMap),
        LegacyArray(Vec<Value>),
        Null,
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Map(map) => map,
        Raw::LegacyArray(_) | Raw::Null => DependencyMap::new(),
    })
}

impl Manifest {
    /// Whether a manifest is present in the current working directory.
    pub async fn exists() -> Result<bool, Error> {
        fs::try_exists(MANIFEST_FILE)
            .await
            .map_err(|err| Error::filesystem("failed to detect manifest", err))
    }

    /// Reads the manifest from the current working directory.
    pub async fn read() -> Result<Self, Error> {
        Self::try_read_from(Path::new(MANIFEST_FILE)).await
    }

    /// Reads a manifest from an explicit path.
    pub async fn try_read_from(path: &Path) -> Result<Self, Error> {
        let contents = fs::read(path)
            .await
            .map_err(|err| Error::filesystem(format!("failed to read {}", path.display()), err))?;

        serde_json::from_slice(&contents).map_err(|source| Error::MalformedManifest {
            name: path.display().to_string(),
            source,
        })
    }

    /// Writes the manifest to the current working directory.
    pub async fn write(&self) -> Result<(), Error> {
        self.write_at(Path::new(MANIFEST_FILE)).await
    }

    /// Writes the manifest to an explicit path, pretty-printed with the
    /// registry's two-space convention and a terminal newline.
    pub async fn write_at(&self, path: &Path) -> Result<(), Error> {
        let mut rendered = serde_json::to_string_pretty(self).expect("manifest serializes");
        rendered.push('\n');

        fsutil::write_atomic(path, rendered.as_bytes()).await
    }

    /// All declared dependencies, tagged with the table they came from.
    pub fn declared(&self, include_dev: bool) -> Vec<(String, String, DependencyKind)> {
        let mut declared = Vec::new();

        for (name, spec) in &self.dependencies {
            declared.push((name.clone(), spec.clone(), DependencyKind::Runtime));
        }

        if include_dev {
            for (name, spec) in &self.dev_dependencies {
                declared.push((name.clone(), spec.clone(), DependencyKind::Dev));
            }
        }

        for (name, spec) in &self.optional_dependencies {
            declared.push((name.clone(), spec.clone(), DependencyKind::Optional));
        }

        for (name, spec) in &self.peer_dependencies {
            declared.push((name.clone(), spec.clone(), DependencyKind::Peer));
        }

        declared
    }

    /// Whether any declared table mentions `name`.
    pub fn declares(&self, name: &str) -> bool {
        self.dependencies.contains_key(name)
            || self.dev_dependencies.contains_key(name)
            || self.optional_dependencies.contains_key(name)
            || self.peer_dependencies.contains_key(name)
    }

    /// Whether an optional peer dependency is declared as optional.
    pub fn peer_is_optional(&self, name: &str) -> bool {
        self.peer_dependencies_meta
            .get(name)
            .map(|meta| meta.optional)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_minimal_manifest() {
        let manifest: Manifest = serde_json::from_str(r#"{"name": "app", "version": "1.0.0"}"#).unwrap();

        assert_eq!(manifest.name.as_deref(), Some("app"));
        assert!(manifest.dependencies.is_empty());
    }

    #[test]
    fn legacy_empty_array_is_an_empty_map() {
        let manifest: Manifest =
            serde_json::from_str(r#"{"dependencies": [], "devDependencies": {"is-even": "1.0.0"}}"#)
                .unwrap();

        assert!(manifest.dependencies.is_empty());
        assert_eq!(manifest.dev_dependencies.get("is-even").unwrap(), "1.0.0");
    }

    #[test]
    fn license_variants() {
        let spdx: Manifest = serde_json::from_str(r#"{"license": "MIT"}"#).unwrap();
        assert_eq!(spdx.license, License::Spdx("MIT".into()));
        assert_eq!(spdx.license.id(), Some("MIT"));

        let object: Manifest =
            serde_json::from_str(r#"{"license": {"type": "Apache-2.0", "url": "x"}}"#).unwrap();
        assert_eq!(object.license, License::Object("Apache-2.0".into()));

        let absent: Manifest = serde_json::from_str("{}").unwrap();
        assert_eq!(absent.license, License::Absent);
        assert_eq!(absent.license.id(), None);
    }

    #[test]
    fn workspaces_array_and_object_forms() {
        let array: Manifest = serde_json::from_str(r#"{"workspaces": ["packages/*"]}"#).unwrap();
        assert_eq!(array.workspaces.0, vec!["packages/*"]);

        let object: Manifest =
            serde_json::from_str(r#"{"workspaces": {"packages": ["libs/*"]}}"#).unwrap();
        assert_eq!(object.workspaces.0, vec!["libs/*"]);
    }

    #[test]
    fn bin_string_and_map_forms() {
        let single: Manifest = serde_json::from_str(r#"{"bin": "./cli.js"}"#).unwrap();
        assert_eq!(
            single.bin.entries("@scope/tool"),
            vec![("tool".to_owned(), "./cli.js".to_owned())]
        );

        let map: Manifest = serde_json::from_str(r#"{"bin": {"tool": "./cli.js"}}"#).unwrap();
        assert_eq!(
            map.bin.entries("anything"),
            vec![("tool".to_owned(), "./cli.js".to_owned())]
        );
    }

    #[test]
    fn unknown_fields_survive_roundtrip() {
        let source = r#"{"name": "app", "homepage": "https://example.com"}"#;
        let manifest: Manifest = serde_json::from_str(source).unwrap();

        let rendered = serde_json::to_string(&manifest).unwrap();
        assert!(rendered.contains("homepage"));
    }

    #[test]
    fn peer_meta_marks_optional() {
        let manifest: Manifest = serde_json::from_str(
            r#"{
                "peerDependencies": {"react": "^18"},
                "peerDependenciesMeta": {"react": {"optional": true}}
            }"#,
        )
        .unwrap();

        assert!(manifest.peer_is_optional("react"));
        assert!(!manifest.peer_is_optional("vue"));
    }

    #[test]
    fn declared_respects_production() {
        let manifest: Manifest = serde_json::from_str(
            r#"{"dependencies": {"a": "1"}, "devDependencies": {"b": "2"}}"#,
        )
        .unwrap();

        let production = manifest.declared(false);
        assert_eq!(production.len(), 1);
        assert_eq!(production[0].0, "a");

        let all = manifest.declared(true);
        assert_eq!(all.len(), 2);
    }
}
