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

use std::path::{Path, PathBuf};

use miette::{IntoDiagnostic, WrapErr, miette};
use tokio::fs;
use url::Url;

/// Global configuration directory for `nopa`
pub const NOPA_HOME: &str = ".nopa";
/// Environment variable overriding the base cache directory
pub const HOME_ENV: &str = "NOPA_HOME";
/// Environment variable overriding the registry base URL
pub const REGISTRY_ENV: &str = "NOPA_REGISTRY";
/// Default registry consulted when no override is configured
pub const DEFAULT_REGISTRY: &str = "https://registry.npmjs.org";
/// User agent sent with every registry request
pub const USER_AGENT: &str = concat!("nopa/", env!("CARGO_PKG_VERSION"));

/// Discovered configuration: the base cache directory and the registry
/// to resolve against.
///
/// The base directory holds `manifest/` (cached registry metadata),
/// `tarball/` (downloaded archives), `packages/` (extracted packages),
/// `etag/` (entity tags for conditional refresh) and `global/` (the
/// global installation root).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    base: PathBuf,
    registry: Url,
}

impl Config {
    /// Discovers the configuration from the environment.
    pub fn load() -> miette::Result<Self> {
        let base = match std::env::var_os(HOME_ENV) {
            Some(dir) => PathBuf::from(dir),
            None => home::home_dir()
                .ok_or_else(|| miette!("failed to locate home directory"))?
                .join(NOPA_HOME),
        };

        let registry = match std::env::var(REGISTRY_ENV) {
            Ok(url) => url
                .parse()
                .into_diagnostic()
                .wrap_err(miette!("invalid {REGISTRY_ENV} value: {url}"))?,
            Err(_) => DEFAULT_REGISTRY.parse().expect("default registry url parses"),
        };

        Ok(Self { base, registry })
    }

    /// Configuration rooted at an explicit directory, used by tests.
    pub fn with_base(base: impl Into<PathBuf>, registry: Url) -> Self {
        Self {
            base: base.into(),
            registry,
        }
    }

    /// Creates the expected directory structure underneath the base.
    pub async fn init(&self) -> miette::Result<()> {
        for dir in [
            self.manifest_dir(),
            self.tarball_dir(),
            self.packages_dir(),
            self.etag_dir(),
            self.global_node_modules(),
            self.global_bin_dir(),
        ] {
            fs::create_dir_all(&dir)
                .await
                .into_diagnostic()
                .wrap_err(miette!("failed to create {} directory", dir.display()))?;
        }

        Ok(())
    }

    /// The registry base URL.
    pub fn registry(&self) -> &Url {
        &self.registry
    }

    /// The base cache directory.
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Cached registry manifests.
    pub fn manifest_dir(&self) -> PathBuf {
        self.base.join("manifest")
    }

    /// Downloaded archives.
    pub fn tarball_dir(&self) -> PathBuf {
        self.base.join("tarball")
    }

    /// Extracted package trees.
    pub fn packages_dir(&self) -> PathBuf {
        self.base.join("packages")
    }

    /// Stored entity tags for conditional manifest refresh.
    pub fn etag_dir(&self) -> PathBuf {
        self.base.join("etag")
    }

    /// Root of the global installation.
    pub fn global_dir(&self) -> PathBuf {
        self.base.join("global")
    }

    /// The global installation's node_modules tree.
    pub fn global_node_modules(&self) -> PathBuf {
        self.global_dir().join("node_modules")
    }

    /// Executable shims of globally installed packages.
    pub fn global_bin_dir(&self) -> PathBuf {
        self.global_dir().join("bin")
    }

    /// The global installation's lock file.
    pub fn global_lockfile(&self) -> PathBuf {
        self.global_dir().join(crate::lock::LOCKFILE)
    }
}
