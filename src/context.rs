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

use std::sync::Arc;

use crate::cache::TarballCache;
use crate::config::Config;
use crate::package::PackageStore;
use crate::registry::{GitHub, RegistryClient};
use crate::resolver::Resolver;
use crate::workspace::WorkspaceSet;

/// Shared context wiring the stores and clients together.
#[derive(Debug)]
pub struct Context {
    config: Config,
    registry: Arc<RegistryClient>,
    store: Arc<PackageStore>,
    github: Arc<GitHub>,
}

impl Context {
    /// Opens the context for the configured environment, creating the
    /// cache directory structure when missing.
    pub async fn open() -> miette::Result<Arc<Self>> {
        let config = Config::load()?;
        Self::with_config(config).await
    }

    /// Opens a context over an explicit configuration.
    pub async fn with_config(config: Config) -> miette::Result<Arc<Self>> {
        config.init().await?;

        let registry = Arc::new(RegistryClient::new(&config)?);
        let cache = Arc::new(TarballCache::new(&config)?);
        let store = Arc::new(PackageStore::new(&config, cache));
        let github = Arc::new(GitHub::new()?);

        Ok(Arc::new(Self {
            config,
            registry,
            store,
            github,
        }))
    }

    /// The discovered configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Registry metadata access.
    pub fn registry(&self) -> &Arc<RegistryClient> {
        &self.registry
    }

    /// Extracted package trees.
    pub fn store(&self) -> &Arc<PackageStore> {
        &self.store
    }

    /// Source-control provider.
    pub fn github(&self) -> &Arc<GitHub> {
        &self.github
    }

    /// A fresh resolver over this context's stores.
    pub fn resolver(&self, workspaces: Arc<WorkspaceSet>) -> Arc<Resolver> {
        Arc::new(Resolver::new(
            self.registry.clone(),
            self.github.clone(),
            self.store.clone(),
            workspaces,
        ))
    }
}
