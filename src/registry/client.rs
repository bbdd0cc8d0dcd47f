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

use std::{path::PathBuf, sync::Arc};

use dashmap::DashMap;
use reqwest::{StatusCode, header};
use tokio::fs;
use url::Url;

use super::Packument;
use crate::config::{Config, USER_AGENT};
use crate::errors::Error;
use crate::fsutil;
use crate::sync::KeyedLocks;

/// Registry metadata access with a transparent disk cache.
///
/// The first fetch for a name downloads the packument to
/// `<manifest>/<safe-name>.json` and remembers the response's entity tag
/// under `<etag>/<safe-name>`. Later fetches revalidate with
/// `If-None-Match`; a 304 reuses the cached body. Concurrent fetches for
/// the same name are serialized by a per-name lock.
#[derive(Debug)]
pub struct RegistryClient {
    base: Url,
    http: reqwest::Client,
    manifest_dir: PathBuf,
    etag_dir: PathBuf,
    locks: KeyedLocks,
    memo: DashMap<String, Arc<Packument>>,
    etags: DashMap<String, String>,
}

impl RegistryClient {
    /// Creates a client against the configured registry.
    pub fn new(config: &Config) -> miette::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|err| miette::miette!("failed to construct http client: {err}"))?;

        Ok(Self {
            base: config.registry().clone(),
            http,
            manifest_dir: config.manifest_dir(),
            etag_dir: config.etag_dir(),
            locks: KeyedLocks::default(),
            memo: DashMap::new(),
            etags: DashMap::new(),
        })
    }

    /// The registry URL for a package name. Scope separators are
    /// percent-encoded the way the registry expects.
    fn package_url(&self, name: &str) -> Result<Url, Error> {
        let encoded = name.replace('/', "%2F");
        self.base
            .join(&encoded)
            .map_err(|_| Error::NotFound(name.to_owned()))
    }

    fn manifest_path(&self, name: &str) -> PathBuf {
        self.manifest_dir.join(format!("{}.json", name.replace('/', "-")))
    }

    fn etag_path(&self, name: &str) -> PathBuf {
        self.etag_dir.join(name.replace('/', "-"))
    }

    /// The entity tag remembered for a name during this run, if any.
    pub fn etag(&self, name: &str) -> Option<String> {
        self.etags.get(name).map(|etag| etag.value().clone())
    }

    /// Fetches the packument for `name`, consulting the disk cache and
    /// revalidating via the stored entity tag.
    pub async fn fetch(&self, name: &str) -> Result<Arc<Packument>, Error> {
        let lock = self.locks.get(name);
        let _guard = lock.lock().await;

        if let Some(cached) = self.memo.get(name) {
            return Ok(cached.value().clone());
        }

        let manifest_path = self.manifest_path(name);
        let etag_path = self.etag_path(name);

        let cached_etag = fs::read_to_string(&etag_path).await.ok();
        let have_cache = fs::try_exists(&manifest_path).await.unwrap_or(false);

        let url = self.package_url(name)?;
        let mut request = self.http.get(url.clone());

        if let (Some(etag), true) = (&cached_etag, have_cache) {
            request = request.header(header::IF_NONE_MATCH, etag.trim());
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(err) if have_cache => {
                tracing::warn!("warning: registry unreachable for {name}, using cached manifest: {err}");
                return self.parse_cached(name, &manifest_path).await;
            }
            Err(err) => return Err(Error::transport(url.to_string(), err)),
        };

        match response.status() {
            StatusCode::NOT_MODIFIED => self.parse_cached(name, &manifest_path).await,
            StatusCode::NOT_FOUND => Err(Error::NotFound(name.to_owned())),
            status if status.is_success() => {
                let etag = response
                    .headers()
                    .get(header::ETAG)
                    .and_then(|value| value.to_str().ok())
                    .map(str::to_owned);

                let body = response
                    .bytes()
                    .await
                    .map_err(|err| Error::transport(url.to_string(), err))?;

                let packument: Packument =
                    serde_json::from_slice(&body).map_err(|source| Error::MalformedManifest {
                        name: name.to_owned(),
                        source,
                    })?;

                fsutil::write_atomic(&manifest_path, &body).await?;

                if let Some(etag) = etag {
                    fsutil::write_atomic(&etag_path, etag.as_bytes()).await?;
                    self.etags.insert(name.to_owned(), etag);
                }

                tracing::debug!(":: fetched manifest for {name}");

                let packument = Arc::new(packument);
                self.memo.insert(name.to_owned(), packument.clone());
                Ok(packument)
            }
            status => Err(Error::Status {
                context: url.to_string(),
                status: status.as_u16(),
            }),
        }
    }

    async fn parse_cached(&self, name: &str, path: &PathBuf) -> Result<Arc<Packument>, Error> {
        let body = fs::read(path)
            .await
            .map_err(|err| Error::filesystem(format!("failed to read {}", path.display()), err))?;

        let packument: Packument =
            serde_json::from_slice(&body).map_err(|source| Error::MalformedManifest {
                name: name.to_owned(),
                source,
            })?;

        tracing::debug!(":: reused cached manifest for {name}");

        let packument = Arc::new(packument);
        self.memo.insert(name.to_owned(), packument.clone());
        Ok(packument)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn client_for(server: &mockito::Server, dir: &std::path::Path) -> RegistryClient {
        let config = Config::with_base(dir, server.url().parse().unwrap());
        RegistryClient::new(&config).unwrap()
    }

    const PACKUMENT: &str = r#"{
        "name": "is-odd",
        "dist-tags": {"latest": "3.0.1"},
        "versions": {"3.0.1": {"name": "is-odd", "version": "3.0.1", "dist": {"tarball": "t"}}}
    }"#;

    #[tokio::test]
    async fn fetches_and_caches_manifest() {
        let mut server = mockito::Server::new_async().await;
        let dir = tempfile::tempdir().unwrap();

        let mock = server
            .mock("GET", "/is-odd")
            .with_status(200)
            .with_header("etag", "\"v1\"")
            .with_body(PACKUMENT)
            .create_async()
            .await;

        let client = client_for(&server, dir.path());
        let packument = client.fetch("is-odd").await.unwrap();

        assert_eq!(packument.latest(), Some("3.0.1"));
        assert!(dir.path().join("manifest/is-odd.json").exists());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("etag/is-odd")).unwrap(),
            "\"v1\""
        );

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn revalidates_with_entity_tag() {
        let mut server = mockito::Server::new_async().await;
        let dir = tempfile::tempdir().unwrap();

        std::fs::create_dir_all(dir.path().join("manifest")).unwrap();
        std::fs::create_dir_all(dir.path().join("etag")).unwrap();
        std::fs::write(dir.path().join("manifest/is-odd.json"), PACKUMENT).unwrap();
        std::fs::write(dir.path().join("etag/is-odd"), "\"v1\"").unwrap();

        let mock = server
            .mock("GET", "/is-odd")
            .match_header("if-none-match", "\"v1\"")
            .with_status(304)
            .create_async()
            .await;

        let client = client_for(&server, dir.path());
        let packument = client.fetch("is-odd").await.unwrap();

        assert_eq!(packument.latest(), Some("3.0.1"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn missing_package_is_not_found() {
        let mut server = mockito::Server::new_async().await;
        let dir = tempfile::tempdir().unwrap();

        let _mock = server
            .mock("GET", "/no-such-package")
            .with_status(404)
            .create_async()
            .await;

        let client = client_for(&server, dir.path());
        let err = client.fetch("no-such-package").await.unwrap_err();

        assert!(matches!(err, Error::NotFound(name) if name == "no-such-package"));
    }

    #[tokio::test]
    async fn scoped_names_are_encoded_and_stored_flat() {
        let mut server = mockito::Server::new_async().await;
        let dir = tempfile::tempdir().unwrap();

        let mock = server
            .mock("GET", "/@types%2Fnode")
            .with_status(200)
            .with_body(r#"{"name": "@types/node", "dist-tags": {"latest": "1.0.0"}, "versions": {}}"#)
            .create_async()
            .await;

        let client = client_for(&server, dir.path());
        client.fetch("@types/node").await.unwrap();

        assert!(dir.path().join("manifest/@types-node.json").exists());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn malformed_payload_is_rejected() {
        let mut server = mockito::Server::new_async().await;
        let dir = tempfile::tempdir().unwrap();

        let _mock = server
            .mock("GET", "/broken")
            .with_status(200)
            .with_body("not json")
            .create_async()
            .await;

        let client = client_for(&server, dir.path());
        let err = client.fetch("broken").await.unwrap_err();

        assert!(matches!(err, Error::MalformedManifest { .. }));
    }

    #[tokio::test]
    async fn repeated_fetch_is_memoized() {
        let mut server = mockito::Server::new_async().await;
        let dir = tempfile::tempdir().unwrap();

        let mock = server
            .mock("GET", "/is-odd")
            .with_status(200)
            .with_body(PACKUMENT)
            .expect(1)
            .create_async()
            .await;

        let client = client_for(&server, dir.path());
        client.fetch("is-odd").await.unwrap();
        client.fetch("is-odd").await.unwrap();

        mock.assert_async().await;
    }
}
