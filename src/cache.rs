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

use std::path::PathBuf;

use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::config::{Config, USER_AGENT};
use crate::errors::Error;
use crate::fsutil;
use crate::integrity;
use crate::package::PackageName;
use crate::sync::KeyedLocks;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// The content-addressed store of downloaded archives.
///
/// Artifacts are named `<safe-name>-<version>.tgz`, keeping `@scope/x`
/// and `x` apart. Concurrent acquisition of the same artifact is
/// serialized by a lock keyed `<name>@<version>`, held across download,
/// validation and rename.
#[derive(Debug)]
pub struct TarballCache {
    dir: PathBuf,
    http: reqwest::Client,
    locks: KeyedLocks,
}

impl TarballCache {
    pub fn new(config: &Config) -> miette::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|err| miette::miette!("failed to construct http client: {err}"))?;

        Ok(Self {
            dir: config.tarball_dir(),
            http,
            locks: KeyedLocks::default(),
        })
    }

    /// Where the artifact for `name@version` lives.
    pub fn locate(&self, name: &PackageName, version: &str) -> PathBuf {
        self.dir.join(format!("{}-{}.tgz", name.safe(), version))
    }

    /// Returns the cached artifact for `name@version`, downloading and
    /// validating it first when missing or invalid.
    pub async fn acquire(
        &self,
        name: &PackageName,
        version: &str,
        url: &str,
        sri: Option<&str>,
    ) -> Result<PathBuf, Error> {
        let lock = self.locks.get(&format!("{name}@{version}"));
        let _guard = lock.lock().await;

        let path = self.locate(name, version);

        if fs::try_exists(&path).await.unwrap_or(false) {
            match self.validate(&path, sri).await {
                Ok(()) => return Ok(path),
                Err(err) => {
                    tracing::warn!("warning: cached archive for {name}@{version} is invalid ({err}), redownloading");
                    fs::remove_file(&path).await.ok();
                }
            }
        }

        self.download(&path, url).await?;
        self.validate(&path, sri).await.inspect_err(|_| {
            let path = path.clone();
            // A bad artifact must not be served on the next run.
            std::fs::remove_file(path).ok();
        })?;

        tracing::debug!(":: downloaded {name}@{version}");

        Ok(path)
    }

    /// Streams the response body into a temp file, then renames it into
    /// place. No partial artifact is ever observable.
    async fn download(&self, path: &PathBuf, url: &str) -> Result<(), Error> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|err| Error::filesystem(format!("failed to create {}", parent.display()), err))?;
        }

        let mut response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| Error::transport(url.to_owned(), err))?;

        match response.status() {
            status if status.is_success() => {}
            reqwest::StatusCode::NOT_FOUND => return Err(Error::NotFound(url.to_owned())),
            status => {
                return Err(Error::Status {
                    context: url.to_owned(),
                    status: status.as_u16(),
                });
            }
        }

        let staging = fsutil::staging_path(path);
        let mut file = fs::File::create(&staging)
            .await
            .map_err(|err| Error::filesystem(format!("failed to create {}", staging.display()), err))?;

        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|err| Error::transport(url.to_owned(), err))?
        {
            file.write_all(&chunk)
                .await
                .map_err(|err| Error::filesystem(format!("failed to write {}", staging.display()), err))?;
        }

        file.flush()
            .await
            .map_err(|err| Error::filesystem(format!("failed to flush {}", staging.display()), err))?;
        drop(file);

        fs::rename(&staging, path)
            .await
            .map_err(|err| Error::filesystem(format!("failed to rename into {}", path.display()), err))
    }

    /// An artifact is valid when it is non-empty, carries the gzip magic,
    /// and matches its integrity string when one is known.
    async fn validate(&self, path: &PathBuf, sri: Option<&str>) -> Result<(), Error> {
        let metadata = fs::metadata(path)
            .await
            .map_err(|err| Error::filesystem(format!("failed to stat {}", path.display()), err))?;

        if metadata.len() == 0 {
            return Err(Error::Extraction {
                archive: path.display().to_string(),
                reason: "archive is empty".into(),
            });
        }

        let mut magic = [0u8; 2];
        {
            use tokio::io::AsyncReadExt;

            let mut file = fs::File::open(path)
                .await
                .map_err(|err| Error::filesystem(format!("failed to open {}", path.display()), err))?;
            file.read_exact(&mut magic)
                .await
                .map_err(|err| Error::filesystem(format!("failed to read {}", path.display()), err))?;
        }

        if magic != GZIP_MAGIC {
            return Err(Error::Extraction {
                archive: path.display().to_string(),
                reason: "archive is not gzip compressed".into(),
            });
        }

        if let Some(sri) = sri {
            integrity::validate_strict(path, sri).await?;
        }

        Ok(())
    }
}
