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

use serde::Deserialize;
use url::Url;

use crate::config::USER_AGENT;
use crate::errors::Error;

/// A `github:<owner>/<repo>[#<ref>]` dependency reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRef {
    pub owner: String,
    pub repo: String,
    pub reference: Option<String>,
}

impl SourceRef {
    /// Parses the source-control constraint form. Returns `None` when
    /// the constraint is not a github reference.
    pub fn parse(spec: &str) -> Option<Self> {
        let rest = spec.strip_prefix("github:")?;
        let (repo_path, reference) = match rest.split_once('#') {
            Some((path, reference)) => (path, Some(reference.to_owned())),
            None => (rest, None),
        };

        let (owner, repo) = repo_path.split_once('/')?;
        if owner.is_empty() || repo.is_empty() {
            return None;
        }

        Some(Self {
            owner: owner.to_owned(),
            repo: repo.to_owned(),
            reference,
        })
    }
}

#[derive(Deserialize)]
struct CommitInfo {
    sha: String,
}

/// Resolves source-control references against the provider's commits
/// endpoint.
#[derive(Debug)]
pub struct GitHub {
    http: reqwest::Client,
    api: Url,
    archive: Url,
}

impl GitHub {
    const API: &'static str = "https://api.github.com";
    const ARCHIVE: &'static str = "https://github.com";

    pub fn new() -> miette::Result<Self> {
        Self::with_bases(
            Self::API.parse().expect("github api url parses"),
            Self::ARCHIVE.parse().expect("github archive url parses"),
        )
    }

    /// Provider with explicit endpoints, used by tests.
    pub fn with_bases(api: Url, archive: Url) -> miette::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|err| miette::miette!("failed to construct http client: {err}"))?;

        Ok(Self { http, api, archive })
    }

    /// Resolves a reference (branch, tag, or commit prefix; `HEAD` when
    /// absent) to a full commit identifier.
    pub async fn resolve(&self, source: &SourceRef) -> Result<String, Error> {
        let reference = source.reference.as_deref().unwrap_or("HEAD");
        let url = self
            .api
            .join(&format!(
                "repos/{}/{}/commits/{}",
                source.owner, source.repo, reference
            ))
            .map_err(|_| Error::NotFound(format!("{}/{}", source.owner, source.repo)))?;

        let response = self
            .http
            .get(url.clone())
            .header("accept", "application/vnd.github+json")
            .send()
            .await
            .map_err(|err| Error::transport(url.to_string(), err))?;

        match response.status() {
            status if status.is_success() => {
                let commit: CommitInfo = response
                    .json()
                    .await
                    .map_err(|err| Error::transport(url.to_string(), err))?;

                tracing::debug!(
                    ":: resolved github:{}/{}#{reference} to {}",
                    source.owner,
                    source.repo,
                    commit.sha
                );

                Ok(commit.sha)
            }
            reqwest::StatusCode::NOT_FOUND => Err(Error::NotFound(format!(
                "github:{}/{}#{reference}",
                source.owner, source.repo
            ))),
            status => Err(Error::Status {
                context: url.to_string(),
                status: status.as_u16(),
            }),
        }
    }

    /// The archive URL for a resolved commit.
    pub fn tarball_url(&self, source: &SourceRef, commit: &str) -> String {
        format!(
            "{}{}/{}/archive/{}.tar.gz",
            self.archive, source.owner, source.repo, commit
        )
    }
}
