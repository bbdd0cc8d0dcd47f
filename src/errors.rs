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

use miette::Diagnostic;
use thiserror::Error;

/// Failures the install pipeline can produce.
///
/// Required-dependency failures abort the run through the resolver's
/// cancellation channel; optional-dependency failures are logged and
/// skipped.
#[derive(Error, Diagnostic, Debug)]
pub enum Error {
    /// The registry does not know the package or version.
    #[error("package {0} not found in registry")]
    NotFound(String),

    /// Network failure while talking to the registry or a tarball host.
    #[error("request for {context} failed")]
    Transport {
        context: String,
        #[source]
        source: Option<reqwest::Error>,
    },

    /// The remote replied with a status we do not accept.
    #[error("request for {context} failed with status {status}")]
    Status { context: String, status: u16 },

    /// Registry metadata or a package manifest failed to parse.
    #[error("malformed manifest for {name}")]
    MalformedManifest {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    /// The lock file failed to parse.
    #[error("malformed lock file at {path}")]
    MalformedLock {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// A file hash diverged from its subresource integrity string.
    #[error("integrity mismatch for {file}: expected {expected}, computed {computed}")]
    IntegrityMismatch {
        file: PathBuf,
        expected: String,
        computed: String,
    },

    /// The integrity string contained no usable hash.
    #[error("no usable integrity metadata")]
    NoIntegrity,

    /// An archive was corrupted, unreadable, or produced an invalid tree.
    #[error("failed to extract {archive}: {reason}")]
    Extraction { archive: String, reason: String },

    /// A package declaring a dependency on itself. Logged and skipped.
    #[error("package {0} depends on itself")]
    CyclicSelfReference(String),

    /// Any I/O failure.
    #[error("{context}")]
    Filesystem {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Propagated after the first non-optional failure.
    #[error("operation cancelled after a previous failure")]
    Cancelled,
}

impl Error {
    pub(crate) fn filesystem(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Filesystem {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn transport(context: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Transport {
            context: context.into(),
            source: Some(source),
        }
    }
}
