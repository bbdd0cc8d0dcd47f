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

use std::{fmt, path::Path, str::FromStr};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha2::Digest as _;
use strum::{Display, EnumString};
use tokio::io::AsyncReadExt;

use crate::errors::Error;

/// Supported subresource-integrity digest algorithms.
// Do not reorder variants; strength ordering drives hash selection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, EnumString, Display)]
pub enum Algorithm {
    #[strum(serialize = "sha256")]
    Sha256,
    #[strum(serialize = "sha384")]
    Sha384,
    #[strum(serialize = "sha512")]
    Sha512,
}

/// A single `<algorithm>-<base64 digest>` integrity hash.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Hash {
    algorithm: Algorithm,
    digest: Vec<u8>,
}

impl Hash {
    /// Algorithm used to create this hash.
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Digest as raw byte data.
    pub fn as_bytes(&self) -> &[u8] {
        &self.digest
    }
}

impl FromStr for Hash {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let Some((algorithm, digest)) = input.split_once('-') else {
            return Err(Error::NoIntegrity);
        };

        let algorithm: Algorithm = algorithm.parse().map_err(|_| Error::NoIntegrity)?;
        let digest = BASE64.decode(digest).map_err(|_| Error::NoIntegrity)?;

        Ok(Self { algorithm, digest })
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.algorithm, BASE64.encode(&self.digest))
    }
}

/// A parsed subresource-integrity string: one or more hashes, sorted
/// strongest-first.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Integrity {
    hashes: Vec<Hash>,
}

impl Integrity {
    /// Parses whitespace-separated `<algo>-<base64>` tokens. Tokens with
    /// unsupported algorithms are silently discarded; an input yielding
    /// no usable hash fails with [`Error::NoIntegrity`].
    pub fn parse(sri: &str) -> Result<Self, Error> {
        let mut hashes: Vec<Hash> = sri
            .split_whitespace()
            .filter_map(|token| token.parse().ok())
            .collect();

        if hashes.is_empty() {
            return Err(Error::NoIntegrity);
        }

        hashes.sort_by(|a, b| b.algorithm.cmp(&a.algorithm));

        Ok(Self { hashes })
    }

    /// The strongest hash available.
    pub fn strongest(&self) -> &Hash {
        &self.hashes[0]
    }

    /// All parsed hashes, strongest first.
    pub fn hashes(&self) -> &[Hash] {
        &self.hashes
    }

    /// Streams the file once under the strongest available algorithm and
    /// compares digests. Fails with [`Error::IntegrityMismatch`] on
    /// divergence.
    pub async fn validate(&self, path: &Path) -> Result<(), Error> {
        let expected = self.strongest();
        let computed = digest_file(path, expected.algorithm()).await?;

        if computed != expected.digest {
            return Err(Error::IntegrityMismatch {
                file: path.to_path_buf(),
                expected: expected.to_string(),
                computed: format!("{}-{}", expected.algorithm(), BASE64.encode(&computed)),
            });
        }

        Ok(())
    }
}

impl fmt::Display for Integrity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for hash in &self.hashes {
            if !first {
                write!(f, " ")?;
            }
            write!(f, "{hash}")?;
            first = false;
        }
        Ok(())
    }
}

/// Parses `sri` and validates `path` against it in one step.
pub async fn validate_strict(path: &Path, sri: &str) -> Result<(), Error> {
    Integrity::parse(sri)?.validate(path).await
}

/// Computes the digest of a file under `algorithm` without buffering the
/// whole file.
pub async fn digest_file(path: &Path, algorithm: Algorithm) -> Result<Vec<u8>, Error> {
    match algorithm {
        Algorithm::Sha256 => stream_digest::<sha2::Sha256>(path).await,
        Algorithm::Sha384 => stream_digest::<sha2::Sha384>(path).await,
        Algorithm::Sha512 => stream_digest::<sha2::Sha512>(path).await,
    }
}

async fn stream_digest<D: sha2::Digest>(path: &Path) -> Result<Vec<u8>, Error> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|err| Error::filesystem(format!("failed to open {}", path.display()), err))?;

    let mut hasher = D::new();
    let mut buffer = vec![0u8; 64 * 1024];

    loop {
        let read = file
            .read(&mut buffer)
            .await
            .map_err(|err| Error::filesystem(format!("failed to read {}", path.display()), err))?;

        if read == 0 {
            break;
        }

        hasher.update(&buffer[..read]);
    }

    Ok(hasher.finalize().to_vec())
}

/// Renders the standard `sha512-...` integrity string for a blob of
/// bytes, as stored in lock entries.
pub fn sri_sha512(bytes: &[u8]) -> String {
    let digest = sha2::Sha512::new().chain_update(bytes).finalize();
    format!("sha512-{}", BASE64.encode(digest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sri_for(bytes: &[u8], algorithm: Algorithm) -> String {
        match algorithm {
            Algorithm::Sha256 => format!(
                "sha256-{}",
                BASE64.encode(sha2::Sha256::new().chain_update(bytes).finalize())
            ),
            Algorithm::Sha384 => format!(
                "sha384-{}",
                BASE64.encode(sha2::Sha384::new().chain_update(bytes).finalize())
            ),
            Algorithm::Sha512 => format!(
                "sha512-{}",
                BASE64.encode(sha2::Sha512::new().chain_update(bytes).finalize())
            ),
        }
    }

    #[test]
    fn parses_single_hash() {
        let sri = sri_for(b"hello", Algorithm::Sha512);
        let integrity = Integrity::parse(&sri).unwrap();

        assert_eq!(integrity.hashes().len(), 1);
        assert_eq!(integrity.strongest().algorithm(), Algorithm::Sha512);
    }

    #[test]
    fn strongest_first() {
        let sri = format!(
            "{} {}",
            sri_for(b"hello", Algorithm::Sha256),
            sri_for(b"hello", Algorithm::Sha512)
        );

        let integrity = Integrity::parse(&sri).unwrap();
        assert_eq!(integrity.strongest().algorithm(), Algorithm::Sha512);
        assert_eq!(integrity.hashes()[1].algorithm(), Algorithm::Sha256);
    }

    #[test]
    fn unsupported_algorithms_are_discarded() {
        let sri = format!("md5-AAAA {}", sri_for(b"hello", Algorithm::Sha256));
        let integrity = Integrity::parse(&sri).unwrap();

        assert_eq!(integrity.hashes().len(), 1);
        assert_eq!(integrity.strongest().algorithm(), Algorithm::Sha256);
    }

    #[test]
    fn empty_input_has_no_integrity() {
        assert!(matches!(Integrity::parse(""), Err(Error::NoIntegrity)));
        assert!(matches!(Integrity::parse("md5-AAAA"), Err(Error::NoIntegrity)));
    }

    #[test]
    fn roundtrips_display() {
        let sri = sri_for(b"hello", Algorithm::Sha384);
        let integrity = Integrity::parse(&sri).unwrap();

        assert_eq!(integrity.to_string(), sri);
    }

    #[tokio::test]
    async fn validates_matching_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("artifact.tgz");
        std::fs::write(&path, b"archive bytes").unwrap();

        let sri = sri_for(b"archive bytes", Algorithm::Sha512);
        validate_strict(&path, &sri).await.unwrap();
    }

    #[tokio::test]
    async fn rejects_diverging_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("artifact.tgz");
        std::fs::write(&path, b"tampered bytes").unwrap();

        let sri = sri_for(b"archive bytes", Algorithm::Sha512);
        let err = validate_strict(&path, &sri).await.unwrap_err();

        assert!(matches!(err, Error::IntegrityMismatch { .. }));
    }

    #[test]
    fn sri_sha512_matches_parser() {
        let sri = sri_sha512(b"hello");
        assert_eq!(sri, sri_for(b"hello", Algorithm::Sha512));
        Integrity::parse(&sri).unwrap();
    }
}
