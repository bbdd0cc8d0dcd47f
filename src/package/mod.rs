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

use std::{fmt, ops::Deref, str::FromStr};

use miette::IntoDiagnostic;
use serde::{Deserialize, Serialize};

mod archive;
mod store;

pub use archive::extract;
pub use store::PackageStore;

#[cfg(test)]
pub(crate) use archive::fixture_tarball;

/// An npm package name, possibly scoped (`@scope/name`).
#[derive(Clone, Hash, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Debug)]
#[serde(try_from = "String", into = "String")]
pub struct PackageName(String);

/// Errors that can be generated parsing [`PackageName`][], see [`PackageName::new()`][].
#[derive(thiserror::Error, Debug, PartialEq)]
pub enum PackageNameError {
    /// Empty package name.
    #[error("package name must be at least one character long, but was empty")]
    Empty,
    /// Too long.
    #[error("package names must be at most 214 characters long, but was {0:}")]
    TooLong(usize),
    /// A scope without a name, a name with an empty scope, or too many slashes.
    #[error("invalid scoped package name: {0:}")]
    InvalidScope(String),
    /// Invalid start character.
    #[error("package name segment must not start with {0:}")]
    InvalidStart(char),
    /// Invalid character.
    #[error("package name must consist of URL-safe lowercase characters, but contains {0:} at position {1:}")]
    InvalidCharacter(char, usize),
}

impl PackageName {
    const MAX_LENGTH: usize = 214;

    /// New package name from string.
    pub fn new<S: Into<String>>(value: S) -> Result<Self, PackageNameError> {
        let value = value.into();
        Self::validate(&value)?;
        Ok(Self(value))
    }

    /// Validate a package name against the registry's naming rules.
    pub fn validate(name: impl AsRef<str>) -> Result<(), PackageNameError> {
        let name = name.as_ref();

        if name.is_empty() {
            return Err(PackageNameError::Empty);
        }

        if name.len() > Self::MAX_LENGTH {
            return Err(PackageNameError::TooLong(name.len()));
        }

        if let Some(rest) = name.strip_prefix('@') {
            let Some((scope, bare)) = rest.split_once('/') else {
                return Err(PackageNameError::InvalidScope(name.into()));
            };

            if scope.is_empty() || bare.is_empty() || bare.contains('/') {
                return Err(PackageNameError::InvalidScope(name.into()));
            }

            Self::validate_segment(scope)?;
            Self::validate_segment(bare)
        } else {
            Self::validate_segment(name)
        }
    }

    fn validate_segment(segment: &str) -> Result<(), PackageNameError> {
        match segment.chars().next() {
            Some(c @ ('.' | '_')) => return Err(PackageNameError::InvalidStart(c)),
            Some(_) => {}
            None => return Err(PackageNameError::Empty),
        }

        let is_allowed =
            |c: char| (c.is_ascii_alphanumeric() && !c.is_ascii_uppercase()) || matches!(c, '-' | '_' | '.');

        if let Some((index, c)) = segment.chars().enumerate().find(|(_, c)| !is_allowed(*c)) {
            return Err(PackageNameError::InvalidCharacter(c, index));
        }

        Ok(())
    }

    /// The scope segment, if this name is scoped.
    pub fn scope(&self) -> Option<&str> {
        self.0
            .strip_prefix('@')
            .and_then(|rest| rest.split_once('/'))
            .map(|(scope, _)| scope)
    }

    /// A filename-safe rendition of this name with path separators
    /// replaced by dashes, keeping `@scope/x` and `x` apart on disk.
    pub fn safe(&self) -> String {
        self.0.replace('/', "-")
    }
}

impl TryFrom<String> for PackageName {
    type Error = PackageNameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl FromStr for PackageName {
    type Err = miette::Report;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        Self::new(input).into_diagnostic()
    }
}

impl From<PackageName> for String {
    fn from(s: PackageName) -> Self {
        s.to_string()
    }
}

impl Deref for PackageName {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for PackageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn plain() {
        assert_eq!(PackageName::new("is-odd"), Ok(PackageName("is-odd".into())));
        assert_eq!(PackageName::new("lodash.merge"), Ok(PackageName("lodash.merge".into())));
    }

    #[test]
    fn scoped() {
        assert_eq!(
            PackageName::new("@types/node"),
            Ok(PackageName("@types/node".into()))
        );
    }

    #[test]
    fn empty() {
        assert_eq!(PackageName::new(""), Err(PackageNameError::Empty));
    }

    #[test]
    fn long() {
        assert_eq!(
            PackageName::new("a".repeat(215)),
            Err(PackageNameError::TooLong(215))
        );
    }

    #[test]
    fn uppercase() {
        assert_eq!(
            PackageName::new("Express"),
            Err(PackageNameError::InvalidCharacter('E', 0))
        );
    }

    #[test]
    fn missing_scope_name() {
        assert_eq!(
            PackageName::new("@types"),
            Err(PackageNameError::InvalidScope("@types".into()))
        );
        assert_eq!(
            PackageName::new("@/node"),
            Err(PackageNameError::InvalidScope("@/node".into()))
        );
    }

    #[test]
    fn leading_dot() {
        assert_eq!(PackageName::new(".bin"), Err(PackageNameError::InvalidStart('.')));
    }

    #[test]
    fn safe_names_are_collision_free() {
        let scoped = PackageName::new("@scope/foo").unwrap();
        let plain = PackageName::new("foo").unwrap();

        assert_eq!(scoped.safe(), "@scope-foo");
        assert_ne!(scoped.safe(), plain.safe());
    }

    #[test]
    fn scope_accessor() {
        assert_eq!(PackageName::new("@types/node").unwrap().scope(), Some("types"));
        assert_eq!(PackageName::new("is-odd").unwrap().scope(), None);
    }
}
