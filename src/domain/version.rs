//! Firmware version identifiers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reasons a version token is rejected
#[derive(Debug, Error, PartialEq, Eq)]
pub enum VersionError {
    #[error("Version identifier is empty")]
    Empty,

    #[error("Version identifier '{0}' must not contain path separators or whitespace")]
    InvalidCharacters(String),
}

/// One target firmware build, e.g. `15.4` or `16.0.1`.
///
/// Used verbatim as the key of every on-disk artifact directory, so it must
/// be a single path component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VersionId(String);

impl VersionId {
    /// Validate and wrap a version token
    pub fn new(raw: impl Into<String>) -> Result<Self, VersionError> {
        let raw = raw.into();
        let trimmed = raw.trim();

        if trimmed.is_empty() {
            return Err(VersionError::Empty);
        }
        if trimmed == "."
            || trimmed == ".."
            || trimmed
                .chars()
                .any(|c| c == '/' || c == '\\' || c.is_whitespace())
        {
            return Err(VersionError::InvalidCharacters(raw));
        }

        Ok(Self(trimmed.to_string()))
    }

    /// The version token as written
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Leading numeric component (`16` for `16.0.1`), if any
    pub fn major(&self) -> Option<u32> {
        self.0.split('.').next()?.parse().ok()
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for VersionId {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for VersionId {
    type Error = VersionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<VersionId> for String {
    fn from(value: VersionId) -> Self {
        value.0
    }
}
