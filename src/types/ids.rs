//! Newtype wrappers for domain identifiers.
//!
//! These types prevent accidental mixing of identifiers (e.g., passing a
//! delivery ID where a repository key is expected) and carry the validation
//! that makes them safe to use as file names.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Error returned when a repository key is malformed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid repository key {input:?}: {reason}")]
pub struct InvalidRepoKey {
    pub input: String,
    pub reason: &'static str,
}

/// A repository identifier in `owner/name` form.
///
/// Selects at most one active pipeline run at any instant. Both components
/// are used as path segments in the repository store, so neither may be
/// empty, contain a `/`, or be `.`/`..`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RepoKey {
    owner: String,
    name: String,
}

impl RepoKey {
    /// Creates a key from its components, validating both.
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Result<Self, InvalidRepoKey> {
        let owner = owner.into();
        let name = name.into();
        let input = format!("{}/{}", owner, name);
        validate_component(&owner, &input)?;
        validate_component(&name, &input)?;
        Ok(RepoKey { owner, name })
    }

    /// Parses a `full_name` such as `acme/site`.
    pub fn parse(full_name: &str) -> Result<Self, InvalidRepoKey> {
        let Some((owner, name)) = full_name.split_once('/') else {
            return Err(InvalidRepoKey {
                input: full_name.to_string(),
                reason: "expected owner/name",
            });
        };
        RepoKey::new(owner, name)
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns true if this is a user or organisation site (`<owner>.github.io`).
    pub fn is_user_site(&self) -> bool {
        self.name
            .eq_ignore_ascii_case(&format!("{}.github.io", self.owner))
    }

    /// Returns a single path segment safe for directory names (`owner-name`).
    pub fn slug(&self) -> String {
        format!("{}-{}", self.owner, self.name)
    }
}

fn validate_component(component: &str, input: &str) -> Result<(), InvalidRepoKey> {
    let reason = if component.is_empty() {
        "empty component"
    } else if component.contains('/') || component.contains('\\') {
        "component contains a path separator"
    } else if component == "." || component == ".." {
        "component is a relative path"
    } else if component.chars().any(char::is_control) {
        "component contains control characters"
    } else {
        return Ok(());
    };
    Err(InvalidRepoKey {
        input: input.to_string(),
        reason,
    })
}

impl fmt::Display for RepoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

impl FromStr for RepoKey {
    type Err = InvalidRepoKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RepoKey::parse(s)
    }
}

impl TryFrom<String> for RepoKey {
    type Error = InvalidRepoKey;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        RepoKey::parse(&s)
    }
}

impl From<RepoKey> for String {
    fn from(key: RepoKey) -> Self {
        key.to_string()
    }
}

/// Identifies one pipeline run (one control handle) within a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub u64);

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run-{}", self.0)
    }
}

/// A GitHub webhook delivery ID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeliveryId(pub String);

impl DeliveryId {
    pub fn new(s: impl Into<String>) -> Self {
        DeliveryId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeliveryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
