//! Terminal status of a pipeline run.
//!
//! Statuses are persisted as plain strings (`complete`, `stopped`,
//! `failed:<kind>`) so that the stored record stays readable by any tool.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Why a run failed.
///
/// Most kinds correspond to the stage that was executing when the run gave
/// up. None of these are retried; the next push notification supersedes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// The repository has no record in the store.
    RepoNotFound,
    /// The repository store itself failed.
    StoreFailed,
    /// Cloning the publishing-source branch failed.
    FetchFailed,
    /// The site builder exited unsuccessfully.
    BuildFailed,
    /// Snapshotting the build output into a commit failed.
    CommitFailed,
    /// The stored access token could not be decrypted.
    CredentialFailed,
    /// Pushing to the publishing branch failed.
    PushFailed,
    /// The runner task panicked before reaching a terminal state.
    Panicked,
}

impl FailureKind {
    pub const ALL: [FailureKind; 8] = [
        FailureKind::RepoNotFound,
        FailureKind::StoreFailed,
        FailureKind::FetchFailed,
        FailureKind::BuildFailed,
        FailureKind::CommitFailed,
        FailureKind::CredentialFailed,
        FailureKind::PushFailed,
        FailureKind::Panicked,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::RepoNotFound => "repo-not-found",
            FailureKind::StoreFailed => "store-failed",
            FailureKind::FetchFailed => "fetch-failed",
            FailureKind::BuildFailed => "build-failed",
            FailureKind::CommitFailed => "commit-failed",
            FailureKind::CredentialFailed => "credential-failed",
            FailureKind::PushFailed => "push-failed",
            FailureKind::Panicked => "panicked",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum RunStatus {
    /// All stages ran and the publishing branch was pushed.
    Complete,
    /// A newer request superseded this run. Not a failure.
    Stopped,
    /// A stage failed.
    Failed(FailureKind),
}

impl RunStatus {
    pub fn is_complete(self) -> bool {
        matches!(self, RunStatus::Complete)
    }

    pub fn is_stopped(self) -> bool {
        matches!(self, RunStatus::Stopped)
    }

    pub fn failure(self) -> Option<FailureKind> {
        match self {
            RunStatus::Failed(kind) => Some(kind),
            _ => None,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Complete => f.write_str("complete"),
            RunStatus::Stopped => f.write_str("stopped"),
            RunStatus::Failed(kind) => write!(f, "failed:{}", kind),
        }
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "complete" => Ok(RunStatus::Complete),
            "stopped" => Ok(RunStatus::Stopped),
            other => other
                .strip_prefix("failed:")
                .and_then(|kind| FailureKind::ALL.into_iter().find(|k| k.as_str() == kind))
                .map(RunStatus::Failed)
                .ok_or_else(|| format!("unknown run status: {other}")),
        }
    }
}

impl TryFrom<String> for RunStatus {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<RunStatus> for String {
    fn from(status: RunStatus) -> Self {
        status.to_string()
    }
}
