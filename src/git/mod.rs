//! Local git operations for the fetch, commit and push stages.
//!
//! This module shells out to the `git` binary:
//! - Shallow clone of the publishing-source branch (with submodules)
//! - Snapshot of the build output into a fresh, parentless commit
//! - Delete-then-push of the publishing branch
//!
//! Every command runs with system and user configuration disabled and
//! terminal prompts off, so a missing credential fails instead of hanging.
//! Child processes are killed when their future is dropped, which lets a
//! stage deadline stop a stuck clone or push.

pub mod publish;

use std::path::Path;
use std::process::{Output, Stdio};

use thiserror::Error;
use tokio::process::Command;

pub use publish::{GitCli, PublishRepo};

/// Errors from git operations.
#[derive(Debug, Error)]
pub enum GitError {
    /// Git command failed.
    #[error("git command failed: {command}\nstderr: {stderr}")]
    CommandFailed { command: String, stderr: String },

    /// The directory to snapshot does not exist.
    #[error("build output directory missing: {0}")]
    MissingOutput(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for git operations.
pub type GitResult<T> = Result<T, GitError>;

/// Identity used for creating commits.
///
/// This is passed via `-c` flags to git commands, ensuring commits can be
/// created even when global/system git config is disabled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitIdentity {
    /// The committer/author name (git `user.name`).
    pub name: String,

    /// The committer/author email (git `user.email`).
    pub email: String,
}

impl Default for CommitIdentity {
    fn default() -> Self {
        CommitIdentity {
            name: "pages-builder".to_string(),
            email: "pages-builder@localhost".to_string(),
        }
    }
}

/// Create a git Command with clean environment (no system/user config).
pub(crate) fn git_command(workdir: &Path) -> Command {
    let mut cmd = Command::new("git");
    cmd.current_dir(workdir);

    // Disable system and user config for reproducible behavior
    cmd.env("GIT_CONFIG_NOSYSTEM", "1");
    cmd.env("GIT_CONFIG_GLOBAL", "/dev/null");

    // Disable terminal prompts
    cmd.env("GIT_TERMINAL_PROMPT", "0");

    cmd.stdin(Stdio::null());
    cmd.kill_on_drop(true);
    cmd
}

/// Create a git Command configured for commit operations.
///
/// This extends [`git_command`] with `-c user.name=<name>` and
/// `-c user.email=<email>`.
pub(crate) fn git_commit_command(workdir: &Path, identity: &CommitIdentity) -> Command {
    let mut cmd = git_command(workdir);
    cmd.arg("-c");
    cmd.arg(format!("user.name={}", identity.name));
    cmd.arg("-c");
    cmd.arg(format!("user.email={}", identity.email));
    cmd
}

/// Run a prepared git command, turning a non-zero exit into [`GitError`].
///
/// `redact` is applied to the command description and stderr before they
/// are stored in the error, so credentials in URLs never reach logs.
pub(crate) async fn run_command(
    mut cmd: Command,
    args: &[&str],
    redact: impl Fn(&str) -> String,
) -> GitResult<Output> {
    let output = cmd.args(args).output().await?;

    if output.status.success() {
        Ok(output)
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(GitError::CommandFailed {
            command: redact(&format!("git {}", args.join(" "))),
            stderr: redact(&stderr),
        })
    }
}

/// Run a git command in the given working directory.
pub async fn run_git(workdir: &Path, args: &[&str]) -> GitResult<Output> {
    run_command(git_command(workdir), args, str::to_string).await
}

/// Run a git command and return stdout as a string.
pub async fn run_git_stdout(workdir: &Path, args: &[&str]) -> GitResult<String> {
    let output = run_git(workdir, args).await?;
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
