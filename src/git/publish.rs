//! The git CLI implementation of [`Vcs`].
//!
//! The publish repository is created inside the builder's output directory
//! and never shares history with the source: its single commit is an
//! orphan on the publishing branch, so each push replaces the branch
//! wholesale.

use std::path::{Path, PathBuf};

use tracing::{debug, instrument};

use crate::services::{AuthenticatedRemote, Vcs};

use super::{
    CommitIdentity, GitError, GitResult, git_command, git_commit_command, run_command, run_git,
    run_git_stdout,
};

/// Commit message used for every published snapshot.
pub const PUBLISH_MESSAGE: &str = "Publish site";

/// A freshly initialised repository holding one publish commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRepo {
    /// Root of the repository (the build output directory).
    pub path: PathBuf,

    /// SHA of the publish commit.
    pub commit_sha: String,
}

/// Version-control operations backed by the `git` binary.
#[derive(Debug, Clone, Default)]
pub struct GitCli {
    identity: CommitIdentity,
}

impl GitCli {
    pub fn new(identity: CommitIdentity) -> Self {
        GitCli { identity }
    }

    /// Returns the identity used for publish commits.
    pub fn identity(&self) -> &CommitIdentity {
        &self.identity
    }

    async fn push_refspec(
        &self,
        repo: &PublishRepo,
        remote: &AuthenticatedRemote,
        refspec: &str,
    ) -> GitResult<()> {
        run_command(
            git_command(&repo.path),
            &["push", "--quiet", remote.expose(), refspec],
            |text| remote.redact(text),
        )
        .await?;
        Ok(())
    }
}

impl Vcs for GitCli {
    type Error = GitError;
    type Repo = PublishRepo;

    #[instrument(skip(self), fields(path = %path.display()))]
    async fn fetch(&self, url: &str, path: &Path, branch: &str) -> GitResult<()> {
        let parent = path.parent().unwrap_or(path);
        tokio::fs::create_dir_all(parent).await?;
        let target = path.to_string_lossy();

        run_git(
            parent,
            &[
                "clone",
                "--quiet",
                "--depth",
                "1",
                "--single-branch",
                "--branch",
                branch,
                "--recurse-submodules",
                "--shallow-submodules",
                "--",
                url,
                &target,
            ],
        )
        .await?;

        debug!(branch, "cloned publishing source");
        Ok(())
    }

    #[instrument(skip(self), fields(path = %output_dir.display()))]
    async fn snapshot_and_commit(&self, output_dir: &Path, branch: &str) -> GitResult<PublishRepo> {
        if !tokio::fs::try_exists(output_dir).await? {
            return Err(GitError::MissingOutput(output_dir.display().to_string()));
        }

        run_git(output_dir, &["init", "--quiet"]).await?;
        let head_ref = format!("refs/heads/{}", branch);
        run_git(output_dir, &["symbolic-ref", "HEAD", &head_ref]).await?;
        run_git(output_dir, &["add", "--all"]).await?;
        run_command(
            git_commit_command(output_dir, &self.identity),
            &["commit", "--quiet", "--allow-empty", "-m", PUBLISH_MESSAGE],
            str::to_string,
        )
        .await?;

        let commit_sha = run_git_stdout(output_dir, &["rev-parse", "HEAD"]).await?;
        debug!(commit = %commit_sha, branch, "created publish commit");

        Ok(PublishRepo {
            path: output_dir.to_path_buf(),
            commit_sha,
        })
    }

    #[instrument(skip(self, repo), fields(remote = %remote))]
    async fn delete_remote_branch(
        &self,
        repo: &PublishRepo,
        remote: &AuthenticatedRemote,
        branch: &str,
    ) -> GitResult<()> {
        self.push_refspec(repo, remote, &format!(":refs/heads/{}", branch))
            .await
    }

    #[instrument(skip(self, repo), fields(remote = %remote))]
    async fn push(
        &self,
        repo: &PublishRepo,
        remote: &AuthenticatedRemote,
        branch: &str,
    ) -> GitResult<()> {
        self.push_refspec(
            repo,
            remote,
            &format!("refs/heads/{0}:refs/heads/{0}", branch),
        )
        .await
    }
}
