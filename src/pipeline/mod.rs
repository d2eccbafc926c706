//! The pipeline runner: one build-and-publish run for one repository.
//!
//! A run moves through fixed stages (lookup, fetch, build, commit, push)
//! separated by cancellation checkpoints. The runner never blocks on its
//! control handle; it only polls it. Cancellation therefore takes effect at
//! the next checkpoint, and a stage already in progress runs to completion
//! or to its deadline.
//!
//! Whatever happens, the run ends with exactly one acknowledgement on its
//! handle and its working directory removed.

pub mod workdir;


use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use crate::coordinator::{Acknowledgement, ControlHandle, RunRegistry};
use crate::services::{
    AuthenticatedRemote, CredentialDecryptor, RepoRecord, RepoStore, Services, SiteBuilder, Vcs,
};
use crate::types::{FailureKind, RepoKey, RunId, RunStatus};

pub use workdir::{WorkDir, cleanup_stale_workdirs};

/// Default deadline for a single stage.
pub const DEFAULT_STAGE_TIMEOUT: Duration = Duration::from_secs(600);

/// Default bound on preemption rounds per request.
pub const DEFAULT_MAX_PREEMPT_ATTEMPTS: u32 = 8;

/// Settings shared by every run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSettings {
    /// Parent of all per-run working directories.
    pub work_root: PathBuf,

    /// Branch holding the site sources.
    pub source_branch: String,

    /// Publishing branch for project sites.
    pub project_branch: String,

    /// Publishing branch for user and organisation sites.
    pub user_site_branch: String,

    /// Deadline applied to each collaborator call.
    pub stage_timeout: Duration,

    /// How many preemption rounds a request may go through.
    pub max_preempt_attempts: u32,
}

impl Default for RunSettings {
    fn default() -> Self {
        RunSettings {
            work_root: PathBuf::from("work"),
            source_branch: "hugo-pages".to_string(),
            project_branch: "gh-pages".to_string(),
            user_site_branch: "master".to_string(),
            stage_timeout: DEFAULT_STAGE_TIMEOUT,
            max_preempt_attempts: DEFAULT_MAX_PREEMPT_ATTEMPTS,
        }
    }
}

impl RunSettings {
    /// The branch the built site is pushed to.
    ///
    /// GitHub serves `<owner>.github.io` repositories from their user-site
    /// branch; everything else is a project site.
    pub fn publish_branch(&self, key: &RepoKey) -> &str {
        if key.is_user_site() {
            &self.user_site_branch
        } else {
            &self.project_branch
        }
    }
}

/// A request to build and publish one repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    pub key: RepoKey,

    /// URL the publishing-source branch is fetched from, and the base of
    /// the authenticated push URL.
    pub clone_url: String,
}

/// The human-readable log of one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunLog {
    lines: Vec<String>,
}

impl RunLog {
    pub fn new() -> Self {
        RunLog::default()
    }

    /// Appends one line.
    pub fn line(&mut self, line: impl Into<String>) {
        self.lines.push(line.into());
    }

    /// Appends captured command output, line by line.
    pub fn output(&mut self, output: &str) {
        self.lines
            .extend(output.lines().map(|line| line.trim_end().to_string()));
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines.iter().any(|line| line.contains(needle))
    }
}

impl fmt::Display for RunLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in &self.lines {
            writeln!(f, "{}", line)?;
        }
        Ok(())
    }
}

/// The result of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub key: RepoKey,
    pub run_id: RunId,
    pub status: RunStatus,
    pub log: RunLog,

    /// When the runner started. Orders outcomes of successive runs.
    pub started_at: DateTime<Utc>,

    /// The working directory the run used (already removed), if it got
    /// far enough to create one.
    pub workdir: Option<PathBuf>,
}

/// Why a run left the stage sequence early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Halt {
    Stopped,
    Failed(FailureKind),
}

/// Drives one run from `starting` to its terminal state.
pub struct PipelineRunner<S: Services> {
    services: Arc<S>,
    registry: Arc<RunRegistry>,
    settings: Arc<RunSettings>,
    handle: Arc<ControlHandle>,
    request: BuildRequest,
    log: RunLog,
}

impl<S: Services> PipelineRunner<S> {
    pub fn new(
        services: Arc<S>,
        registry: Arc<RunRegistry>,
        settings: Arc<RunSettings>,
        handle: Arc<ControlHandle>,
        request: BuildRequest,
    ) -> Self {
        PipelineRunner {
            services,
            registry,
            settings,
            handle,
            request,
            log: RunLog::new(),
        }
    }

    /// Runs every stage and performs terminal handling.
    ///
    /// On self-completion the registration is released before the
    /// acknowledgement is posted. When the run stops for a cancellation the
    /// registration is left in place for the preemptor to replace.
    #[instrument(
        name = "pipeline",
        skip(self),
        fields(repo = %self.request.key, run_id = %self.handle.id())
    )]
    pub async fn run(mut self) -> RunOutcome {
        let started_at = Utc::now();
        let mut workdir: Option<WorkDir> = None;
        let status = match self.execute(&mut workdir).await {
            Ok(()) => RunStatus::Complete,
            Err(Halt::Stopped) => RunStatus::Stopped,
            Err(Halt::Failed(kind)) => RunStatus::Failed(kind),
        };

        // A request that arrived during the last stage still wins
        let status = if !status.is_stopped() && self.handle.poll_cancel() {
            self.log.line("stopping: finishing");
            info!("cancellation observed at terminal check");
            RunStatus::Stopped
        } else {
            status
        };

        let workdir_path = workdir.as_ref().map(|dir| dir.path().to_path_buf());
        if let Some(dir) = workdir.take() {
            if let Err(e) = dir.reclaim().await {
                warn!(error = %e, "failed to reclaim working directory");
            }
        }

        if status.is_stopped() {
            self.handle.acknowledge(Acknowledgement::Stopped);
        } else {
            self.registry.release(&self.request.key, &self.handle).await;
            self.handle.acknowledge(Acknowledgement::SelfCompleted);
        }

        self.log.line(format!("finished: {}", status));
        info!(%status, "run finished");

        RunOutcome {
            key: self.request.key,
            run_id: self.handle.id(),
            status,
            log: self.log,
            started_at,
            workdir: workdir_path,
        }
    }

    async fn execute(&mut self, workdir: &mut Option<WorkDir>) -> Result<(), Halt> {
        let services = Arc::clone(&self.services);
        let settings = Arc::clone(&self.settings);
        let limit = settings.stage_timeout;
        let key = self.request.key.clone();
        let clone_url = self.request.clone_url.clone();
        let branch = settings.publish_branch(&key).to_string();

        self.checkpoint("starting")?;

        let record = match within(limit, services.store().lookup(&key)).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                return Err(self.fail(
                    FailureKind::RepoNotFound,
                    "lookup",
                    "repository is not registered",
                ));
            }
            Err(reason) => return Err(self.fail(FailureKind::StoreFailed, "lookup", reason)),
        };

        let dir_name = format!("{}-{}", key.slug(), self.handle.id().0);
        let dir = match WorkDir::create(&settings.work_root, &dir_name).await {
            Ok(dir) => dir,
            Err(e) => return Err(self.fail(FailureKind::FetchFailed, "workdir", e)),
        };
        let source = dir.path().to_path_buf();
        *workdir = Some(dir);

        if let Err(reason) = within(
            limit,
            services
                .vcs()
                .fetch(&clone_url, &source, &settings.source_branch),
        )
        .await
        {
            return Err(self.fail(FailureKind::FetchFailed, "fetch", reason));
        }
        self.log.line(format!("fetched {}", settings.source_branch));

        self.checkpoint("building")?;

        match within(limit, services.builder().build(&source)).await {
            Ok(output) => self.log.output(&output),
            Err(reason) => return Err(self.fail(FailureKind::BuildFailed, "build", reason)),
        }

        self.checkpoint("committing")?;

        let output_dir = services.builder().output_dir(&source);
        let repo = match within(
            limit,
            services.vcs().snapshot_and_commit(&output_dir, &branch),
        )
        .await
        {
            Ok(repo) => repo,
            Err(reason) => return Err(self.fail(FailureKind::CommitFailed, "commit", reason)),
        };

        self.checkpoint("pushing")?;

        let remote = self.authenticated_remote(&record, &clone_url)?;

        if let Err(reason) = within(
            limit,
            services.vcs().delete_remote_branch(&repo, &remote, &branch),
        )
        .await
        {
            // The branch may simply not exist yet
            debug!(%reason, "remote branch delete failed");
            self.log
                .line(format!("delete {} failed (ignored): {}", branch, reason));
        }

        if let Err(reason) = within(limit, services.vcs().push(&repo, &remote, &branch)).await {
            return Err(self.fail(FailureKind::PushFailed, "push", reason));
        }
        self.log.line(format!("pushed {} to {}", branch, remote));

        Ok(())
    }

    /// Decrypts the stored token and embeds it in the push URL. The
    /// plaintext token does not outlive this call.
    fn authenticated_remote(
        &mut self,
        record: &RepoRecord,
        clone_url: &str,
    ) -> Result<AuthenticatedRemote, Halt> {
        let token = match self
            .services
            .credentials()
            .decrypt(&record.encrypted_token)
        {
            Ok(token) => token,
            Err(e) => return Err(self.fail(FailureKind::CredentialFailed, "decrypt", e)),
        };

        AuthenticatedRemote::new(clone_url, &record.username, &token)
            .map_err(|e| self.fail(FailureKind::PushFailed, "push", e))
    }

    /// Non-blocking cancellation checkpoint.
    fn checkpoint(&mut self, stage: &'static str) -> Result<(), Halt> {
        if self.handle.poll_cancel() {
            self.log.line(format!("stopping: {}", stage));
            info!(stage, "cancellation observed");
            Err(Halt::Stopped)
        } else {
            self.log.line(format!("continuing: {}", stage));
            debug!(stage, "checkpoint passed");
            Ok(())
        }
    }

    fn fail(&mut self, kind: FailureKind, stage: &str, reason: impl fmt::Display) -> Halt {
        warn!(stage, %kind, %reason, "stage failed");
        self.log.line(format!("failed: {}: {}", stage, reason));
        Halt::Failed(kind)
    }
}

/// Runs a collaborator call under the stage deadline, flattening its error
/// to a message. Dropping the future on expiry kills any child process.
async fn within<T, E: fmt::Display>(
    limit: Duration,
    call: impl Future<Output = Result<T, E>>,
) -> Result<T, String> {
    match tokio::time::timeout(limit, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err(format!("timed out after {:?}", limit)),
    }
}
