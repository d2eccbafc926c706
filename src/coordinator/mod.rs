//! Per-repository run coordination.
//!
//! For each incoming request the coordinator obtains a slot for the
//! repository (a registered control handle that no other run holds),
//! preempting the active run if there is one, and then drives a
//! [`PipelineRunner`] bound to that slot.
//!
//! # Preemption
//!
//! When the key already has a run, the coordinator posts one cancellation
//! request on its handle and waits for the acknowledgement:
//!
//! - [`Acknowledgement::SelfCompleted`]: the run finished on its own and has
//!   already released the key. The request that was just posted is stale,
//!   so one is drained, and acquisition starts over.
//! - [`Acknowledgement::Stopped`]: the run stopped at a checkpoint and left
//!   its registration behind. The coordinator swaps it for a fresh handle.
//!   If another request already did so, acquisition starts over.
//!
//! Each request goes through at most `max_preempt_attempts` rounds.

pub mod handle;
pub mod registry;

#[cfg(test)]
mod tests;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::pipeline::{BuildRequest, PipelineRunner, RunOutcome, RunSettings, cleanup_stale_workdirs};
use crate::services::{Services, StatusSink};
use crate::types::{FailureKind, RepoKey, RunStatus};

pub use handle::{ACK_CAPACITY, Acknowledgement, CANCEL_CAPACITY, ControlHandle};
pub use registry::RunRegistry;

/// Errors from coordinating a run.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// The request kept losing preemption rounds to other requests.
    #[error("gave up preempting active run for {key} after {attempts} attempts")]
    PreemptionLimit { key: RepoKey, attempts: u32 },

    /// The runner task panicked. Its registration has been released.
    #[error("pipeline runner for {key} panicked")]
    RunnerPanicked { key: RepoKey },
}

/// Owns the run registry and starts runs against a set of collaborators.
pub struct Coordinator<S: Services> {
    registry: Arc<RunRegistry>,
    services: Arc<S>,
    settings: Arc<RunSettings>,
}

impl<S: Services> Coordinator<S> {
    pub fn new(services: Arc<S>, settings: RunSettings) -> Self {
        Coordinator {
            registry: Arc::new(RunRegistry::new()),
            services,
            settings: Arc::new(settings),
        }
    }

    pub fn registry(&self) -> &Arc<RunRegistry> {
        &self.registry
    }

    pub fn services(&self) -> &Arc<S> {
        &self.services
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    /// Removes working directories left under the work root by an earlier
    /// process. Must be called before the first run starts.
    pub fn cleanup_stale_workdirs(&self) -> io::Result<Vec<PathBuf>> {
        cleanup_stale_workdirs(&self.settings.work_root)
    }

    /// Returns a handle registered for `key` that no running pipeline holds.
    ///
    /// The returned handle is already in the registry; the caller must start
    /// a runner bound to it.
    #[instrument(skip(self), fields(repo = %key))]
    pub async fn obtain_slot(&self, key: &RepoKey) -> Result<Arc<ControlHandle>, CoordinatorError> {
        let max_attempts = self.settings.max_preempt_attempts;
        let mut attempts = 0;

        loop {
            let (handle, is_new) = self.registry.acquire(key).await;
            if is_new {
                return Ok(handle);
            }

            if attempts >= max_attempts {
                warn!(attempts, run_id = %handle.id(), "preemption limit reached");
                return Err(CoordinatorError::PreemptionLimit {
                    key: key.clone(),
                    attempts,
                });
            }
            attempts += 1;

            debug!(run_id = %handle.id(), attempt = attempts, "preempting active run");
            handle.request_cancel();

            match handle.wait_ack().await {
                Acknowledgement::SelfCompleted => {
                    // The run never saw our request; drop it.
                    handle.poll_cancel();
                    debug!(run_id = %handle.id(), "active run completed on its own, retrying");
                }
                Acknowledgement::Stopped => {
                    if let Some(fresh) = self.registry.replace(key, &handle).await {
                        info!(
                            previous = %handle.id(),
                            run_id = %fresh.id(),
                            "superseded stopped run"
                        );
                        return Ok(fresh);
                    }
                    debug!(run_id = %handle.id(), "stopped run already superseded, retrying");
                }
            }
        }
    }

    /// Obtains a slot, runs the pipeline to completion, and records the
    /// outcome with the status sink.
    #[instrument(skip(self, request), fields(repo = %request.key))]
    pub async fn run(&self, request: BuildRequest) -> Result<RunOutcome, CoordinatorError> {
        let key = request.key.clone();
        let handle = self.obtain_slot(&key).await?;

        let runner = PipelineRunner::new(
            Arc::clone(&self.services),
            Arc::clone(&self.registry),
            Arc::clone(&self.settings),
            Arc::clone(&handle),
            request,
        );

        let started_at = Utc::now();
        let outcome = match tokio::spawn(runner.run()).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(run_id = %handle.id(), error = %e, "pipeline runner aborted");
                self.registry.release(&key, &handle).await;
                handle.acknowledge(Acknowledgement::SelfCompleted);
                let status = RunStatus::Failed(FailureKind::Panicked);
                let log = format!("failed: runner: {}\nfinished: {}\n", e, status);
                self.services
                    .sink()
                    .record_outcome(&key, &log, status, started_at)
                    .await;
                return Err(CoordinatorError::RunnerPanicked { key });
            }
        };

        self.services
            .sink()
            .record_outcome(
                &outcome.key,
                &outcome.log.to_string(),
                outcome.status,
                outcome.started_at,
            )
            .await;

        Ok(outcome)
    }

    /// Starts coordination for `request` in the background.
    pub fn submit(
        self: &Arc<Self>,
        request: BuildRequest,
    ) -> JoinHandle<Result<RunOutcome, CoordinatorError>> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let result = this.run(request).await;
            if let Err(e) = &result {
                warn!(error = %e, "run was not completed");
            }
            result
        })
    }
}
