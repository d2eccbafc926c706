//! JSON-file repository store and status sink.
//!
//! Each repository has one record at `<state_dir>/<owner>/<name>.json`.
//!
//! # Atomic Writes
//!
//! Records are written using a write-to-temp-then-rename pattern:
//! 1. Write to `<name>.json.tmp`
//! 2. fsync the file
//! 3. Rename to `<name>.json`
//! 4. fsync the directory
//!
//! Readers therefore see either the old or the new record, never a partial
//! write. Read-modify-write cycles are serialised by a store-wide lock.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::types::{RepoKey, RunStatus};

use super::{RepoRecord, RepoStore, StatusSink};

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// IO error during file operations.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A blocking store task panicked or was cancelled.
    #[error("store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// What [`JsonRepoStore::record_build`] did with an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildWrite {
    Written,
    /// The repository has no record.
    UnknownRepository,
    /// A run that started later has already been recorded.
    Superseded,
}

/// Repository records stored as one JSON file per repository.
#[derive(Debug, Clone)]
pub struct JsonRepoStore {
    inner: Arc<StoreInner>,
}

#[derive(Debug)]
struct StoreInner {
    state_dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonRepoStore {
    /// Creates a store rooted at `state_dir`. The directory is created lazily.
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        JsonRepoStore {
            inner: Arc::new(StoreInner {
                state_dir: state_dir.into(),
                write_lock: Mutex::new(()),
            }),
        }
    }

    /// Returns the state directory.
    pub fn state_dir(&self) -> &Path {
        &self.inner.state_dir
    }

    /// Returns the record path for `key`.
    pub fn record_path(&self, key: &RepoKey) -> PathBuf {
        self.inner
            .state_dir
            .join(key.owner())
            .join(format!("{}.json", key.name()))
    }

    /// Loads the record for `key`, returning `None` if it does not exist.
    pub async fn load(&self, key: &RepoKey) -> Result<Option<RepoRecord>> {
        let path = self.record_path(key);
        Ok(tokio::task::spawn_blocking(move || try_load_record(&path)).await??)
    }

    /// Creates or updates the credentials for `key`, keeping its build history.
    pub async fn register(
        &self,
        key: &RepoKey,
        username: &str,
        encrypted_token: &str,
    ) -> Result<RepoRecord> {
        let _guard = self.inner.write_lock.lock().await;
        let path = self.record_path(key);
        let username = username.to_string();
        let encrypted_token = encrypted_token.to_string();

        let record = tokio::task::spawn_blocking(move || -> Result<RepoRecord> {
            let record = match try_load_record(&path)? {
                Some(mut existing) => {
                    existing.username = username;
                    existing.encrypted_token = encrypted_token;
                    existing
                }
                None => RepoRecord::new(username, encrypted_token),
            };
            save_record_atomic(&path, &record)?;
            Ok(record)
        })
        .await??;

        debug!(repo = %key, "registered repository");
        Ok(record)
    }

    /// Stores the outcome of a run on an existing record.
    ///
    /// Nothing is written if the repository is unknown, or if the record
    /// already holds the outcome of a run that started after this one.
    pub async fn record_build(
        &self,
        key: &RepoKey,
        log: &str,
        status: RunStatus,
        started_at: DateTime<Utc>,
    ) -> Result<BuildWrite> {
        let _guard = self.inner.write_lock.lock().await;
        let path = self.record_path(key);
        let log = log.to_string();

        Ok(tokio::task::spawn_blocking(move || -> Result<BuildWrite> {
            let Some(mut record) = try_load_record(&path)? else {
                return Ok(BuildWrite::UnknownRepository);
            };
            if let Some(recorded) = record.last_build_started_at {
                if recorded > started_at {
                    return Ok(BuildWrite::Superseded);
                }
            }
            record.last_build_log = Some(log);
            record.last_build_status = Some(status);
            record.last_build_at = Some(Utc::now());
            record.last_build_started_at = Some(started_at);
            save_record_atomic(&path, &record)?;
            Ok(BuildWrite::Written)
        })
        .await??)
    }
}

impl RepoStore for JsonRepoStore {
    type Error = StoreError;

    async fn lookup(&self, key: &RepoKey) -> Result<Option<RepoRecord>> {
        self.load(key).await
    }
}

impl StatusSink for JsonRepoStore {
    async fn record_outcome(
        &self,
        key: &RepoKey,
        log: &str,
        status: RunStatus,
        started_at: DateTime<Utc>,
    ) {
        match self.record_build(key, log, status, started_at).await {
            Ok(BuildWrite::Written) => debug!(repo = %key, %status, "recorded build outcome"),
            Ok(BuildWrite::UnknownRepository) => {
                debug!(repo = %key, %status, "outcome for unknown repository dropped")
            }
            Ok(BuildWrite::Superseded) => {
                debug!(repo = %key, %status, "outcome of superseded run dropped")
            }
            Err(e) => warn!(repo = %key, %status, error = %e, "failed to record build outcome"),
        }
    }
}

/// Saves a record atomically to disk.
pub fn save_record_atomic(path: &Path, record: &RepoRecord) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let tmp_path = path.with_extension("json.tmp");
    let bytes = serde_json::to_vec_pretty(record)?;

    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
    }

    std::fs::rename(&tmp_path, path)?;

    if let Some(parent) = path.parent() {
        File::open(parent)?.sync_all()?;
    }

    Ok(())
}

/// Loads a record, returning `None` if the file doesn't exist.
///
/// Other errors (unreadable file, malformed JSON) are propagated.
pub fn try_load_record(path: &Path) -> Result<Option<RepoRecord>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
