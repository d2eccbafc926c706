//! Shared test utilities: in-memory collaborators and generators for
//! property-based testing.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use proptest::prelude::*;

use crate::services::{
    AccessToken, AuthenticatedRemote, CredentialDecryptor, RepoRecord, RepoStore, ServiceSet,
    SiteBuilder, StatusSink, Vcs,
};
use crate::types::{RepoKey, RunStatus};

pub fn arb_repo_component() -> impl Strategy<Value = String> {
    "[A-Za-z0-9_][A-Za-z0-9_.-]{0,30}"
        .prop_filter("dot components are reserved", |s| s != "." && s != "..")
}

pub fn arb_repo_key() -> impl Strategy<Value = RepoKey> {
    (arb_repo_component(), arb_repo_component())
        .prop_map(|(owner, name)| RepoKey::new(owner, name).unwrap())
}

pub fn repo_key(s: &str) -> RepoKey {
    RepoKey::parse(s).unwrap()
}

/// Polls `condition` every few milliseconds until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    condition()
}

/// Error type shared by the fakes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct FakeError(pub String);

// ─── Store ───

#[derive(Debug, Default)]
pub struct FakeStore {
    records: Mutex<HashMap<RepoKey, RepoRecord>>,
    fail: bool,
}

impl FakeStore {
    pub fn with_repo(self, key: &RepoKey, username: &str) -> Self {
        self.records.lock().unwrap().insert(
            key.clone(),
            RepoRecord::new(username, format!("sealed-{}", key.slug())),
        );
        self
    }

    pub fn with_record(self, key: &RepoKey, record: RepoRecord) -> Self {
        self.records.lock().unwrap().insert(key.clone(), record);
        self
    }

    pub fn failing() -> Self {
        FakeStore {
            fail: true,
            ..FakeStore::default()
        }
    }
}

impl RepoStore for FakeStore {
    type Error = FakeError;

    async fn lookup(&self, key: &RepoKey) -> Result<Option<RepoRecord>, FakeError> {
        if self.fail {
            return Err(FakeError("store unavailable".to_string()));
        }
        Ok(self.records.lock().unwrap().get(key).cloned())
    }
}

// ─── Credentials ───

/// "Decrypts" `sealed-<x>` to `token-<x>`.
#[derive(Debug, Default)]
pub struct FakeCredentials {
    fail: bool,
}

impl FakeCredentials {
    pub fn failing() -> Self {
        FakeCredentials { fail: true }
    }
}

impl CredentialDecryptor for FakeCredentials {
    type Error = FakeError;

    fn decrypt(&self, encrypted_token: &str) -> Result<AccessToken, FakeError> {
        if self.fail {
            return Err(FakeError("bad key".to_string()));
        }
        let plain = encrypted_token.replacen("sealed-", "token-", 1);
        Ok(AccessToken::new(plain))
    }
}

// ─── VCS ───

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VcsStage {
    Fetch,
    Snapshot,
    Delete,
    Push,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VcsCall {
    Fetch {
        url: String,
        path: PathBuf,
        branch: String,
        /// Other entries in the work root when the fetch started.
        siblings: Vec<PathBuf>,
    },
    Snapshot {
        path: PathBuf,
        branch: String,
    },
    Delete {
        remote: String,
        branch: String,
    },
    Push {
        remote: String,
        branch: String,
    },
}

#[derive(Debug, Default)]
pub struct FakeVcs {
    calls: Mutex<Vec<VcsCall>>,
    failures: HashSet<VcsStage>,
    push_delay: Duration,
}

impl FakeVcs {
    /// Pushes are recorded immediately but complete only after `delay`.
    pub fn with_push_delay(delay: Duration) -> Self {
        FakeVcs {
            push_delay: delay,
            ..FakeVcs::default()
        }
    }

    pub fn failing_at(stage: VcsStage) -> Self {
        FakeVcs {
            failures: HashSet::from([stage]),
            ..FakeVcs::default()
        }
    }

    pub fn calls(&self) -> Vec<VcsCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn pushes(&self) -> Vec<VcsCall> {
        self.calls()
            .into_iter()
            .filter(|call| matches!(call, VcsCall::Push { .. }))
            .collect()
    }

    pub fn fetches(&self) -> Vec<VcsCall> {
        self.calls()
            .into_iter()
            .filter(|call| matches!(call, VcsCall::Fetch { .. }))
            .collect()
    }

    fn record(&self, call: VcsCall, stage: VcsStage) -> Result<(), FakeError> {
        self.calls.lock().unwrap().push(call);
        if self.failures.contains(&stage) {
            Err(FakeError(format!("{:?} rejected", stage)))
        } else {
            Ok(())
        }
    }
}

fn siblings_of(path: &Path) -> Vec<PathBuf> {
    let Some(parent) = path.parent() else {
        return Vec::new();
    };
    let mut found: Vec<PathBuf> = std::fs::read_dir(parent)
        .map(|entries| {
            entries
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p != path)
                .collect()
        })
        .unwrap_or_default();
    found.sort();
    found
}

impl Vcs for FakeVcs {
    type Error = FakeError;
    type Repo = PathBuf;

    async fn fetch(&self, url: &str, path: &Path, branch: &str) -> Result<(), FakeError> {
        let call = VcsCall::Fetch {
            url: url.to_string(),
            path: path.to_path_buf(),
            branch: branch.to_string(),
            siblings: siblings_of(path),
        };
        self.record(call, VcsStage::Fetch)?;
        std::fs::write(path.join("config.toml"), "title = 'fake'")
            .map_err(|e| FakeError(e.to_string()))
    }

    async fn snapshot_and_commit(
        &self,
        output_dir: &Path,
        branch: &str,
    ) -> Result<PathBuf, FakeError> {
        let call = VcsCall::Snapshot {
            path: output_dir.to_path_buf(),
            branch: branch.to_string(),
        };
        self.record(call, VcsStage::Snapshot)?;
        if !output_dir.exists() {
            return Err(FakeError("no build output".to_string()));
        }
        Ok(output_dir.to_path_buf())
    }

    async fn delete_remote_branch(
        &self,
        _repo: &PathBuf,
        remote: &AuthenticatedRemote,
        branch: &str,
    ) -> Result<(), FakeError> {
        let call = VcsCall::Delete {
            remote: remote.expose().to_string(),
            branch: branch.to_string(),
        };
        self.record(call, VcsStage::Delete)
    }

    async fn push(
        &self,
        _repo: &PathBuf,
        remote: &AuthenticatedRemote,
        branch: &str,
    ) -> Result<(), FakeError> {
        let call = VcsCall::Push {
            remote: remote.expose().to_string(),
            branch: branch.to_string(),
        };
        let result = self.record(call, VcsStage::Push);
        tokio::time::sleep(self.push_delay).await;
        result
    }
}

// ─── Builder ───

/// Writes `public/index.html` after sleeping for `delay`, and tracks how
/// many builds overlap.
#[derive(Debug, Default)]
pub struct FakeBuilder {
    delay: Duration,
    fail: bool,
    panic: bool,
    started: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl FakeBuilder {
    pub fn with_delay(delay: Duration) -> Self {
        FakeBuilder {
            delay,
            ..FakeBuilder::default()
        }
    }

    pub fn failing() -> Self {
        FakeBuilder {
            fail: true,
            ..FakeBuilder::default()
        }
    }

    /// Panics after sleeping for `delay`.
    pub fn panicking(delay: Duration) -> Self {
        FakeBuilder {
            delay,
            panic: true,
            ..FakeBuilder::default()
        }
    }

    /// Number of builds that have started.
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    /// Highest number of builds that ran at the same time.
    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

/// Decrements the active-build counter even if the build future is dropped.
struct ActiveBuild<'a>(&'a AtomicUsize);

impl Drop for ActiveBuild<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl SiteBuilder for FakeBuilder {
    type Error = FakeError;

    async fn build(&self, source: &Path) -> Result<String, FakeError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        let _active = ActiveBuild(&self.active);

        tokio::time::sleep(self.delay).await;

        if self.panic {
            panic!("site builder crashed");
        }
        if self.fail {
            return Err(FakeError("template error".to_string()));
        }
        let public = self.output_dir(source);
        std::fs::create_dir_all(&public).map_err(|e| FakeError(e.to_string()))?;
        std::fs::write(public.join("index.html"), "<h1>fake</h1>")
            .map_err(|e| FakeError(e.to_string()))?;
        Ok("Built site in 1 ms\n".to_string())
    }
}

// ─── Sink ───

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedOutcome {
    pub key: RepoKey,
    pub log: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct FakeSink {
    outcomes: Mutex<Vec<RecordedOutcome>>,
}

impl FakeSink {
    pub fn outcomes(&self) -> Vec<RecordedOutcome> {
        self.outcomes.lock().unwrap().clone()
    }
}

impl StatusSink for FakeSink {
    async fn record_outcome(
        &self,
        key: &RepoKey,
        log: &str,
        status: RunStatus,
        started_at: DateTime<Utc>,
    ) {
        self.outcomes.lock().unwrap().push(RecordedOutcome {
            key: key.clone(),
            log: log.to_string(),
            status,
            started_at,
        });
    }
}

pub type FakeServices = ServiceSet<FakeStore, FakeCredentials, FakeVcs, FakeBuilder, FakeSink>;

/// Fakes with `acme/site` and `acme/acme.github.io` registered and a
/// builder that takes `build_delay`.
pub fn fake_services(build_delay: Duration) -> FakeServices {
    ServiceSet {
        store: FakeStore::default()
            .with_repo(&repo_key("acme/site"), "bot")
            .with_repo(&repo_key("acme/acme.github.io"), "bot"),
        credentials: FakeCredentials::default(),
        vcs: FakeVcs::default(),
        builder: FakeBuilder::with_delay(build_delay),
        sink: FakeSink::default(),
    }
}
