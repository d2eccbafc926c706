//! Service configuration.
//!
//! Configuration is read from a JSON file and then overridden by `PAGES_*`
//! environment variables. A missing file means all defaults. Every field
//! can be set either way; [`Config::validate`] runs after both layers.

use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::git::CommitIdentity;
use crate::pipeline::{DEFAULT_MAX_PREEMPT_ATTEMPTS, DEFAULT_STAGE_TIMEOUT, RunSettings};
use crate::services::credentials::KEY_LEN;
use crate::services::builder::SOURCE_PLACEHOLDER;

/// Default path of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config.json";

const ENV_LISTEN_ADDR: &str = "PAGES_LISTEN_ADDR";
const ENV_SOURCE_BRANCH: &str = "PAGES_SOURCE_BRANCH";
const ENV_WEBHOOK_SECRET: &str = "PAGES_WEBHOOK_SECRET";
const ENV_SECRET_KEY: &str = "PAGES_SECRET_KEY";
const ENV_STATE_DIR: &str = "PAGES_STATE_DIR";
const ENV_WORK_ROOT: &str = "PAGES_WORK_ROOT";
const ENV_BUILDER_COMMAND: &str = "PAGES_BUILDER_COMMAND";
const ENV_PROJECT_BRANCH: &str = "PAGES_PROJECT_BRANCH";
const ENV_USER_SITE_BRANCH: &str = "PAGES_USER_SITE_BRANCH";
const ENV_STAGE_TIMEOUT_SECS: &str = "PAGES_STAGE_TIMEOUT_SECS";
const ENV_MAX_PREEMPT_ATTEMPTS: &str = "PAGES_MAX_PREEMPT_ATTEMPTS";
const ENV_COMMIT_NAME: &str = "PAGES_COMMIT_NAME";
const ENV_COMMIT_EMAIL: &str = "PAGES_COMMIT_EMAIL";

/// Errors from loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("{var}={value:?} is invalid: {reason}")]
    InvalidEnv {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Everything the service needs to run.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address the HTTP server binds to.
    pub listen_addr: SocketAddr,

    /// Branch whose pushes are built.
    pub source_branch: String,

    /// Shared secret for webhook signatures.
    pub webhook_secret: String,

    /// AES-256 key for stored access tokens, as 64 hex characters.
    pub secret_key: String,

    /// Directory holding one record per registered repository.
    pub state_dir: PathBuf,

    /// Parent of the per-run working directories.
    pub work_root: PathBuf,

    /// Site builder command line; `{source}` is replaced by the checkout.
    pub builder_command: Vec<String>,

    pub project_branch: String,
    pub user_site_branch: String,
    pub stage_timeout_secs: u64,
    pub max_preempt_attempts: u32,
    pub commit_name: String,
    pub commit_email: String,
}

impl Default for Config {
    fn default() -> Self {
        let run = RunSettings::default();
        let identity = CommitIdentity::default();
        Config {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            source_branch: run.source_branch,
            webhook_secret: String::new(),
            secret_key: String::new(),
            state_dir: PathBuf::from("state"),
            work_root: run.work_root,
            builder_command: vec![
                "hugo".to_string(),
                "-s".to_string(),
                SOURCE_PLACEHOLDER.to_string(),
            ],
            project_branch: run.project_branch,
            user_site_branch: run.user_site_branch,
            stage_timeout_secs: DEFAULT_STAGE_TIMEOUT.as_secs(),
            max_preempt_attempts: DEFAULT_MAX_PREEMPT_ATTEMPTS,
            commit_name: identity.name,
            commit_email: identity.email,
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("listen_addr", &self.listen_addr)
            .field("source_branch", &self.source_branch)
            .field("webhook_secret", &"<redacted>")
            .field("secret_key", &"<redacted>")
            .field("state_dir", &self.state_dir)
            .field("work_root", &self.work_root)
            .field("builder_command", &self.builder_command)
            .field("project_branch", &self.project_branch)
            .field("user_site_branch", &self.user_site_branch)
            .field("stage_timeout_secs", &self.stage_timeout_secs)
            .field("max_preempt_attempts", &self.max_preempt_attempts)
            .field("commit_name", &self.commit_name)
            .field("commit_email", &self.commit_email)
            .finish()
    }
}

impl Config {
    /// Loads `path`, applies the process environment, and validates.
    pub fn from_env(path: &Path) -> Result<Self> {
        Self::from_env_with(path, |key| std::env::var(key).ok())
    }

    /// Like [`Config::from_env`] with a custom environment source.
    pub fn from_env_with<F>(path: &Path, get_env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let config = Self::load(path)?.with_overrides(get_env)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads the JSON file at `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Config::default()),
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Applies `PAGES_*` overrides from `get_env`.
    pub fn with_overrides<F>(mut self, get_env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = get_env(ENV_LISTEN_ADDR) {
            self.listen_addr = parse_env(ENV_LISTEN_ADDR, value)?;
        }
        set_string(&get_env, ENV_SOURCE_BRANCH, &mut self.source_branch);
        set_string(&get_env, ENV_WEBHOOK_SECRET, &mut self.webhook_secret);
        set_string(&get_env, ENV_SECRET_KEY, &mut self.secret_key);
        set_string(&get_env, ENV_PROJECT_BRANCH, &mut self.project_branch);
        set_string(&get_env, ENV_USER_SITE_BRANCH, &mut self.user_site_branch);
        set_string(&get_env, ENV_COMMIT_NAME, &mut self.commit_name);
        set_string(&get_env, ENV_COMMIT_EMAIL, &mut self.commit_email);
        if let Some(value) = get_env(ENV_STATE_DIR) {
            self.state_dir = PathBuf::from(value);
        }
        if let Some(value) = get_env(ENV_WORK_ROOT) {
            self.work_root = PathBuf::from(value);
        }
        if let Some(value) = get_env(ENV_BUILDER_COMMAND) {
            self.builder_command = value.split_whitespace().map(str::to_string).collect();
        }
        if let Some(value) = get_env(ENV_STAGE_TIMEOUT_SECS) {
            self.stage_timeout_secs = parse_env(ENV_STAGE_TIMEOUT_SECS, value)?;
        }
        if let Some(value) = get_env(ENV_MAX_PREEMPT_ATTEMPTS) {
            self.max_preempt_attempts = parse_env(ENV_MAX_PREEMPT_ATTEMPTS, value)?;
        }
        Ok(self)
    }

    /// Rejects configurations the service cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.webhook_secret.is_empty() {
            return Err(ConfigError::Invalid("webhook_secret must be set"));
        }
        match hex::decode(self.secret_key.trim()) {
            Ok(key) if key.len() == KEY_LEN => {}
            _ => return Err(ConfigError::Invalid("secret_key must be 64 hex characters")),
        }
        if self.builder_command.is_empty() {
            return Err(ConfigError::Invalid("builder_command must not be empty"));
        }
        if self.source_branch.is_empty()
            || self.project_branch.is_empty()
            || self.user_site_branch.is_empty()
        {
            return Err(ConfigError::Invalid("branch names must not be empty"));
        }
        if self.stage_timeout_secs == 0 {
            return Err(ConfigError::Invalid("stage_timeout_secs must be positive"));
        }
        if self.max_preempt_attempts == 0 {
            return Err(ConfigError::Invalid("max_preempt_attempts must be positive"));
        }
        Ok(())
    }

    pub fn run_settings(&self) -> RunSettings {
        RunSettings {
            work_root: self.work_root.clone(),
            source_branch: self.source_branch.clone(),
            project_branch: self.project_branch.clone(),
            user_site_branch: self.user_site_branch.clone(),
            stage_timeout: Duration::from_secs(self.stage_timeout_secs),
            max_preempt_attempts: self.max_preempt_attempts,
        }
    }

    pub fn commit_identity(&self) -> CommitIdentity {
        CommitIdentity {
            name: self.commit_name.clone(),
            email: self.commit_email.clone(),
        }
    }
}

fn set_string<F>(get_env: &F, var: &str, target: &mut String)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = get_env(var) {
        *target = value;
    }
}

fn parse_env<T>(var: &'static str, value: String) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidEnv {
        var,
        reason: e.to_string(),
        value,
    })
}
