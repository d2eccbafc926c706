//! Site builder that runs an external command (Hugo by default).

use std::path::Path;
use std::process::Stdio;

use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

use super::SiteBuilder;

/// Placeholder replaced by the source directory in builder arguments.
pub const SOURCE_PLACEHOLDER: &str = "{source}";

/// Errors from running the site builder.
#[derive(Debug, Error)]
pub enum BuildError {
    /// No program was configured.
    #[error("builder command is empty")]
    EmptyCommand,

    /// The builder could not be started.
    #[error("failed to start builder {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    /// The builder exited unsuccessfully.
    #[error("builder exited with {status}\n{output}")]
    Failed { status: String, output: String },
}

/// Runs a configured command line against the source directory.
///
/// Every argument equal to or containing `{source}` has it replaced with
/// the source path. The child is killed if the build future is dropped,
/// which is how stage deadlines stop a hung build.
#[derive(Debug, Clone)]
pub struct CommandSiteBuilder {
    command: Vec<String>,
}

impl CommandSiteBuilder {
    pub fn new(command: Vec<String>) -> Self {
        CommandSiteBuilder { command }
    }

    /// `hugo -s <source>`
    pub fn hugo() -> Self {
        CommandSiteBuilder::new(vec![
            "hugo".to_string(),
            "-s".to_string(),
            SOURCE_PLACEHOLDER.to_string(),
        ])
    }

    fn command_for(&self, source: &Path) -> Result<Command, BuildError> {
        let (program, args) = self.command.split_first().ok_or(BuildError::EmptyCommand)?;
        let source_arg = source.to_string_lossy();

        let mut cmd = Command::new(program);
        cmd.args(args.iter().map(|arg| arg.replace(SOURCE_PLACEHOLDER, &source_arg)))
            .current_dir(source)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Ok(cmd)
    }
}

impl SiteBuilder for CommandSiteBuilder {
    type Error = BuildError;

    async fn build(&self, source: &Path) -> Result<String, BuildError> {
        let mut cmd = self.command_for(source)?;
        debug!(command = ?self.command, source = %source.display(), "running site builder");

        let output = cmd.output().await.map_err(|source| BuildError::Spawn {
            program: self.command.first().cloned().unwrap_or_default(),
            source,
        })?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        if output.status.success() {
            Ok(combined)
        } else {
            Err(BuildError::Failed {
                status: output.status.to_string(),
                output: combined,
            })
        }
    }
}
