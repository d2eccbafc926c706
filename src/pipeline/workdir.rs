//! Per-run working directories.

use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

/// A working directory owned by exactly one run.
///
/// The directory is removed by [`WorkDir::reclaim`] on every normal exit
/// path; if the guard is dropped without being reclaimed (a panic, or the
/// run's task being aborted) it is removed synchronously in `Drop`.
#[derive(Debug)]
pub struct WorkDir {
    path: PathBuf,
    reclaimed: bool,
}

impl WorkDir {
    /// Creates `<root>/<name>`. Fails if the directory already exists, so a
    /// directory is never shared between runs.
    pub async fn create(root: &Path, name: &str) -> io::Result<Self> {
        tokio::fs::create_dir_all(root).await?;
        let path = root.join(name);
        tokio::fs::create_dir(&path).await?;
        debug!(path = %path.display(), "created working directory");
        Ok(WorkDir {
            path,
            reclaimed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Removes the directory and everything in it.
    pub async fn reclaim(mut self) -> io::Result<()> {
        self.reclaimed = true;
        match tokio::fs::remove_dir_all(&self.path).await {
            Ok(()) => {
                debug!(path = %self.path.display(), "reclaimed working directory");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Drop for WorkDir {
    fn drop(&mut self) {
        if self.reclaimed {
            return;
        }
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to remove abandoned working directory");
            }
        }
    }
}

/// Removes every entry under `root`.
///
/// Run ids restart with the process, so a directory left behind by a
/// process that was killed mid-run would collide with a later run's name.
/// Call this before any run starts. Returns the removed paths.
pub fn cleanup_stale_workdirs(root: &Path) -> io::Result<Vec<PathBuf>> {
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut removed = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.is_dir() {
            std::fs::remove_dir_all(&path)?;
        } else {
            std::fs::remove_file(&path)?;
        }
        info!(path = %path.display(), "removed stale working directory");
        removed.push(path);
    }
    removed.sort();
    Ok(removed)
}
