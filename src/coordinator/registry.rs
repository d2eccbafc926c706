//! Registry of active runs, keyed by repository.
//!
//! The registry is the only shared mutable structure in the coordinator.
//! It is guarded by one read-write lock: lookups share it, while insert,
//! delete and replace take it exclusively. Entries are compared by handle
//! identity (`Arc::ptr_eq`) so a stale runner can never remove or replace a
//! newer runner's registration.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::RwLock;
use tracing::{debug, trace};

use crate::types::{RepoKey, RunId};

use super::handle::ControlHandle;

/// Maps each repository key to the control handle of its active run.
#[derive(Debug, Default)]
pub struct RunRegistry {
    runs: RwLock<HashMap<RepoKey, Arc<ControlHandle>>>,
    next_id: AtomicU64,
}

impl RunRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        RunRegistry::default()
    }

    fn fresh_handle(&self) -> Arc<ControlHandle> {
        let id = RunId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        Arc::new(ControlHandle::new(id))
    }

    /// Returns the handle registered for `key`, creating one if the key is idle.
    ///
    /// The boolean is `true` when a new handle was inserted; the caller must
    /// then start a runner bound to it. When it is `false` the returned handle
    /// belongs to an existing run that has to be preempted first.
    pub async fn acquire(&self, key: &RepoKey) -> (Arc<ControlHandle>, bool) {
        // Fast path: an existing run (read lock)
        {
            let runs = self.runs.read().await;
            if let Some(handle) = runs.get(key) {
                trace!(repo = %key, run_id = %handle.id(), "key has an active run");
                return (Arc::clone(handle), false);
            }
        }

        let mut runs = self.runs.write().await;

        // Double-check after acquiring write lock
        if let Some(handle) = runs.get(key) {
            trace!(repo = %key, run_id = %handle.id(), "run registered while upgrading lock");
            return (Arc::clone(handle), false);
        }

        let handle = self.fresh_handle();
        debug!(repo = %key, run_id = %handle.id(), "registered new run");
        runs.insert(key.clone(), Arc::clone(&handle));
        (handle, true)
    }

    /// Removes the entry for `key` only if it is exactly `handle`.
    ///
    /// Returns `true` if the entry was removed. Calling it again with the
    /// same handle, or with a handle that has since been replaced, is a no-op.
    pub async fn release(&self, key: &RepoKey, handle: &Arc<ControlHandle>) -> bool {
        let mut runs = self.runs.write().await;
        match runs.get(key) {
            Some(current) if Arc::ptr_eq(current, handle) => {
                runs.remove(key);
                debug!(repo = %key, run_id = %handle.id(), "released run");
                true
            }
            Some(current) => {
                trace!(
                    repo = %key,
                    run_id = %handle.id(),
                    current = %current.id(),
                    "release ignored, key belongs to another run"
                );
                false
            }
            None => false,
        }
    }

    /// Installs a fresh handle for `key` if `expected` is still registered.
    ///
    /// Used by a preemptor once the run behind `expected` has acknowledged a
    /// clean stop. Returns `None` if another request got there first.
    pub async fn replace(
        &self,
        key: &RepoKey,
        expected: &Arc<ControlHandle>,
    ) -> Option<Arc<ControlHandle>> {
        let mut runs = self.runs.write().await;
        let current = runs.get_mut(key)?;
        if !Arc::ptr_eq(current, expected) {
            return None;
        }
        let handle = self.fresh_handle();
        debug!(
            repo = %key,
            previous = %expected.id(),
            run_id = %handle.id(),
            "replaced stopped run"
        );
        *current = Arc::clone(&handle);
        Some(handle)
    }

    /// Returns the handle of the active run for `key`, if any.
    pub async fn active(&self, key: &RepoKey) -> Option<Arc<ControlHandle>> {
        self.runs.read().await.get(key).cloned()
    }

    /// Returns true if `key` has an active run.
    pub async fn is_active(&self, key: &RepoKey) -> bool {
        self.runs.read().await.contains_key(key)
    }

    /// Number of keys with an active run.
    pub async fn len(&self) -> usize {
        self.runs.read().await.len()
    }

    /// Returns true if no key has an active run.
    pub async fn is_empty(&self) -> bool {
        self.runs.read().await.is_empty()
    }
}
