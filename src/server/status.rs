//! Build status endpoint.
//!
//! Combines the persisted outcome of the most recent run with whether a run
//! is active right now.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::AppState;
use crate::services::{RepoStore, Services};
use crate::types::{InvalidRepoKey, RepoKey, RunStatus};

/// Errors that can occur when fetching build status.
#[derive(Debug, Error)]
pub enum StatusError {
    /// The repository is not registered.
    #[error("repository not registered: {0}")]
    NotFound(RepoKey),

    /// The path does not name a valid repository (e.g. traversal attempt).
    #[error("{0}")]
    InvalidRepo(#[from] InvalidRepoKey),

    /// The metadata store failed.
    #[error("store error: {0}")]
    Store(String),
}

impl IntoResponse for StatusError {
    fn into_response(self) -> Response {
        let status = match &self {
            StatusError::NotFound(_) => StatusCode::NOT_FOUND,
            StatusError::InvalidRepo(_) => StatusCode::BAD_REQUEST,
            StatusError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status, self.to_string()).into_response()
    }
}

/// JSON body of the status endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoStatusResponse {
    pub repo: RepoKey,

    /// Whether a run currently holds the repository.
    pub active: bool,

    pub last_build_status: Option<RunStatus>,
    pub last_build_log: Option<String>,
    pub last_build_at: Option<DateTime<Utc>>,
}

/// Status handler for `GET /api/v1/repos/{owner}/{repo}/status`.
pub async fn status_handler<S: Services>(
    State(app_state): State<AppState<S>>,
    Path((owner, repo)): Path<(String, String)>,
) -> Result<Json<RepoStatusResponse>, StatusError> {
    let key = RepoKey::new(owner, repo)?;
    let coordinator = app_state.coordinator();

    let record = coordinator
        .services()
        .store()
        .lookup(&key)
        .await
        .map_err(|e| StatusError::Store(e.to_string()))?
        .ok_or_else(|| StatusError::NotFound(key.clone()))?;

    let active = coordinator.registry().is_active(&key).await;

    Ok(Json(RepoStatusResponse {
        repo: key,
        active,
        last_build_status: record.last_build_status,
        last_build_log: record.last_build_log,
        last_build_at: record.last_build_at,
    }))
}
