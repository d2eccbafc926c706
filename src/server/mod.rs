//! HTTP server for the pages builder.
//!
//! # Endpoints
//!
//! - `POST /webhook` - Accepts GitHub webhook deliveries (returns 202 Accepted)
//! - `GET /api/v1/repos/{owner}/{repo}/status` - Returns the last build of a repository as JSON
//! - `GET /health` - Returns 200 if server is running

use std::sync::Arc;

use axum::http::StatusCode;

pub mod status;
pub mod webhook;

pub use status::status_handler;
pub use webhook::webhook_handler;

use crate::coordinator::Coordinator;
use crate::services::Services;
use crate::webhooks::WebhookSecret;

/// Shared application state.
///
/// This is passed to all handlers via Axum's `State` extractor.
pub struct AppState<S: Services> {
    inner: Arc<AppStateInner<S>>,
}

struct AppStateInner<S: Services> {
    coordinator: Arc<Coordinator<S>>,

    /// Secret for HMAC-SHA256 signature verification.
    webhook_secret: WebhookSecret,
}

impl<S: Services> Clone for AppState<S> {
    fn clone(&self) -> Self {
        AppState {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: Services> AppState<S> {
    pub fn new(coordinator: Arc<Coordinator<S>>, webhook_secret: WebhookSecret) -> Self {
        AppState {
            inner: Arc::new(AppStateInner {
                coordinator,
                webhook_secret,
            }),
        }
    }

    pub fn coordinator(&self) -> &Arc<Coordinator<S>> {
        &self.inner.coordinator
    }

    pub fn webhook_secret(&self) -> &WebhookSecret {
        &self.inner.webhook_secret
    }

    /// Branch whose pushes start a run.
    pub fn source_branch(&self) -> &str {
        &self.inner.coordinator.settings().source_branch
    }
}

/// Liveness check; returns 200 OK with the body "OK".
pub async fn health_handler() -> (StatusCode, &'static str) {
    (StatusCode::OK, "OK")
}

/// Builds the axum Router with all endpoints.
pub fn build_router<S: Services>(app_state: AppState<S>) -> axum::Router {
    use axum::routing::{get, post};

    axum::Router::new()
        .route("/webhook", post(webhook_handler::<S>))
        .route("/api/v1/repos/{owner}/{repo}/status", get(status_handler::<S>))
        .route("/health", get(health_handler))
        .with_state(app_state)
}
