//! Webhook endpoint handler.
//!
//! Verifies the delivery signature, filters for pushes to the
//! publishing-source branch, and hands matching pushes to the coordinator.
//! The handler never waits for a run; it returns 202 Accepted as soon as
//! coordination has been started.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::AppState;
use crate::services::Services;
use crate::types::DeliveryId;
use crate::webhooks::{PayloadError, parse_push};

/// Header name for GitHub event type.
const HEADER_EVENT: &str = "x-github-event";
/// Header name for GitHub delivery ID.
const HEADER_DELIVERY: &str = "x-github-delivery";
/// Header name for GitHub signature.
const HEADER_SIGNATURE: &str = "x-hub-signature-256";

/// Errors that can occur when processing a webhook.
#[derive(Debug, Error)]
pub enum WebhookError {
    /// Missing required header.
    #[error("missing required header: {0}")]
    MissingHeader(&'static str),

    /// Missing or invalid signature.
    #[error("invalid signature")]
    InvalidSignature,

    /// The push payload could not be interpreted.
    #[error(transparent)]
    Payload(#[from] PayloadError),
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let status = match &self {
            WebhookError::MissingHeader(_) => StatusCode::BAD_REQUEST,
            WebhookError::InvalidSignature => StatusCode::UNAUTHORIZED,
            WebhookError::Payload(_) => StatusCode::BAD_REQUEST,
        };

        (status, self.to_string()).into_response()
    }
}

/// Webhook handler.
///
/// # Response
///
/// - 200 OK: `ping` event
/// - 202 Accepted: push to the source branch, run started
/// - 202 Accepted ("Ignored"): any other event or ref
/// - 400 Bad Request: missing event header or unreadable push payload
/// - 401 Unauthorized: missing or invalid signature
pub async fn webhook_handler<S: Services>(
    State(app_state): State<AppState<S>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, &'static str), WebhookError> {
    let delivery_id = DeliveryId::new(optional_header(&headers, HEADER_DELIVERY).unwrap_or("-"));

    // Verify signature before looking at anything else.
    let signature = optional_header(&headers, HEADER_SIGNATURE).unwrap_or_default();
    if !app_state.webhook_secret().verify(&body, signature) {
        warn!(delivery_id = %delivery_id, "Invalid webhook signature");
        return Err(WebhookError::InvalidSignature);
    }

    let event_type =
        optional_header(&headers, HEADER_EVENT).ok_or(WebhookError::MissingHeader(HEADER_EVENT))?;

    debug!(delivery_id = %delivery_id, event_type, "Received webhook");

    match event_type {
        "ping" => return Ok((StatusCode::OK, "pong")),
        "push" => {}
        _ => return Ok((StatusCode::ACCEPTED, "Ignored")),
    }

    let Some(push) = parse_push(&body, app_state.source_branch())? else {
        debug!(delivery_id = %delivery_id, "Push to another ref, ignoring");
        return Ok((StatusCode::ACCEPTED, "Ignored"));
    };

    info!(
        delivery_id = %delivery_id,
        repo = %push.key,
        head = push.head.as_deref().unwrap_or("-"),
        "Starting run for push"
    );
    // Detached: the run outlives the request
    drop(app_state.coordinator().submit(push.into_request()));

    Ok((StatusCode::ACCEPTED, "Accepted"))
}

fn optional_header<'a>(headers: &'a HeaderMap, name: &'static str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}
