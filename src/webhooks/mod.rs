//! Webhook validation for GitHub deliveries.
//!
//! This module provides:
//! - Signature verification for webhook payloads (HMAC-SHA256)
//! - Push event parsing for the publishing-source branch

pub mod push;
pub mod signature;

pub use push::{PayloadError, PushNotification, parse_push};
pub use signature::{WebhookSecret, parse_signature_header, verify_signature};
