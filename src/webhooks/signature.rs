//! Webhook signature verification (HMAC-SHA256).
//!
//! GitHub signs each delivery with the shared secret and sends the result
//! in `X-Hub-Signature-256` as `sha256=<hex>`. Deliveries are verified
//! before their body is parsed.

use std::fmt;

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// The prefix GitHub puts in front of the hex digest.
const SIGNATURE_PREFIX: &str = "sha256=";

/// Decodes a `sha256=<hex>` header into the raw digest.
///
/// Returns `None` for anything else (other algorithms, bad hex).
pub fn parse_signature_header(header: &str) -> Option<Vec<u8>> {
    let hex_sig = header.trim().strip_prefix(SIGNATURE_PREFIX)?;
    hex::decode(hex_sig).ok()
}

/// The shared webhook secret. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct WebhookSecret(Vec<u8>);

impl WebhookSecret {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        WebhookSecret(secret.into())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn mac(&self, payload: &[u8]) -> HmacSha256 {
        let mut mac = HmacSha256::new_from_slice(&self.0).expect("HMAC can take key of any size");
        mac.update(payload);
        mac
    }

    /// Returns the header value GitHub would send for `payload`.
    pub fn sign(&self, payload: &[u8]) -> String {
        let digest = self.mac(payload).finalize().into_bytes();
        format!("{}{}", SIGNATURE_PREFIX, hex::encode(digest))
    }

    /// Checks `header` against `payload` in constant time.
    pub fn verify(&self, payload: &[u8], header: &str) -> bool {
        match parse_signature_header(header) {
            Some(expected) => self.mac(payload).verify_slice(&expected).is_ok(),
            None => false,
        }
    }
}

impl fmt::Debug for WebhookSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WebhookSecret(<redacted>)")
    }
}

/// Verifies `header` for `body` with `secret`.
pub fn verify_signature(body: &[u8], header: &str, secret: &WebhookSecret) -> bool {
    secret.verify(body, header)
}
