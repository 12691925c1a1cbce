//! Shopify webhook signature verification.
//!
//! Shopify signs the exact request body with HMAC-SHA256 and sends the
//! base64 digest in `X-Shopify-Hmac-Sha256`. Verification must run on the raw
//! bytes before any JSON parsing.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Returns `true` when `provided` is the base64 HMAC-SHA256 of `body` under `secret`.
///
/// Any malformed input (empty body, empty secret, empty or undecodable
/// signature) yields `false`.
pub fn verify(body: &[u8], secret: &str, provided: &str) -> bool {
    if body.is_empty() || secret.is_empty() {
        return false;
    }

    let provided = provided.trim();
    if provided.is_empty() {
        return false;
    }
    let Ok(provided_bytes) = STANDARD.decode(provided) else {
        return false;
    };

    let Some(expected) = digest(body, secret) else {
        return false;
    };

    expected.as_slice().ct_eq(provided_bytes.as_slice()).into()
}

/// Produces the base64 signature Shopify would send for `body`.
pub fn sign(body: &[u8], secret: &str) -> String {
    digest(body, secret)
        .map(|bytes| STANDARD.encode(bytes))
        .unwrap_or_default()
}

fn digest(body: &[u8], secret: &str) -> Option<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(body);
    Some(mac.finalize().into_bytes().to_vec())
}
