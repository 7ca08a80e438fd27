//! Webhook signature verification (`X-Hub-Signature-256`)

use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::warn;

use crate::config::WebhookSecret;
use crate::error::{DeployError, Result};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Hub-Signature-256";
pub const SIGNATURE_ALGORITHM: &str = "sha256";

/// Checks a `sha256=<hex>` header against the raw request body.
///
/// Returns `Ok(false)` for every per-request problem (absent header, no `=`,
/// wrong algorithm, bad digest). Only an empty secret is an error.
pub fn verify_signature(secret: &[u8], payload: &[u8], header: Option<&str>) -> Result<bool> {
    if secret.is_empty() {
        return Err(DeployError::MissingSecret);
    }

    let Some(header) = header else {
        warn!("No signature header received");
        return Ok(false);
    };

    let Some((algorithm, digest)) = header.split_once('=') else {
        warn!("Signature header is not of the form <algorithm>=<digest>");
        return Ok(false);
    };

    if algorithm != SIGNATURE_ALGORITHM {
        warn!("Unsupported signature algorithm: {:?}", algorithm);
        return Ok(false);
    }

    // Expected digests are rendered lowercase, so anything else can never match.
    if !digest.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
        warn!("Signature digest is not lowercase hex");
        return Ok(false);
    }
    let Ok(provided) = hex::decode(digest) else {
        warn!("Signature digest has odd length");
        return Ok(false);
    };

    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| DeployError::Config(format!("unusable webhook secret: {}", e)))?;
    mac.update(payload);

    // verify_slice compares in constant time
    let valid = mac.verify_slice(&provided).is_ok();
    if !valid {
        warn!("Signature digest mismatch ({} byte payload)", payload.len());
    }
    Ok(valid)
}

/// Renders the header value a sender holding `secret` would attach to `payload`
pub fn compute_signature(secret: &[u8], payload: &[u8]) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| DeployError::Config(format!("unusable webhook secret: {}", e)))?;
    mac.update(payload);
    Ok(format!(
        "{}={}",
        SIGNATURE_ALGORITHM,
        hex::encode(mac.finalize().into_bytes())
    ))
}

/// Verifier bound to the process-wide secret, built once at startup
#[derive(Debug, Clone)]
pub struct SignatureVerifier {
    secret: WebhookSecret,
}

impl SignatureVerifier {
    pub fn new(secret: WebhookSecret) -> Self {
        Self { secret }
    }

    pub fn has_secret(&self) -> bool {
        !self.secret.expose().is_empty()
    }

    pub fn verify(&self, payload: &[u8], header: Option<&str>) -> bool {
        // WebhookSecret is never empty, so the error arm is unreachable in practice.
        verify_signature(self.secret.expose(), payload, header).unwrap_or(false)
    }
}
