//! Webhook signature verification.
//!
//! GitHub signs every delivery with HMAC-SHA256 over the raw request body,
//! keyed by the webhook secret, and sends it as `sha256=<hex>` in
//! `X-Hub-Signature-256`. The body must be the bytes exactly as received:
//! re-serialized JSON will not match.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::warn;

use crate::secrets::SecretStore;

pub const SIGNATURE_HEADER: &str = "X-Hub-Signature-256";

const ALGORITHM_PREFIX: &str = "sha256=";

type HmacSha256 = Hmac<Sha256>;

/// Why a delivery was refused. Every failure path lands here, there is no
/// default-allow.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("webhook secret unavailable")]
    SecretUnavailable,
    #[error("{SIGNATURE_HEADER} not set")]
    HeaderMissing,
    #[error("signature mismatch")]
    Mismatch,
}

/// Compute the `sha256=<hex>` signature GitHub would send for `body`.
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(body);
    format!("{ALGORITHM_PREFIX}{}", hex::encode(mac.finalize().into_bytes()))
}

/// Check `header` against the signature of `body` under `secret`.
pub fn check(secret: &str, body: &[u8], header: Option<&str>) -> Result<(), Rejection> {
    if secret.is_empty() {
        return Err(Rejection::SecretUnavailable);
    }
    let Some(header) = header else {
        return Err(Rejection::HeaderMissing);
    };
    let expected = sign(secret, body);
    if bool::from(expected.as_bytes().ct_eq(header.as_bytes())) {
        Ok(())
    } else {
        Err(Rejection::Mismatch)
    }
}

/// Fetch the webhook secret from `secrets` and check the delivery against it.
pub async fn verify(
    secrets: &SecretStore,
    secret_name: &str,
    body: &[u8],
    header: Option<&str>,
) -> Result<(), Rejection> {
    let secret = match secrets.get_secret(secret_name).await {
        Ok(secret) => secret,
        Err(error) => {
            warn!(%error, secret = secret_name, "could not load webhook secret");
            return Err(Rejection::SecretUnavailable);
        }
    };
    check(&secret, body, header)
}
