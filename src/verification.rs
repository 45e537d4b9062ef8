use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::VerifyError;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the provider's signature.
pub const SIGNATURE_HEADER: &str = "fh-signature";

/// Verify a FireHydrant `fh-signature` header.
///
/// The header is the lowercase hex HMAC-SHA256 of the raw request body keyed
/// by the registration secret. An empty secret disables verification, so any
/// caller passing one accepts unauthenticated deliveries.
///
/// `body` must be the bytes exactly as received; re-encoding the JSON first
/// breaks the signature.
pub fn verify_signature(signature: &str, body: &[u8], secret: &[u8]) -> Result<(), VerifyError> {
    if secret.is_empty() {
        tracing::debug!("No webhook secret configured, skipping signature verification");
        return Ok(());
    }

    if signature.is_empty() {
        return Err(VerifyError::MissingSignature);
    }

    let expected = compute_signature(secret, body)?;
    if expected.as_bytes().ct_eq(signature.as_bytes()).into() {
        Ok(())
    } else {
        Err(VerifyError::SignatureMismatch)
    }
}

/// Lowercase hex HMAC-SHA256 of `body` keyed by `secret`.
pub fn compute_signature(secret: &[u8], body: &[u8]) -> Result<String, VerifyError> {
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| VerifyError::InvalidKey)?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}
