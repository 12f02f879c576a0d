use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_PREFIX: &str = "sha256=";

/// Compute the `sha256=<hex>` signature GitHub sends in `X-Hub-Signature-256`.
pub fn compute_signature(body: &[u8], secret: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(body);
    format!("{SIGNATURE_PREFIX}{}", hex::encode(mac.finalize().into_bytes()))
}

/// Verify a GitHub-style HMAC signature against `secret`.
///
/// An empty secret means unauthenticated mode: every delivery verifies,
/// whatever signature it carries.
///
/// The digest comparison is done by [`Mac::verify_slice`], which is constant
/// time over the digest bytes. A header that is not `sha256=<hex>` or whose
/// digest is not 32 bytes fails without inspecting the content.
pub fn verify(body: &[u8], provided_signature: &str, secret: &str) -> bool {
    if secret.is_empty() {
        return true;
    }

    let Some(digest_hex) = provided_signature.strip_prefix(SIGNATURE_PREFIX) else {
        return false;
    };
    let Ok(digest) = hex::decode(digest_hex) else {
        return false;
    };

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(m) => m,
        Err(_) => return false,
    };
    mac.update(body);
    mac.verify_slice(&digest).is_ok()
}
