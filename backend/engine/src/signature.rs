//! HMAC-SHA256 verification of webhook bodies.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the hex digest of the raw body.
pub const SIGNATURE_HEADER: &str = "x-provider-signature";

/// Outcome of checking a delivery against the configured secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    Valid,
    Invalid,
    /// No secret configured; the delivery was not checked.
    Unchecked,
}

#[derive(Clone)]
pub struct SignatureVerifier {
    secret: Option<String>,
}

impl SignatureVerifier {
    pub fn new(secret: Option<String>) -> Self {
        Self { secret }
    }

    pub fn verify(&self, body: &[u8], signature: Option<&str>) -> Verification {
        let Some(secret) = self.secret.as_deref() else {
            return Verification::Unchecked;
        };
        let Some(signature) = signature.map(str::trim).filter(|s| !s.is_empty()) else {
            return Verification::Invalid;
        };
        let Ok(expected) = hex::decode(signature) else {
            return Verification::Invalid;
        };

        let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
            Ok(mac) => mac,
            Err(_) => return Verification::Invalid,
        };
        mac.update(body);
        // `verify_slice` compares in constant time.
        match mac.verify_slice(&expected) {
            Ok(()) => Verification::Valid,
            Err(_) => Verification::Invalid,
        }
    }
}

/// Hex HMAC-SHA256 of `body`, as a provider would send it.
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}
