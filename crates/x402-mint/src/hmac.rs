//! HMAC-SHA256 signatures for outbound settlement events.
//!
//! Receivers recompute the MAC over the raw request body with the shared
//! secret and compare it to the `X-Signature` header.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the hex MAC of an event body.
pub const SIGNATURE_HEADER: &str = "X-Signature";

fn keyed(secret: &[u8]) -> HmacSha256 {
    // HMAC is defined for keys of any length; new_from_slice cannot fail.
    match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => unreachable!("HMAC accepts any key length"),
    }
}

/// Hex-encoded HMAC-SHA256 of `body` under `secret`.
pub fn sign_body(secret: &[u8], body: &[u8]) -> String {
    let mut mac = keyed(secret);
    mac.update(body);
    alloy::hex::encode(mac.finalize().into_bytes())
}

/// Check a hex signature produced by [`sign_body`].
///
/// The comparison is constant-time; malformed hex is compared as zeros so
/// it takes the same path as a wrong MAC.
pub fn verify_body(secret: &[u8], body: &[u8], signature: &str) -> bool {
    let mut mac = keyed(secret);
    mac.update(body);
    let claimed = alloy::hex::decode(signature.trim_start_matches("0x"))
        .unwrap_or_else(|_| vec![0u8; 32]);
    mac.verify_slice(&claimed).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_verifies() {
        let body = br#"{"event":"mint_confirmed"}"#;
        let sig = sign_body(b"telemetry-secret", body);
        assert_eq!(sig.len(), 64);
        assert!(verify_body(b"telemetry-secret", body, &sig));
    }

    #[test]
    fn test_wrong_secret_or_body_fails() {
        let sig = sign_body(b"secret-1", b"original");
        assert!(!verify_body(b"secret-2", b"original", &sig));
        assert!(!verify_body(b"secret-1", b"tampered", &sig));
    }

    #[test]
    fn test_malformed_hex_fails() {
        assert!(!verify_body(b"secret", b"body", "not-hex-zz"));
    }
}
