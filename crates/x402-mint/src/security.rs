//! Secret comparison for operator endpoints.

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Constant-time byte comparison that does not leak input lengths or content.
///
/// Both inputs are hashed to fixed-length SHA-256 digests before comparison,
/// so timing reveals neither the content nor the length of either input.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let ha = Sha256::digest(a);
    let hb = Sha256::digest(b);
    ha.ct_eq(&hb).into()
}

/// Check an `Authorization` header value against a bearer token.
///
/// A missing header, a different scheme, or an empty presented token never
/// matches.
pub fn bearer_matches(header: Option<&str>, expected: &[u8]) -> bool {
    let Some(presented) = header.and_then(|h| h.strip_prefix("Bearer ")) else {
        return false;
    };
    let presented = presented.trim();
    !presented.is_empty() && constant_time_eq(presented.as_bytes(), expected)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"hello", b"hello"));
        assert!(!constant_time_eq(b"hello", b"world"));
        assert!(!constant_time_eq(b"short", b"much longer string"));
    }

    #[test]
    fn test_bearer_matches() {
        assert!(bearer_matches(Some("Bearer s3cret"), b"s3cret"));
        assert!(!bearer_matches(Some("Bearer wrong"), b"s3cret"));
        assert!(!bearer_matches(Some("Basic s3cret"), b"s3cret"));
        assert!(!bearer_matches(Some("Bearer "), b""));
        assert!(!bearer_matches(None, b"s3cret"));
    }
}
