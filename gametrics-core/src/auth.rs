//! Request authentication
//!
//! Every upload is signed by hashing the JSON body concatenated with the
//! per-game secret key; the hex digest travels in the `Authorization`
//! header. The collector recomputes it server-side, so the signature must
//! be byte-stable: sign exactly the string that goes on the wire.
//!
//! The digest is computed in-process and cannot fail, so there is no
//! degraded "send unsigned" path: an unsigned request would be rejected by
//! the server anyway.

use sha2::{Digest, Sha256};

/// Sign a request body with the shared secret.
///
/// Returns the lowercase hex SHA-256 digest of `payload || secret`.
pub fn sign(payload: &str, secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.as_bytes());
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_deterministic() {
        let a = sign(r#"[{"value":1.0}]"#, "secret");
        let b = sign(r#"[{"value":1.0}]"#, "secret");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_sign_payload_sensitivity() {
        assert_ne!(sign("a", "secret"), sign("b", "secret"));
    }

    #[test]
    fn test_sign_secret_sensitivity() {
        assert_ne!(sign("payload", "s1"), sign("payload", "s2"));
    }

    #[test]
    fn test_sign_concatenation_order() {
        // payload || secret, not secret || payload
        assert_ne!(sign("ab", "c"), sign("c", "ab"));
        // and no separator: ("a","bc") hashes the same bytes as ("ab","c")
        assert_eq!(sign("a", "bc"), sign("ab", "c"));
    }
}
