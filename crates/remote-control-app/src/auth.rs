//! Session access tokens.
//!
//! Tokens are 256-bit random values issued once per session launch; a
//! restart always issues a fresh one. Comparison is constant-time and the
//! raw value never reaches the logs when masking is on.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// A token value with its absolute expiry.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub value: String,
    pub expires_at: DateTime<Utc>,
}

/// Generate a fresh URL-safe token.
pub fn new_token() -> String {
    let mut buf = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut buf);
    URL_SAFE_NO_PAD.encode(buf)
}

/// Generate a token expiring `ttl` from now. A zero TTL falls back to one
/// hour.
pub fn new_token_with_ttl(ttl: std::time::Duration) -> IssuedToken {
    let ttl = if ttl.is_zero() {
        Duration::hours(1)
    } else {
        Duration::from_std(ttl).unwrap_or_else(|_| Duration::hours(1))
    };
    IssuedToken {
        value: new_token(),
        expires_at: Utc::now() + ttl,
    }
}

/// Expiry check: `None` never expires, otherwise expired once `now` reaches
/// the deadline.
pub fn is_expired(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match expires_at {
        None => false,
        Some(deadline) => now >= deadline,
    }
}

/// Constant-time token comparison. Length differences short-circuit inside
/// `subtle` without leaking position information.
pub fn verify(candidate: &str, expected: &str) -> bool {
    candidate.as_bytes().ct_eq(expected.as_bytes()).into()
}

/// Stable fingerprint of a token for log lines.
pub fn fingerprint(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    format!("sha256:{}", &hex[..12])
}

/// Token as it may appear in output: masked to a fingerprint unless masking
/// is disabled.
pub fn display_token(token: &str, masked: bool) -> String {
    if masked {
        fingerprint(token)
    } else {
        token.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_unique_and_url_safe() {
        let a = new_token();
        let b = new_token();
        assert_ne!(a, b);
        assert!(a.len() >= 40);
        assert!(a
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn ttl_zero_falls_back_to_an_hour() {
        let issued = new_token_with_ttl(std::time::Duration::ZERO);
        let remaining = issued.expires_at - Utc::now();
        assert!(remaining > Duration::minutes(59));
        assert!(remaining <= Duration::minutes(61));
    }

    #[test]
    fn expiry_boundary_is_inclusive() {
        let now = Utc::now();
        assert!(!is_expired(None, now));
        assert!(!is_expired(Some(now + Duration::seconds(1)), now));
        assert!(is_expired(Some(now), now));
        assert!(is_expired(Some(now - Duration::seconds(1)), now));
    }

    #[test]
    fn verify_matches_exactly() {
        assert!(verify("abc", "abc"));
        assert!(!verify("abc", "abd"));
        assert!(!verify("abc", "abcd"));
        assert!(!verify("", "abc"));
        assert!(verify("", ""));
    }

    #[test]
    fn fingerprint_is_stable_and_short() {
        let fp = fingerprint("secret-token");
        assert_eq!(fp, fingerprint("secret-token"));
        assert!(fp.starts_with("sha256:"));
        assert_eq!(fp.len(), "sha256:".len() + 12);
        assert_ne!(fp, fingerprint("other-token"));
    }

    #[test]
    fn display_token_masks_only_when_asked() {
        assert_eq!(display_token("tok", false), "tok");
        assert!(display_token("tok", true).starts_with("sha256:"));
    }
}
