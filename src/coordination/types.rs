//! Shared types for coordination primitives.

use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use serde::Serialize;

/// Margin added to every cache and lease expiry.
///
/// A host whose clock runs ahead of the store must never see an entry expire
/// early, so entries live this much longer than requested.
pub const CLOCK_SKEW_TOLERANCE: Duration = Duration::from_secs(30);

/// Length of randomly generated lock tokens.
pub const LOCK_TOKEN_LEN: usize = 11;

const TOKEN_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Opaque proof of lock ownership.
///
/// Ownership is decided by value equality alone: any caller presenting the
/// same token is treated as the same owner.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockToken(String);

impl LockToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Generate a random base-36 token.
    pub fn random() -> Self {
        let mut rng = rand::rng();
        let value = (0..LOCK_TOKEN_LEN)
            .map(|_| TOKEN_ALPHABET[rng.random_range(0..TOKEN_ALPHABET.len())] as char)
            .collect();
        Self(value)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for LockToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for LockToken {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Convert a lease to whole seconds, rounding up.
pub fn lease_to_ttl_secs(lease: Duration) -> u64 {
    lease.as_millis().div_ceil(1000) as u64
}

/// Get current Unix timestamp in milliseconds.
///
/// Returns 0 if system time is before UNIX epoch instead of panicking.
#[inline]
pub fn now_unix_ms() -> u64 {
    use std::time::SystemTime;
    use std::time::UNIX_EPOCH;
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
