//! Keyed string cache with bounded lifetime.
//!
//! A thin layer over [`EphemeralStore`] that pads every expiry with the
//! clock-skew tolerance. No state is kept locally: each call is a round-trip
//! to the store, and store failures propagate unchanged. Retrying is the
//! caller's decision.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::api::EphemeralStore;
use crate::api::EphemeralStoreError;
use crate::coordination::types::CLOCK_SKEW_TOLERANCE;

/// Configuration for the TTL cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
    /// TTL applied when `set` is called without one, in seconds.
    pub max_ttl_secs: u64,
    /// Margin added to every expiry, in milliseconds.
    pub clock_skew_tolerance_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_ttl_secs: 86_400,
            clock_skew_tolerance_ms: CLOCK_SKEW_TOLERANCE.as_millis() as u64,
        }
    }
}

impl CacheConfig {
    pub fn clock_skew_tolerance(&self) -> Duration {
        Duration::from_millis(self.clock_skew_tolerance_ms)
    }
}

pub struct TtlCache<S: EphemeralStore + ?Sized> {
    store: Arc<S>,
    config: CacheConfig,
}

impl<S: EphemeralStore + ?Sized> Clone for TtlCache<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S: EphemeralStore + ?Sized> TtlCache<S> {
    pub fn new(store: Arc<S>, config: CacheConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Expiry actually sent to the store for a requested TTL.
    pub fn effective_ttl_secs(&self, ttl_secs: u64) -> u64 {
        ttl_secs.saturating_add(self.config.clock_skew_tolerance_ms.div_ceil(1000))
    }

    /// Current value of `key`, or `None` if missing or expired.
    pub async fn get(&self, key: &str) -> Result<Option<String>, EphemeralStoreError> {
        self.store.get(key).await
    }

    /// Store `value` for `ttl_secs` (default [`CacheConfig::max_ttl_secs`])
    /// plus the clock-skew tolerance.
    pub async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<(), EphemeralStoreError> {
        let ttl_secs = ttl_secs.unwrap_or(self.config.max_ttl_secs);
        self.store.set_with_expiry(key, value, self.effective_ttl_secs(ttl_secs)).await
    }

    /// Remove `key`. Removing a missing key is not an error.
    pub async fn del(&self, key: &str) -> Result<(), EphemeralStoreError> {
        self.store.del(key).await?;
        Ok(())
    }

    /// Read and remove `key` in one store operation.
    pub async fn pop(&self, key: &str) -> Result<Option<String>, EphemeralStoreError> {
        self.store.pop(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::DeterministicEphemeralStore;

    #[test]
    fn test_effective_ttl_adds_tolerance() {
        let cache = TtlCache::new(DeterministicEphemeralStore::new(), CacheConfig::default());
        assert_eq!(cache.effective_ttl_secs(1), 31);
        assert_eq!(cache.effective_ttl_secs(0), 30);
        assert_eq!(cache.effective_ttl_secs(u64::MAX), u64::MAX);
    }

    #[test]
    fn test_partial_second_tolerance_rounds_up() {
        let config = CacheConfig {
            clock_skew_tolerance_ms: 1500,
            ..Default::default()
        };
        let cache = TtlCache::new(DeterministicEphemeralStore::new(), config);
        assert_eq!(cache.effective_ttl_secs(1), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_without_ttl_uses_max_ttl() {
        let store = DeterministicEphemeralStore::new();
        let config = CacheConfig {
            max_ttl_secs: 60,
            clock_skew_tolerance_ms: 0,
        };
        let cache = TtlCache::new(store.clone(), config);
        cache.set("k", "v", None).await.unwrap();
        assert_eq!(store.time_to_live("k").await, Some(Duration::from_secs(60)));
    }
}
