//! Distributed lock with lease expiry.
//!
//! Provides best-effort mutual exclusion across worker processes with:
//! - Opaque per-attempt tokens; ownership is token equality
//! - Re-entrant acquisition by the same token (refreshes the lease)
//! - TTL-based automatic expiration for crash recovery
//! - Randomized backoff between polls to spread contention across workers
//!
//! Acquisition reads the holder and then writes it in a second round-trip.
//! Two callers that both observe a free lock in that window can both
//! believe they won. The guarantee is "very likely sole owner", not
//! linearizable exclusion.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;
use tracing::warn;

use crate::api::EphemeralStore;
use crate::coordination::cache::CacheConfig;
use crate::coordination::cache::TtlCache;
use crate::coordination::error::CoordinationError;
use crate::coordination::error::LeaseExpiredSnafu;
use crate::coordination::types::LockToken;
use crate::coordination::types::lease_to_ttl_secs;

/// Configuration for lock polling.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LockConfig {
    /// Fixed part of the wait between polls, in milliseconds.
    pub backoff_base_ms: u64,
    /// Upper bound of the random part added to each wait, in milliseconds.
    pub backoff_jitter_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            backoff_base_ms: 50,
            backoff_jitter_ms: 50,
        }
    }
}

/// Named leases over an [`EphemeralStore`].
///
/// Lock state lives entirely in the store as `name -> token` with expiry
/// `lease + clock-skew tolerance`; a missing entry means the lock is free.
pub struct LockManager<S: EphemeralStore + ?Sized> {
    store: Arc<S>,
    cache: TtlCache<S>,
    config: LockConfig,
}

impl<S: EphemeralStore + ?Sized> Clone for LockManager<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            cache: self.cache.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S: EphemeralStore + ?Sized> LockManager<S> {
    pub fn new(store: Arc<S>, cache_config: CacheConfig, config: LockConfig) -> Self {
        Self {
            cache: TtlCache::new(store.clone(), cache_config),
            store,
            config,
        }
    }

    /// Acquire `name` with a fresh random token.
    ///
    /// See [`acquire_lock_with_token`](Self::acquire_lock_with_token).
    pub async fn acquire_lock(
        &self,
        name: &str,
        lease: Duration,
        timeout: Duration,
    ) -> Result<Option<LockToken>, CoordinationError> {
        self.acquire_lock_with_token(name, lease, timeout, LockToken::random()).await
    }

    /// Try to become the holder of `name`.
    ///
    /// Returns the token on success and `None` when the lock stayed held by
    /// another token for the whole `timeout`. A zero timeout probes once
    /// without sleeping. Presenting the current holder's token succeeds
    /// immediately and refreshes the lease.
    pub async fn acquire_lock_with_token(
        &self,
        name: &str,
        lease: Duration,
        timeout: Duration,
        token: LockToken,
    ) -> Result<Option<LockToken>, CoordinationError> {
        let mut remaining = timeout;
        let mut current = self.cache.get(name).await?;

        while let Some(holder) = current.as_deref() {
            if holder == token.as_str() {
                break;
            }
            if remaining.is_zero() {
                debug!(lock = name, holder, "lock held, giving up");
                return Ok(None);
            }

            let started = Instant::now();
            let wait = self.backoff();
            debug!(lock = name, holder, wait_ms = wait.as_millis() as u64, "lock held, backing off");
            tokio::time::sleep(wait).await;
            current = self.cache.get(name).await?;
            remaining = remaining.saturating_sub(started.elapsed());
        }

        self.cache.set(name, token.as_str(), Some(lease_to_ttl_secs(lease))).await?;
        debug!(lock = name, token = %token, lease_ms = lease.as_millis() as u64, "lock acquired");
        Ok(Some(token))
    }

    /// Release `name` if `token` still holds it.
    ///
    /// A lock held by someone else, or no longer held at all, is left alone
    /// with a warning. [`CoordinationError::LeaseExpired`] means the entry
    /// vanished between the ownership check and the delete.
    pub async fn release_lock(&self, name: &str, token: &LockToken) -> Result<(), CoordinationError> {
        let current = self.cache.get(name).await?;
        if current.as_deref() != Some(token.as_str()) {
            warn!(lock = name, token = %token, "lock unexistent or not owned");
            return Ok(());
        }

        let removed = self.store.del(name).await?;
        if removed < 1 {
            return LeaseExpiredSnafu { name }.fail();
        }
        debug!(lock = name, token = %token, "lock released");
        Ok(())
    }

    /// Whether anyone currently holds `name`.
    pub async fn lock_exists(&self, name: &str) -> Result<bool, CoordinationError> {
        Ok(self.cache.get(name).await?.is_some())
    }

    /// Run `f` while holding `name`.
    ///
    /// Returns `Ok(None)` without running `f` when the lock could not be
    /// acquired within `timeout`. The lock is released whether `f` succeeds
    /// or fails; an error from `f` takes precedence over a release error.
    pub async fn with_lock<F, Fut, T, E>(
        &self,
        name: &str,
        lease: Duration,
        timeout: Duration,
        f: F,
    ) -> Result<Option<T>, E>
    where
        F: FnOnce(LockToken) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CoordinationError>,
    {
        let Some(token) = self.acquire_lock(name, lease, timeout).await? else {
            return Ok(None);
        };

        let result = f(token.clone()).await;
        let released = self.release_lock(name, &token).await;

        match (result, released) {
            (Ok(value), Ok(())) => Ok(Some(value)),
            (Ok(_), Err(release_err)) => Err(release_err.into()),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(release_err)) => {
                warn!(lock = name, error = %release_err, "lock release failed after critical section error");
                Err(err)
            }
        }
    }

    fn backoff(&self) -> Duration {
        let jitter = rand::rng().random_range(0..=self.config.backoff_jitter_ms);
        Duration::from_millis(self.config.backoff_base_ms.saturating_add(jitter))
    }
}
