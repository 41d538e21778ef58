//! Store abstractions the coordination layer depends on.
//!
//! Two collaborators sit behind traits so the primitives never touch a
//! concrete client:
//!
//! - [`EphemeralStore`] - remote key-value store with expiry and pattern pub/sub
//! - [`DeviceStore`] - document store holding device parameter trees
//!
//! In-memory deterministic backends live in [`inmemory`]. The Redis backend is
//! behind the `redis` cargo feature and the MongoDB device store behind
//! `mongodb`.

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod inmemory;
#[cfg(feature = "mongodb")]
pub mod mongo;
pub mod pattern;
#[cfg(feature = "redis")]
pub mod redis;

pub use inmemory::DeterministicDeviceStore;
pub use inmemory::DeterministicEphemeralStore;

/// Capacity of the channel between a backend and a [`PatternSubscription`].
pub const SUBSCRIPTION_BUFFER: usize = 1024;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EphemeralStoreError {
    #[error("ephemeral store unavailable: {reason}")]
    Unavailable { reason: String },
    #[error("operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },
    #[error("operation failed: {reason}")]
    Failed { reason: String },
    #[error("invalid subscription pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

/// A message delivered to a pattern subscription.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PubSubMessage {
    pub channel: String,
    pub payload: String,
}

/// Owned handle to a pattern subscription.
///
/// Messages arrive in publish order per channel. Dropping the handle ends the
/// subscription; the backend notices on its next delivery attempt.
#[derive(Debug)]
pub struct PatternSubscription {
    pattern: String,
    receiver: mpsc::Receiver<PubSubMessage>,
}

impl PatternSubscription {
    /// Create a subscription handle fed by `receiver`.
    pub fn new(pattern: impl Into<String>, receiver: mpsc::Receiver<PubSubMessage>) -> Self {
        Self {
            pattern: pattern.into(),
            receiver,
        }
    }

    /// The pattern this subscription was created with.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Wait for the next message. Returns `None` once the backend closed the
    /// subscription.
    pub async fn next(&mut self) -> Option<PubSubMessage> {
        self.receiver.recv().await
    }
}

/// Remote key-value store with per-key expiry and pattern pub/sub.
///
/// Implementations must make [`pop`](EphemeralStore::pop) atomic per key.
/// No other cross-operation atomicity is assumed by callers.
#[async_trait]
pub trait EphemeralStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, EphemeralStoreError>;

    /// Store `value` under `key`, expiring `ttl_secs` seconds from now.
    async fn set_with_expiry(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), EphemeralStoreError>;

    /// Delete `key`, returning how many entries were removed (0 or 1).
    async fn del(&self, key: &str) -> Result<u64, EphemeralStoreError>;

    /// Atomically read and delete `key`.
    async fn pop(&self, key: &str) -> Result<Option<String>, EphemeralStoreError>;

    /// Publish `message` on `channel`, returning the number of receivers.
    async fn publish(&self, channel: &str, message: &str) -> Result<u64, EphemeralStoreError>;

    /// Subscribe to every channel matching a glob-style `pattern`.
    async fn psubscribe(&self, pattern: &str) -> Result<PatternSubscription, EphemeralStoreError>;
}

#[async_trait]
impl<T: EphemeralStore + ?Sized> EphemeralStore for std::sync::Arc<T> {
    async fn get(&self, key: &str) -> Result<Option<String>, EphemeralStoreError> {
        (**self).get(key).await
    }

    async fn set_with_expiry(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), EphemeralStoreError> {
        (**self).set_with_expiry(key, value, ttl_secs).await
    }

    async fn del(&self, key: &str) -> Result<u64, EphemeralStoreError> {
        (**self).del(key).await
    }

    async fn pop(&self, key: &str) -> Result<Option<String>, EphemeralStoreError> {
        (**self).pop(key).await
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<u64, EphemeralStoreError> {
        (**self).publish(channel, message).await
    }

    async fn psubscribe(&self, pattern: &str) -> Result<PatternSubscription, EphemeralStoreError> {
        (**self).psubscribe(pattern).await
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DocumentStoreError {
    #[error("document store disconnected")]
    Disconnected,
    #[error("document store operation failed: {reason}")]
    Failed { reason: String },
}

/// Leaf holding the time a parameter was last written.
pub const TIMESTAMP_LEAF: &str = "_timestamp";

/// Conditional, non-creating update of one device record.
///
/// Paths are dotted (`Device.ManagementServer.URL._value`). The update matches
/// only when the record exists and every path in `required_fields` resolves.
///
/// A value set on a [`TIMESTAMP_LEAF`] is an integer of unix milliseconds.
/// Backends with a native date type store it as a date.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpdateRequest {
    pub device_id: String,
    pub required_fields: Vec<String>,
    pub set_fields: Vec<(String, serde_json::Value)>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateResult {
    /// True if a record matched the filter and was modified.
    pub matched: bool,
}

/// Document store holding full device records.
#[async_trait]
pub trait DeviceStore: Send + Sync {
    /// Apply `request` to an existing record. Never creates a record.
    async fn update_if_exists(&self, request: UpdateRequest) -> Result<UpdateResult, DocumentStoreError>;

    /// Close the connection. Later operations fail with
    /// [`DocumentStoreError::Disconnected`].
    async fn disconnect(&self) -> Result<(), DocumentStoreError>;
}

#[async_trait]
impl<T: DeviceStore + ?Sized> DeviceStore for std::sync::Arc<T> {
    async fn update_if_exists(&self, request: UpdateRequest) -> Result<UpdateResult, DocumentStoreError> {
        (**self).update_if_exists(request).await
    }

    async fn disconnect(&self) -> Result<(), DocumentStoreError> {
        (**self).disconnect().await
    }
}
