//! In-memory implementations of EphemeralStore and DeviceStore for testing.
//!
//! Provides deterministic, non-persistent implementations of the store traits
//! for unit tests, integration tests, and single-process runs. They mirror the
//! observable behavior of the production backends without network I/O.
//!
//! Expiry is tracked against the tokio clock, so tests running with
//! `#[tokio::test(start_paused = true)]` can advance time explicitly.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Map;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tracing::warn;

use super::DeviceStore;
use super::DocumentStoreError;
use super::EphemeralStore;
use super::EphemeralStoreError;
use super::PatternSubscription;
use super::PubSubMessage;
use super::SUBSCRIPTION_BUFFER;
use super::UpdateRequest;
use super::UpdateResult;
use super::pattern::ChannelPattern;

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at: Instant,
}

#[derive(Debug)]
struct Subscriber {
    pattern: ChannelPattern,
    sender: mpsc::Sender<PubSubMessage>,
}

/// In-memory deterministic implementation of [`EphemeralStore`].
///
/// # Limitations
///
/// - No persistence across restarts
/// - Single process only; "multiple workers" are simulated by sharing one
///   `Arc` between several clients
/// - Expired entries are reaped lazily on access
///
/// # Example
///
/// ```ignore
/// use cwmp_coord::api::{DeterministicEphemeralStore, EphemeralStore};
///
/// let store = DeterministicEphemeralStore::new();
/// store.set_with_expiry("session", "abc", 30).await?;
/// assert_eq!(store.get("session").await?, Some("abc".to_string()));
/// ```
#[derive(Debug, Default)]
pub struct DeterministicEphemeralStore {
    entries: Mutex<HashMap<String, StoredValue>>,
    subscribers: Mutex<Vec<Subscriber>>,
    unavailable: AtomicBool,
}

impl DeterministicEphemeralStore {
    /// Create a new, empty, available store.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Toggle availability. While unavailable every operation fails with
    /// [`EphemeralStoreError::Unavailable`], mimicking a lost connection.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Remaining lifetime of `key`, or `None` if it is missing or expired.
    pub async fn time_to_live(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let entries = self.entries.lock().await;
        entries
            .get(key)
            .filter(|stored| stored.expires_at > now)
            .map(|stored| stored.expires_at - now)
    }

    /// Number of live (unexpired) entries.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.lock().await.values().filter(|stored| stored.expires_at > now).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Number of open pattern subscriptions.
    pub async fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock().await;
        subscribers.retain(|sub| !sub.sender.is_closed());
        subscribers.len()
    }

    fn check_available(&self) -> Result<(), EphemeralStoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(EphemeralStoreError::Unavailable {
                reason: "connection closed".to_string(),
            });
        }
        Ok(())
    }

    /// Remove `key` if present and unexpired, returning its value.
    fn take_live(entries: &mut HashMap<String, StoredValue>, key: &str) -> Option<String> {
        let stored = entries.remove(key)?;
        (stored.expires_at > Instant::now()).then_some(stored.value)
    }
}

#[async_trait]
impl EphemeralStore for DeterministicEphemeralStore {
    async fn get(&self, key: &str) -> Result<Option<String>, EphemeralStoreError> {
        self.check_available()?;
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(stored) if stored.expires_at > Instant::now() => Ok(Some(stored.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_with_expiry(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), EphemeralStoreError> {
        self.check_available()?;
        let expires_at = Instant::now() + Duration::from_secs(ttl_secs);
        self.entries.lock().await.insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<u64, EphemeralStoreError> {
        self.check_available()?;
        let mut entries = self.entries.lock().await;
        Ok(u64::from(Self::take_live(&mut entries, key).is_some()))
    }

    async fn pop(&self, key: &str) -> Result<Option<String>, EphemeralStoreError> {
        self.check_available()?;
        let mut entries = self.entries.lock().await;
        Ok(Self::take_live(&mut entries, key))
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<u64, EphemeralStoreError> {
        self.check_available()?;
        let mut subscribers = self.subscribers.lock().await;
        subscribers.retain(|sub| !sub.sender.is_closed());

        let mut delivered = 0;
        for sub in subscribers.iter().filter(|sub| sub.pattern.matches(channel)) {
            let msg = PubSubMessage {
                channel: channel.to_string(),
                payload: message.to_string(),
            };
            match sub.sender.try_send(msg) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(pattern = %sub.pattern, channel, "subscriber buffer full, dropping message");
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }
        Ok(delivered)
    }

    async fn psubscribe(&self, pattern: &str) -> Result<PatternSubscription, EphemeralStoreError> {
        self.check_available()?;
        let parsed = ChannelPattern::new(pattern)?;
        let (sender, receiver) = mpsc::channel(SUBSCRIPTION_BUFFER);
        self.subscribers.lock().await.push(Subscriber { pattern: parsed, sender });
        Ok(PatternSubscription::new(pattern, receiver))
    }
}

/// In-memory deterministic implementation of [`DeviceStore`].
///
/// Records are JSON parameter trees keyed by device id. Dotted field paths
/// navigate nested objects, so `A.B._value` addresses `{"A": {"B": {"_value": ..}}}`.
/// Updates are applied to a copy and swapped in, so a failed update leaves the
/// record untouched.
#[derive(Debug, Default)]
pub struct DeterministicDeviceStore {
    records: Mutex<HashMap<String, Value>>,
    disconnected: AtomicBool,
}

impl DeterministicDeviceStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Insert or replace a full record, as the protocol engine would.
    pub async fn insert_device(&self, device_id: impl Into<String>, record: Value) {
        self.records.lock().await.insert(device_id.into(), record);
    }

    /// Snapshot of a record.
    pub async fn device(&self, device_id: &str) -> Option<Value> {
        self.records.lock().await.get(device_id).cloned()
    }

    pub async fn device_count(&self) -> usize {
        self.records.lock().await.len()
    }

    pub fn is_connected(&self) -> bool {
        !self.disconnected.load(Ordering::SeqCst)
    }

    fn resolve<'a>(record: &'a Value, path: &str) -> Option<&'a Value> {
        path.split('.').try_fold(record, |node, segment| node.as_object()?.get(segment))
    }

    fn assign(record: &mut Value, path: &str, value: Value) -> Result<(), DocumentStoreError> {
        let segments: Vec<&str> = path.split('.').collect();
        let Some((leaf, parents)) = segments.split_last() else {
            return Err(DocumentStoreError::Failed {
                reason: "empty field path".to_string(),
            });
        };

        let mut node = record;
        for segment in parents {
            let object = node.as_object_mut().ok_or_else(|| DocumentStoreError::Failed {
                reason: format!("cannot create field '{path}': '{segment}' has a non-object parent"),
            })?;
            node = object.entry(segment.to_string()).or_insert_with(|| Value::Object(Map::new()));
        }

        let object = node.as_object_mut().ok_or_else(|| DocumentStoreError::Failed {
            reason: format!("cannot create field '{path}': parent is not an object"),
        })?;
        object.insert(leaf.to_string(), value);
        Ok(())
    }
}

#[async_trait]
impl DeviceStore for DeterministicDeviceStore {
    async fn update_if_exists(&self, request: UpdateRequest) -> Result<UpdateResult, DocumentStoreError> {
        if !self.is_connected() {
            return Err(DocumentStoreError::Disconnected);
        }

        let mut records = self.records.lock().await;
        let Some(record) = records.get_mut(&request.device_id) else {
            return Ok(UpdateResult { matched: false });
        };

        if !request.required_fields.iter().all(|path| Self::resolve(record, path).is_some()) {
            return Ok(UpdateResult { matched: false });
        }

        let mut updated = record.clone();
        for (path, value) in request.set_fields {
            Self::assign(&mut updated, &path, value)?;
        }
        *record = updated;
        Ok(UpdateResult { matched: true })
    }

    async fn disconnect(&self) -> Result<(), DocumentStoreError> {
        self.disconnected.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_after_ttl() {
        let store = DeterministicEphemeralStore::new();
        store.set_with_expiry("k", "v", 2).await.unwrap();

        tokio::time::advance(Duration::from_millis(1999)).await;
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));

        tokio::time::advance(Duration::from_millis(2)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert_eq!(store.del("k").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_del_reports_removed_count() {
        let store = DeterministicEphemeralStore::new();
        store.set_with_expiry("k", "v", 10).await.unwrap();
        assert_eq!(store.del("k").await.unwrap(), 1);
        assert_eq!(store.del("k").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_every_operation() {
        let store = DeterministicEphemeralStore::new();
        store.set_available(false);
        assert!(matches!(store.get("k").await, Err(EphemeralStoreError::Unavailable { .. })));
        assert!(matches!(store.set_with_expiry("k", "v", 1).await, Err(EphemeralStoreError::Unavailable { .. })));
        assert!(matches!(store.publish("c", "m").await, Err(EphemeralStoreError::Unavailable { .. })));

        store.set_available(true);
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_publish_reaches_matching_subscribers_only() {
        let store = DeterministicEphemeralStore::new();
        let mut informs = store.psubscribe("inform:*").await.unwrap();
        let mut other = store.psubscribe("diag:*").await.unwrap();

        assert_eq!(store.publish("inform:dev-1", "hello").await.unwrap(), 1);

        let msg = informs.next().await.unwrap();
        assert_eq!(msg.channel, "inform:dev-1");
        assert_eq!(msg.payload, "hello");
        assert!(other.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_pruned() {
        let store = DeterministicEphemeralStore::new();
        let sub = store.psubscribe("a:*").await.unwrap();
        assert_eq!(store.subscriber_count().await, 1);
        drop(sub);
        assert_eq!(store.publish("a:1", "x").await.unwrap(), 0);
        assert_eq!(store.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn test_update_requires_existing_record() {
        let store = DeterministicDeviceStore::new();
        let result = store
            .update_if_exists(UpdateRequest {
                device_id: "missing".into(),
                required_fields: vec![],
                set_fields: vec![("A._value".into(), json!("1"))],
            })
            .await
            .unwrap();
        assert!(!result.matched);
        assert_eq!(store.device_count().await, 0);
    }

    #[tokio::test]
    async fn test_update_gated_on_required_fields() {
        let store = DeterministicDeviceStore::new();
        store.insert_device("dev", json!({"A": {"B": {"_value": "old"}}})).await;

        let gated = store
            .update_if_exists(UpdateRequest {
                device_id: "dev".into(),
                required_fields: vec!["A.B._value".into(), "A.B._type".into()],
                set_fields: vec![("A.B._value".into(), json!("new"))],
            })
            .await
            .unwrap();
        assert!(!gated.matched);
        assert_eq!(store.device("dev").await.unwrap()["A"]["B"]["_value"], "old");

        let applied = store
            .update_if_exists(UpdateRequest {
                device_id: "dev".into(),
                required_fields: vec!["A.B._value".into()],
                set_fields: vec![
                    ("A.B._value".into(), json!("new")),
                    ("A.C._value".into(), json!("created")),
                ],
            })
            .await
            .unwrap();
        assert!(applied.matched);
        let record = store.device("dev").await.unwrap();
        assert_eq!(record["A"]["B"]["_value"], "new");
        assert_eq!(record["A"]["C"]["_value"], "created");
    }

    #[tokio::test]
    async fn test_failed_assignment_leaves_record_untouched() {
        let store = DeterministicDeviceStore::new();
        store.insert_device("dev", json!({"A": "scalar", "B": {"_value": "keep"}})).await;

        let result = store
            .update_if_exists(UpdateRequest {
                device_id: "dev".into(),
                required_fields: vec![],
                set_fields: vec![("B._value".into(), json!("changed")), ("A.X._value".into(), json!(1))],
            })
            .await;
        assert!(matches!(result, Err(DocumentStoreError::Failed { .. })));
        assert_eq!(store.device("dev").await.unwrap()["B"]["_value"], "keep");
    }

    #[tokio::test]
    async fn test_disconnected_store_rejects_updates() {
        let store = DeterministicDeviceStore::new();
        store.disconnect().await.unwrap();
        let result = store
            .update_if_exists(UpdateRequest {
                device_id: "dev".into(),
                required_fields: vec![],
                set_fields: vec![],
            })
            .await;
        assert_eq!(result, Err(DocumentStoreError::Disconnected));
    }
}
