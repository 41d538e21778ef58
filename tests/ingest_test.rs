//! End-to-end inform ingestion over the deterministic stores.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cwmp_coord::api::DeterministicDeviceStore;
use cwmp_coord::api::DeterministicEphemeralStore;
use cwmp_coord::api::DeviceStore;
use cwmp_coord::api::DocumentStoreError;
use cwmp_coord::api::EphemeralStore;
use cwmp_coord::api::EphemeralStoreError;
use cwmp_coord::api::PatternSubscription;
use cwmp_coord::api::PubSubMessage;
use cwmp_coord::api::UpdateRequest;
use cwmp_coord::api::UpdateResult;
use cwmp_coord::ingest::EventIngestor;
use cwmp_coord::ingest::ExistenceGate;
use cwmp_coord::ingest::IngestConfig;
use cwmp_coord::ingest::IngestError;
use cwmp_coord::ingest::IngestOutcome;
use cwmp_coord::ingest::IngestPolicy;
use serde_json::Value;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const CHANNEL: &str = "speed069:inform_notiff:dev-1";

type Ingestor = EventIngestor<DeterministicEphemeralStore, DeterministicDeviceStore>;

fn inform(device_id: &str, params: &[(&str, Value)]) -> String {
    let parameter_list: Vec<Value> = params
        .iter()
        .map(|(name, value)| json!({"name": name, "type": "xsd:string", "value": value}))
        .collect();
    json!({
        "acs_id": device_id,
        "body": {
            "eventCodes": ["4 VALUE CHANGE"],
            "parameterList": parameter_list,
            "type": "cwmp:Inform"
        }
    })
    .to_string()
}

fn leaf(value: &str) -> Value {
    json!({"_value": value, "_type": "xsd:string", "_timestamp": 1})
}

async fn setup(
    policy: IngestPolicy,
) -> (Arc<DeterministicEphemeralStore>, Arc<DeterministicDeviceStore>, Arc<Ingestor>) {
    let events = DeterministicEphemeralStore::new();
    let devices = DeterministicDeviceStore::new();
    let record = json!({"Device": {"WiFi": {"SSID": leaf("old")}, "DeviceInfo": {"Uptime": leaf("10")}}});
    devices.insert_device("dev-1", record).await;
    let config = IngestConfig {
        subscribe_delay_ms: 0,
        policy,
        ..Default::default()
    };
    let ingestor = Arc::new(EventIngestor::new(events.clone(), devices.clone(), config));
    (events, devices, ingestor)
}

fn message(channel: &str, payload: String) -> PubSubMessage {
    PubSubMessage {
        channel: channel.to_string(),
        payload,
    }
}

async fn ssid(devices: &DeterministicDeviceStore) -> Value {
    devices.device("dev-1").await.unwrap()["Device"]["WiFi"]["SSID"]["_value"].clone()
}

#[tokio::test]
async fn test_applies_known_parameters() {
    let (_events, devices, ingestor) = setup(IngestPolicy::default()).await;

    let outcome = ingestor
        .handle_message(&message(CHANNEL, inform("dev-1", &[("Device.WiFi.SSID", json!("home"))])))
        .await
        .unwrap();
    assert_eq!(outcome, IngestOutcome::Applied { parameters: 1 });

    let record = devices.device("dev-1").await.unwrap();
    let ssid = &record["Device"]["WiFi"]["SSID"];
    assert_eq!(ssid["_value"], json!("home"));
    assert_eq!(ssid["_type"], json!("xsd:string"));
    assert!(ssid["_timestamp"].as_u64().unwrap() > 1);
    assert_eq!(record["Device"]["DeviceInfo"]["Uptime"]["_value"], json!("10"));
}

#[tokio::test]
async fn test_unknown_device_is_not_created() {
    let (_events, devices, ingestor) = setup(IngestPolicy::default()).await;

    let outcome = ingestor
        .handle_message(&message(
            "speed069:inform_notiff:ghost",
            inform("ghost", &[("Device.WiFi.SSID", json!("x"))]),
        ))
        .await
        .unwrap();
    assert_eq!(outcome, IngestOutcome::NoMatch);
    assert!(devices.device("ghost").await.is_none());
    assert_eq!(devices.device_count().await, 1);
}

#[tokio::test]
async fn test_missing_leaf_blocks_whole_event() {
    let (_events, devices, ingestor) = setup(IngestPolicy::default()).await;

    let payload = inform("dev-1", &[("Device.WiFi.SSID", json!("home")), ("Device.Unknown.Param", json!("x"))]);
    let outcome = ingestor.handle_message(&message(CHANNEL, payload)).await.unwrap();
    assert_eq!(outcome, IngestOutcome::NoMatch);
    assert_eq!(ssid(&devices).await, json!("old"));
}

#[tokio::test]
async fn test_record_only_gate_creates_leaves() {
    let policy = IngestPolicy {
        existence_gate: ExistenceGate::RecordOnly,
        ..Default::default()
    };
    let (_events, devices, ingestor) = setup(policy).await;

    let payload = inform("dev-1", &[("Device.ManagementServer.ConnectionRequestURL", json!("http://cpe:7547/"))]);
    let outcome = ingestor.handle_message(&message(CHANNEL, payload)).await.unwrap();
    assert_eq!(outcome, IngestOutcome::Applied { parameters: 1 });

    let record = devices.device("dev-1").await.unwrap();
    assert_eq!(
        record["Device"]["ManagementServer"]["ConnectionRequestURL"]["_value"],
        json!("http://cpe:7547/")
    );
}

#[tokio::test]
async fn test_suffix_policy_skips_other_parameters() {
    let policy = IngestPolicy {
        name_suffix: Some("ConnectionRequestURL".into()),
        ..Default::default()
    };
    let (_events, devices, ingestor) = setup(policy).await;

    let outcome = ingestor
        .handle_message(&message(CHANNEL, inform("dev-1", &[("Device.WiFi.SSID", json!("home"))])))
        .await
        .unwrap();
    assert_eq!(outcome, IngestOutcome::Skipped);
    assert_eq!(ssid(&devices).await, json!("old"));
}

#[tokio::test]
async fn test_channel_device_id_wins_over_payload() {
    let (_events, devices, ingestor) = setup(IngestPolicy::default()).await;

    let outcome = ingestor
        .handle_message(&message(CHANNEL, inform("someone-else", &[("Device.WiFi.SSID", json!("home"))])))
        .await
        .unwrap();
    assert_eq!(outcome, IngestOutcome::Applied { parameters: 1 });
    assert_eq!(ssid(&devices).await, json!("home"));
}

#[tokio::test]
async fn test_rejects_bad_input() {
    let (_events, _devices, ingestor) = setup(IngestPolicy::default()).await;

    let err = ingestor.handle_message(&message(CHANNEL, "not json".into())).await.unwrap_err();
    assert!(matches!(err, IngestError::Decode { .. }));

    let err = ingestor
        .handle_message(&message(CHANNEL, inform("dev-1", &[("Device..SSID", json!("x"))])))
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::InvalidParameter { .. }));

    let err = ingestor
        .handle_message(&message("other:dev-1", inform("dev-1", &[("Device.WiFi.SSID", json!("x"))])))
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::UnknownChannel { .. }));
}

#[tokio::test]
async fn test_document_store_outage_is_an_error() {
    let (_events, devices, ingestor) = setup(IngestPolicy::default()).await;
    devices.disconnect().await.unwrap();

    let err = ingestor
        .handle_message(&message(CHANNEL, inform("dev-1", &[("Device.WiFi.SSID", json!("x"))])))
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::Update { .. }));
}

#[tokio::test]
async fn test_loop_survives_malformed_message() {
    let (events, devices, ingestor) = setup(IngestPolicy::default()).await;
    let cancel = CancellationToken::new();

    let subscription = ingestor.subscribe().await.unwrap();
    let task = tokio::spawn({
        let ingestor = ingestor.clone();
        let cancel = cancel.clone();
        async move { ingestor.run(subscription, cancel).await }
    });

    events.publish(CHANNEL, "{ broken").await.unwrap();
    events
        .publish(CHANNEL, &inform("dev-1", &[("Device.WiFi.SSID", json!("home"))]))
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while ssid(&devices).await != json!("home") {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("valid event applied after a malformed one");

    cancel.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_start_waits_for_subscribe_delay() {
    let events = DeterministicEphemeralStore::new();
    let devices = DeterministicDeviceStore::new();
    let config = IngestConfig {
        subscribe_delay_ms: 1_000,
        ..Default::default()
    };
    let ingestor = Arc::new(EventIngestor::new(events.clone(), devices, config));
    let cancel = CancellationToken::new();

    let task = tokio::spawn({
        let ingestor = ingestor.clone();
        let cancel = cancel.clone();
        async move { ingestor.start(cancel).await }
    });

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(events.subscriber_count().await, 0);

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(events.subscriber_count().await, 1);

    cancel.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_start_reports_subscribe_failure() {
    let (events, _devices, ingestor) = setup(IngestPolicy::default()).await;
    events.set_available(false);

    let err = ingestor.start(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, IngestError::Subscribe { .. }));
}

/// Hands out subscriptions the store has already closed, as after a lost
/// pub/sub connection.
struct ClosedSubscriptions {
    inner: Arc<DeterministicEphemeralStore>,
}

#[async_trait]
impl EphemeralStore for ClosedSubscriptions {
    async fn get(&self, key: &str) -> Result<Option<String>, EphemeralStoreError> {
        self.inner.get(key).await
    }

    async fn set_with_expiry(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), EphemeralStoreError> {
        self.inner.set_with_expiry(key, value, ttl_secs).await
    }

    async fn del(&self, key: &str) -> Result<u64, EphemeralStoreError> {
        self.inner.del(key).await
    }

    async fn pop(&self, key: &str) -> Result<Option<String>, EphemeralStoreError> {
        self.inner.pop(key).await
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<u64, EphemeralStoreError> {
        self.inner.publish(channel, message).await
    }

    async fn psubscribe(&self, pattern: &str) -> Result<PatternSubscription, EphemeralStoreError> {
        let (_sender, receiver) = mpsc::channel(1);
        Ok(PatternSubscription::new(pattern, receiver))
    }
}

/// Device store that panics on every update.
struct PanickingDevices;

#[async_trait]
impl DeviceStore for PanickingDevices {
    async fn update_if_exists(&self, _request: UpdateRequest) -> Result<UpdateResult, DocumentStoreError> {
        panic!("device store bug");
    }

    async fn disconnect(&self) -> Result<(), DocumentStoreError> {
        Ok(())
    }
}

fn immediate() -> IngestConfig {
    IngestConfig {
        subscribe_delay_ms: 0,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_closed_subscription_is_an_error() {
    let events = Arc::new(ClosedSubscriptions {
        inner: DeterministicEphemeralStore::new(),
    });
    let ingestor = EventIngestor::new(events, DeterministicDeviceStore::new(), immediate());

    let cancel = CancellationToken::new();
    let err = ingestor.start(cancel.clone()).await.unwrap_err();
    assert!(matches!(err, IngestError::SubscriptionClosed { ref pattern } if pattern == "speed069:inform_notiff:*"));
    assert!(!cancel.is_cancelled());
}

#[tokio::test]
async fn test_supervise_reports_closed_subscription() {
    let events = Arc::new(ClosedSubscriptions {
        inner: DeterministicEphemeralStore::new(),
    });
    let ingestor = Arc::new(EventIngestor::new(events, DeterministicDeviceStore::new(), immediate()));

    let fault = ingestor.supervise(CancellationToken::new()).await.expect("closed subscription is a fault");
    assert!(fault.contains("closed"), "unexpected fault: {fault}");
}

#[tokio::test]
async fn test_supervise_reports_panic() {
    let events = DeterministicEphemeralStore::new();
    let ingestor = Arc::new(EventIngestor::new(events.clone(), Arc::new(PanickingDevices), immediate()));
    let supervisor = tokio::spawn(ingestor.supervise(CancellationToken::new()));

    tokio::time::timeout(Duration::from_secs(5), async {
        while events.subscriber_count().await == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    events
        .publish(CHANNEL, &inform("dev-1", &[("Device.WiFi.SSID", json!("home"))]))
        .await
        .unwrap();

    let fault = supervisor.await.unwrap().expect("panic is a fault");
    assert!(fault.contains("panicked"), "unexpected fault: {fault}");
}

#[tokio::test]
async fn test_supervise_is_quiet_after_cancel() {
    let (events, _devices, ingestor) = setup(IngestPolicy::default()).await;
    let cancel = CancellationToken::new();
    let supervisor = tokio::spawn(ingestor.clone().supervise(cancel.clone()));

    tokio::time::timeout(Duration::from_secs(5), async {
        while events.subscriber_count().await == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    cancel.cancel();
    assert_eq!(supervisor.await.unwrap(), None);
}
