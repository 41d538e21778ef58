//! Standing subscriber that folds inform notifications into device records.
//!
//! The adjacent interceptor answers some sessions itself and publishes the
//! parameters it saw, so this server learns about them without forcing a
//! full device resynchronization. Every failure is contained to the message
//! that caused it. Only cancellation ends the loop cleanly; a subscription
//! closed by the store is an error, since nothing else would notice that
//! ingestion stopped.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use snafu::ResultExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::api::DeviceStore;
use crate::api::EphemeralStore;
use crate::api::PatternSubscription;
use crate::api::PubSubMessage;
use crate::coordination::now_unix_ms;
use crate::ingest::error::Result;
use crate::ingest::error::SubscribeSnafu;
use crate::ingest::error::SubscriptionClosedSnafu;
use crate::ingest::error::UnknownChannelSnafu;
use crate::ingest::error::UpdateSnafu;
use crate::ingest::event::InformEvent;
use crate::ingest::event::device_id_from_channel;
use crate::ingest::policy::IngestPolicy;

pub const DEFAULT_CHANNEL_PREFIX: &str = "speed069:inform_notiff";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IngestConfig {
    pub enabled: bool,
    /// Channels are `<channel_prefix>:<device id>`.
    pub channel_prefix: String,
    /// Delay between worker start and subscribing, in milliseconds.
    pub subscribe_delay_ms: u64,
    pub policy: IngestPolicy,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            channel_prefix: DEFAULT_CHANNEL_PREFIX.to_string(),
            subscribe_delay_ms: 1_000,
            policy: IngestPolicy::default(),
        }
    }
}

impl IngestConfig {
    pub fn subscribe_delay(&self) -> Duration {
        Duration::from_millis(self.subscribe_delay_ms)
    }

    /// Glob pattern covering every device channel.
    pub fn pattern(&self) -> String {
        format!("{}:*", self.channel_prefix)
    }

    /// Whether this worker should own the deployment-wide subscription.
    ///
    /// Exactly one subscriber must exist, otherwise every event is applied
    /// once per subscriber. Only instance `1` subscribes, and only when it
    /// runs a single worker process. An unset instance id counts as `1`.
    pub fn should_subscribe(&self, instance_id: Option<u32>, worker_processes: u32) -> bool {
        if !self.enabled || instance_id.unwrap_or(1) != 1 {
            return false;
        }
        if worker_processes != 1 {
            warn!(
                worker_processes,
                "multiple worker processes configured; inform ingestion needs a single worker and stays disabled"
            );
            return false;
        }
        true
    }
}

/// Result of handling one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// The device record was updated.
    Applied { parameters: usize },
    /// No record matched: unknown device or a gated leaf was missing.
    NoMatch,
    /// The policy left nothing to write.
    Skipped,
}

pub struct EventIngestor<E: EphemeralStore + ?Sized, D: DeviceStore + ?Sized> {
    events: Arc<E>,
    devices: Arc<D>,
    config: IngestConfig,
}

impl<E: EphemeralStore + ?Sized, D: DeviceStore + ?Sized> EventIngestor<E, D> {
    pub fn new(events: Arc<E>, devices: Arc<D>, config: IngestConfig) -> Self {
        Self { events, devices, config }
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    pub async fn subscribe(&self) -> Result<PatternSubscription> {
        let pattern = self.config.pattern();
        self.events.psubscribe(&pattern).await.context(SubscribeSnafu { pattern })
    }

    /// Decode one message and apply it.
    pub async fn handle_message(&self, msg: &PubSubMessage) -> Result<IngestOutcome> {
        let device_id = device_id_from_channel(&self.config.channel_prefix, &msg.channel).ok_or_else(|| {
            UnknownChannelSnafu {
                channel: msg.channel.clone(),
            }
            .build()
        })?;

        let event = InformEvent::decode(&msg.payload)?;
        if event.acs_id != device_id {
            warn!(
                device_id,
                payload_acs_id = %event.acs_id,
                "inform payload names a different device than its channel, using channel"
            );
        }

        let Some(update) = self.config.policy.plan(device_id, &event, now_unix_ms()) else {
            debug!(device_id, "no parameters admitted by ingest policy");
            return Ok(IngestOutcome::Skipped);
        };

        let parameters = update.set_fields.len() / 3;
        let result = self.devices.update_if_exists(update).await.context(UpdateSnafu { device_id })?;
        if result.matched {
            debug!(device_id, parameters, "applied inform parameters");
            Ok(IngestOutcome::Applied { parameters })
        } else {
            debug!(device_id, "no device record matched inform update");
            Ok(IngestOutcome::NoMatch)
        }
    }

    /// Process messages until `cancel` fires.
    ///
    /// Returns [`IngestError::SubscriptionClosed`] if the store ends the
    /// subscription first.
    pub async fn run(&self, mut subscription: PatternSubscription, cancel: CancellationToken) -> Result<()> {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(pattern = subscription.pattern(), "inform ingestion stopping");
                    return Ok(());
                }
                msg = subscription.next() => {
                    let Some(msg) = msg else {
                        return SubscriptionClosedSnafu { pattern: subscription.pattern() }.fail();
                    };
                    if let Err(err) = self.handle_message(&msg).await {
                        error!(channel = %msg.channel, error = %err, "failed to ingest inform notification");
                    }
                }
            }
        }
    }

    /// Wait for the configured delay, subscribe, and run until cancelled.
    pub async fn start(&self, cancel: CancellationToken) -> Result<()> {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(self.config.subscribe_delay()) => {}
        }

        let subscription = self.subscribe().await?;
        info!(pattern = subscription.pattern(), "subscribed to inform notifications");
        self.run(subscription, cancel).await
    }
}

impl<E, D> EventIngestor<E, D>
where
    E: EphemeralStore + ?Sized + 'static,
    D: DeviceStore + ?Sized + 'static,
{
    /// Run [`start`](Self::start) on its own task and wait for it to end.
    ///
    /// Resolves to `None` when it ended because `cancel` fired. Any other end
    /// is a fault, described by the returned message: a startup or
    /// subscription error, a return without cancellation, or a panic.
    pub async fn supervise(self: Arc<Self>, cancel: CancellationToken) -> Option<String> {
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { self.start(cancel).await }
        });
        let ended = task.await;
        if cancel.is_cancelled() {
            return None;
        }

        let fault = match ended {
            Ok(Ok(())) => "inform ingestion stopped without being cancelled".to_string(),
            Ok(Err(err)) => err.to_string(),
            Err(join_err) if join_err.is_panic() => "inform ingestion task panicked".to_string(),
            Err(join_err) => format!("inform ingestion task aborted: {join_err}"),
        };
        error!(fault = %fault, "inform ingestion ended");
        Some(fault)
    }
}
