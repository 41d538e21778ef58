//! Diagnostic-completion notifications for the adjacent management system.
//!
//! The external system calls in with `[params_json, call_index]` when a
//! device diagnostic finishes; the notifier republishes the device id on a
//! pub/sub channel. Callers retry with the same call index, so the last reply
//! is remembered and returned verbatim for a repeated index.
//!
//! The worker binary does not call this itself. [`DiagnosticNotifier`] is the
//! library entry point for whichever extension host exposes the call to the
//! external system.

use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::debug;
use tracing::warn;

use crate::api::EphemeralStore;

pub const DEFAULT_DIAGNOSTICS_CHANNEL: &str = "diagnosticComplete";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DiagnosticsConfig {
    /// Channel the device id is published on.
    pub channel: String,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            channel: DEFAULT_DIAGNOSTICS_CHANNEL.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiagnosticReply {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl DiagnosticReply {
    pub fn ok() -> Self {
        Self {
            success: true,
            reason: None,
            message: None,
        }
    }

    pub fn failure(reason: &str, message: &str) -> Self {
        Self {
            success: false,
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
        }
    }
}

/// Last reply, keyed by the call index that produced it.
#[derive(Debug, Default)]
pub struct CallReplyCache {
    last: Option<(String, DiagnosticReply)>,
}

impl CallReplyCache {
    pub fn lookup(&self, call_index: &str) -> Option<&DiagnosticReply> {
        self.last.as_ref().filter(|(index, _)| index == call_index).map(|(_, reply)| reply)
    }

    pub fn record(&mut self, call_index: &str, reply: DiagnosticReply) {
        self.last = Some((call_index.to_string(), reply));
    }
}

#[derive(Debug, Deserialize)]
struct DiagnosticParams {
    #[serde(default)]
    acs_id: Option<String>,
}

pub struct DiagnosticNotifier<S: EphemeralStore + ?Sized> {
    store: Arc<S>,
    config: DiagnosticsConfig,
    replies: Mutex<CallReplyCache>,
}

impl<S: EphemeralStore + ?Sized> DiagnosticNotifier<S> {
    pub fn new(store: Arc<S>, config: DiagnosticsConfig) -> Self {
        Self {
            store,
            config,
            replies: Mutex::new(CallReplyCache::default()),
        }
    }

    /// Handle one `[params_json, call_index]` invocation.
    ///
    /// Calls are serialized so a retried index never publishes twice.
    pub async fn receive_device_diagnostics(&self, args: &[String]) -> DiagnosticReply {
        let parsed = args
            .first()
            .zip(args.get(1))
            .and_then(|(raw, index)| serde_json::from_str::<Option<DiagnosticParams>>(raw).ok().map(|p| (p, index)));
        let Some((params, call_index)) = parsed else {
            return DiagnosticReply::failure("params-json-parse", "Error parsing params JSON");
        };

        let mut replies = self.replies.lock().await;
        if let Some(reply) = replies.lookup(call_index) {
            debug!(call_index = %call_index, "repeated diagnostic call, returning cached reply");
            return reply.clone();
        }

        let acs_id = params.and_then(|p| p.acs_id).filter(|id| !id.is_empty());
        let reply = match acs_id {
            None => DiagnosticReply::failure("incomplete-params", "Incomplete arguments"),
            Some(acs_id) => match self.store.publish(&self.config.channel, &acs_id).await {
                Ok(receivers) => {
                    debug!(device_id = %acs_id, receivers, "published diagnostic completion");
                    DiagnosticReply::ok()
                }
                Err(err) => {
                    warn!(device_id = %acs_id, error = %err, "failed to publish diagnostic completion");
                    DiagnosticReply::failure("redis-error", "Error on redis")
                }
            },
        };

        replies.record(call_index, reply.clone());
        reply
    }
}
