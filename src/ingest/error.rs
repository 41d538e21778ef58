//! Error types for inform ingestion.

use snafu::Snafu;

use crate::api::DocumentStoreError;
use crate::api::EphemeralStoreError;

/// Errors raised while ingesting one event or setting up the subscription.
///
/// Per-event errors are logged by the subscriber loop and never stop it.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum IngestError {
    /// Payload is not a well-formed inform event.
    #[snafu(display("malformed inform payload: {source}"))]
    Decode {
        /// The underlying JSON error.
        source: serde_json::Error,
    },

    /// A parameter name cannot be used as a field path.
    #[snafu(display("invalid parameter name '{name}': {reason}"))]
    InvalidParameter {
        /// The offending parameter name.
        name: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Channel does not carry a device id under the configured prefix.
    #[snafu(display("channel '{channel}' does not carry a device id"))]
    UnknownChannel {
        /// The channel the message arrived on.
        channel: String,
    },

    /// The document store rejected the update.
    #[snafu(display("failed to update device '{device_id}': {source}"))]
    Update {
        /// Target device.
        device_id: String,
        /// The underlying error.
        source: DocumentStoreError,
    },

    /// The pattern subscription could not be created.
    #[snafu(display("failed to subscribe to '{pattern}': {source}"))]
    Subscribe {
        /// The subscription pattern.
        pattern: String,
        /// The underlying error.
        source: EphemeralStoreError,
    },

    /// The store ended a subscription that should last for the whole process.
    #[snafu(display("subscription to '{pattern}' closed by the store"))]
    SubscriptionClosed {
        /// The subscription pattern.
        pattern: String,
    },
}

pub type Result<T, E = IngestError> = std::result::Result<T, E>;
