//! Out-of-band inform ingestion.
//!
//! An adjacent system intercepts some device sessions and publishes the
//! parameters it observed on `<prefix>:<device id>` channels. The
//! [`EventIngestor`] subscribes to the whole prefix and applies each event as
//! a single conditional write to the device record, gated by an
//! [`IngestPolicy`].

pub mod error;
pub mod event;
pub mod ingestor;
pub mod policy;

pub use error::IngestError;
pub use event::InformBody;
pub use event::InformEvent;
pub use event::InformParameter;
pub use event::device_id_from_channel;
pub use ingestor::DEFAULT_CHANNEL_PREFIX;
pub use ingestor::EventIngestor;
pub use ingestor::IngestConfig;
pub use ingestor::IngestOutcome;
pub use policy::ExistenceGate;
pub use policy::IngestPolicy;
