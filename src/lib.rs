//! Coordination layer for multi-process CPE management workers.
//!
//! Every worker process is stateless with respect to its peers; they agree
//! only through a shared ephemeral store:
//!
//! - [`coordination`] - TTL cache and named leases over the store
//! - [`ingest`] - folds out-of-band inform notifications into device records
//! - [`diagnostics`] - republishes diagnostic completions for other systems
//! - [`lifecycle`] - signal handling and bounded two-phase shutdown
//!
//! Store backends sit behind the traits in [`api`]. The in-memory backends
//! there are deterministic under paused tokio time and back the test suite.

pub mod api;
pub mod config;
pub mod coordination;
pub mod device_id;
pub mod diagnostics;
pub mod ingest;
pub mod lifecycle;

pub use config::AppConfig;
