//! Error types for coordination primitives.

use snafu::Snafu;

use crate::api::EphemeralStoreError;

/// Errors from the TTL cache and distributed lock.
///
/// A lock that could not be acquired is not an error; acquisition returns
/// `Ok(None)` in that case. Releasing a lock held by someone else is not an
/// error either, only a warning.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CoordinationError {
    /// The lease ran out before the holder released it.
    ///
    /// The critical section outlived its lease, so another worker may have
    /// acted on the same resource concurrently.
    #[snafu(display("lock '{name}' expired before release"))]
    LeaseExpired {
        /// The lock name.
        name: String,
    },

    /// Underlying ephemeral store error.
    #[snafu(display("storage error: {source}"))]
    Storage {
        /// The underlying error.
        source: EphemeralStoreError,
    },
}

impl From<EphemeralStoreError> for CoordinationError {
    fn from(source: EphemeralStoreError) -> Self {
        CoordinationError::Storage { source }
    }
}
