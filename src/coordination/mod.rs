//! Coordination primitives shared by every worker process.
//!
//! - [`TtlCache`] - keyed string storage with padded expiry
//! - [`LockManager`] - named leases with token-based ownership
//!
//! Both are stateless clients of an [`EphemeralStore`](crate::api::EphemeralStore);
//! every worker builds its own and they agree only through the store.
//!
//! ## Lock Example
//!
//! ```ignore
//! use cwmp_coord::coordination::{CacheConfig, LockConfig, LockManager};
//!
//! let locks = LockManager::new(store, CacheConfig::default(), LockConfig::default());
//! let token = locks
//!     .acquire_lock("0011AA-Router-SN1", Duration::from_secs(10), Duration::from_secs(5))
//!     .await?;
//! if let Some(token) = token {
//!     // Protected critical section
//!     locks.release_lock("0011AA-Router-SN1", &token).await?;
//! }
//! ```

pub mod cache;
pub mod error;
pub mod lock;
pub mod types;

pub use cache::CacheConfig;
pub use cache::TtlCache;
pub use error::CoordinationError;
pub use lock::LockConfig;
pub use lock::LockManager;
pub use types::CLOCK_SKEW_TOLERANCE;
pub use types::LockToken;
pub use types::lease_to_ttl_secs;
pub use types::now_unix_ms;
