use std::time::Duration;
use thiserror::Error;

/// Errors raised while constructing an expirable store.
///
/// Routine outcomes (a rejected or displaced message) are never errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The sweeper task needs a Tokio runtime to be spawned on
    #[error("expirable message store must be created from within a Tokio runtime")]
    NoRuntime,

    /// A zero TTL would expire every message on arrival
    #[error("message TTL must be greater than zero")]
    ZeroTtl,

    /// The sweeper cannot poll with a zero period
    #[error("expiration check interval is zero for TTL {ttl:?}")]
    ZeroCheckInterval {
        /// The configured TTL
        ttl: Duration,
    },
}
