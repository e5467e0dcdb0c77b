//! # Msgstore Core
//!
//! A policy-driven message buffer for gossip dissemination, with optional
//! two-phase TTL expiration.
//!
//! ## Features
//!
//! - Caller-supplied replacing policy decides which of two messages wins
//! - Displaced messages are reported through an invalidation trigger
//! - Thread-safe: reads share a `parking_lot::RwLock`, writes are exclusive
//! - Optional background sweeper: messages are hidden after the TTL and
//!   purged after twice the TTL, under a lock owned by the caller
//!
//! ## Example
//!
//! ```rust,no_run
//! use msgstore_core::{
//!     noop_trigger, replacing_policy, ExpirationConfig, ExpirationHooks, InvalidationResult,
//!     MessageStore,
//! };
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     // Newer sequence numbers supersede older ones for the same key
//!     let policy = replacing_policy(|candidate: &(String, u64), stored: &(String, u64)| {
//!         if candidate.0 != stored.0 {
//!             InvalidationResult::NoAction
//!         } else if candidate.1 > stored.1 {
//!             InvalidationResult::Invalidates
//!         } else {
//!             InvalidationResult::Invalidated
//!         }
//!     });
//!
//!     let hooks = ExpirationHooks::new()
//!         .with_on_expire(|(key, seq): &(String, u64)| println!("{key}@{seq} expired"));
//!     let store = MessageStore::new_expirable(
//!         policy,
//!         noop_trigger(),
//!         ExpirationConfig::new(Duration::from_secs(30)),
//!         hooks,
//!     )
//!     .unwrap();
//!
//!     assert!(store.add(("alive".to_string(), 1)));
//!     assert!(!store.check_valid(&("alive".to_string(), 0)));
//!
//!     store.stop();
//! }
//! ```

mod config;
mod entry;
mod error;
mod policy;
mod store;

pub use config::{ExpirationConfig, ExpirationHooks, ExpireCallback, LockHook};
pub use entry::StoredMessage;
pub use error::StoreError;
pub use policy::{
    invalidation_trigger, noop_trigger, replacing_policy, InvalidationResult, InvalidationTrigger,
    ReplacingPolicy,
};
pub use store::{MessageStore, SweepStats};
