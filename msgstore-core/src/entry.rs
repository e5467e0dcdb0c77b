use std::time::Duration;
use tokio::time::Instant;

/// A message held by the store together with its bookkeeping
#[derive(Debug, Clone)]
pub struct StoredMessage<M> {
    payload: M,
    created_at: Instant,
    expired: bool,
}

impl<M> StoredMessage<M> {
    /// Wraps a payload, stamping it with the given creation time
    pub fn new(payload: M, created_at: Instant) -> Self {
        Self {
            payload,
            created_at,
            expired: false,
        }
    }

    /// Returns the opaque payload
    pub fn payload(&self) -> &M {
        &self.payload
    }

    /// Returns when the message entered the store
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Returns `true` once the message has been soft-expired
    pub fn is_expired(&self) -> bool {
        self.expired
    }

    /// Time elapsed between insertion and `now`
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }

    /// One-way transition; an expired entry never becomes fresh again.
    pub(crate) fn mark_expired(&mut self) {
        self.expired = true;
    }
}
