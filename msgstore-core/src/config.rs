use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Divisor applied to the TTL to derive how often the sweeper wakes up
const CHECK_INTERVAL_DIVISOR: u32 = 100;

/// Timing configuration for an expirable store
///
/// Messages are hidden once they are older than `ttl` and physically removed
/// once they are older than twice that.
///
/// # Example
///
/// ```rust
/// use msgstore_core::ExpirationConfig;
/// use std::time::Duration;
///
/// let config = ExpirationConfig::new(Duration::from_secs(10));
/// assert_eq!(config.check_interval(), Duration::from_millis(100));
///
/// // Poll less often than the default ttl / 100
/// let config = config.with_check_interval(Duration::from_secs(1));
/// assert_eq!(config.check_interval(), Duration::from_secs(1));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpirationConfig {
    ttl: Duration,
    check_interval: Option<Duration>,
}

impl ExpirationConfig {
    /// Creates a configuration with the given message TTL
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            check_interval: None,
        }
    }

    /// Overrides the sweeper's polling interval
    ///
    /// By default the interval is `ttl / 100`, without any clamping.
    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = Some(interval);
        self
    }

    /// Age after which a message is soft-expired
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// How long the sweeper sleeps between checks
    pub fn check_interval(&self) -> Duration {
        self.check_interval
            .unwrap_or(self.ttl / CHECK_INTERVAL_DIVISOR)
    }

    /// Age after which a soft-expired message is purged
    pub fn purge_after(&self) -> Duration {
        self.ttl.checked_mul(2).unwrap_or(Duration::MAX)
    }
}

/// A caller-owned lock hook (acquire or release)
pub type LockHook = Arc<dyn Fn() + Send + Sync>;

/// Invoked with each message as it becomes soft-expired
pub type ExpireCallback<M> = Arc<dyn Fn(&M) + Send + Sync>;

/// Caller hooks threaded through every sweep cycle
///
/// The sweeper calls `external_lock` before taking the store's own write lock
/// and `external_unlock` after releasing it, so `on_expire` always runs while
/// the caller's lock is held. Unset hooks do nothing.
///
/// Lock ordering: the external lock is always the outer one. Code running
/// under the store's internal lock (the replacing policy and the invalidation
/// trigger) must never try to take the external lock.
///
/// `on_expire` runs while the store's internal write lock is held, and that
/// lock is not reentrant: the callback must not call back into the same store
/// (`add`, `check_valid`, `get`, `size`, `purge` or `sweep`), or the sweep
/// deadlocks. Update caller-side bookkeeping from the payload alone.
///
/// A panicking hook aborts the current sweep only; the external lock is still
/// released and the sweeper keeps running.
pub struct ExpirationHooks<M> {
    pub(crate) external_lock: Option<LockHook>,
    pub(crate) external_unlock: Option<LockHook>,
    pub(crate) on_expire: Option<ExpireCallback<M>>,
}

impl<M> ExpirationHooks<M> {
    /// Creates an empty set of hooks
    pub fn new() -> Self {
        Self {
            external_lock: None,
            external_unlock: None,
            on_expire: None,
        }
    }

    /// Sets the hook that acquires the caller's lock
    pub fn with_external_lock<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.external_lock = Some(Arc::new(f));
        self
    }

    /// Sets the hook that releases the caller's lock
    pub fn with_external_unlock<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.external_unlock = Some(Arc::new(f));
        self
    }

    /// Sets the callback fired once per message on soft expiration
    pub fn with_on_expire<F>(mut self, f: F) -> Self
    where
        F: Fn(&M) + Send + Sync + 'static,
    {
        self.on_expire = Some(Arc::new(f));
        self
    }

    pub(crate) fn lock(&self) {
        if let Some(lock) = &self.external_lock {
            lock();
        }
    }

    pub(crate) fn unlock(&self) {
        if let Some(unlock) = &self.external_unlock {
            unlock();
        }
    }

    pub(crate) fn expire(&self, message: &M) {
        if let Some(on_expire) = &self.on_expire {
            on_expire(message);
        }
    }
}

impl<M> Default for ExpirationHooks<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> fmt::Debug for ExpirationHooks<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExpirationHooks")
            .field("external_lock", &self.external_lock.is_some())
            .field("external_unlock", &self.external_unlock.is_some())
            .field("on_expire", &self.on_expire.is_some())
            .finish()
    }
}
