use parking_lot::RwLock;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::config::{ExpirationConfig, ExpirationHooks};
use crate::entry::StoredMessage;
use crate::error::StoreError;
use crate::policy::{InvalidationResult, InvalidationTrigger, ReplacingPolicy};

/// Outcome of a single expiration pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Messages that became soft-expired during the pass
    pub expired: usize,
    /// Soft-expired messages physically removed during the pass
    pub purged: usize,
}

/// Entries plus the number of them currently soft-expired.
///
/// Both live under the same lock so `expired_count` can never drift from the
/// flags it summarises.
struct Entries<M> {
    messages: Vec<StoredMessage<M>>,
    expired_count: usize,
}

/// Expiration state, present only for expirable stores
struct Expiration<M> {
    config: ExpirationConfig,
    hooks: ExpirationHooks<M>,
    /// Sender to signal shutdown to the sweeper task
    shutdown_tx: watch::Sender<bool>,
}

/// Internal shared state for the store
struct StoreInner<M> {
    policy: ReplacingPolicy<M>,
    trigger: InvalidationTrigger<M>,
    entries: RwLock<Entries<M>>,
    expiration: Option<Expiration<M>>,
    stopped: AtomicBool,
}

/// Holds the caller's external lock for the duration of a sweep.
struct ExternalLockGuard<'a, M> {
    hooks: &'a ExpirationHooks<M>,
}

impl<'a, M> ExternalLockGuard<'a, M> {
    fn acquire(hooks: &'a ExpirationHooks<M>) -> Self {
        hooks.lock();
        Self { hooks }
    }
}

impl<M> Drop for ExternalLockGuard<'_, M> {
    fn drop(&mut self) {
        self.hooks.unlock();
    }
}

/// Policy-driven buffer of gossip messages
///
/// Every incoming message is compared against the ones already held using the
/// caller's [`ReplacingPolicy`]. A message that is superseded by a stored one
/// is rejected; stored messages superseded by the newcomer are dropped and
/// handed to the [`InvalidationTrigger`].
///
/// An expirable store additionally runs a background sweeper on the current
/// Tokio runtime. Messages older than the TTL are soft-expired (hidden from
/// [`get`](Self::get) and [`size`](Self::size), but still taking part in
/// policy comparisons) and messages older than twice the TTL are purged.
///
/// Cloning the store is cheap; all clones share the same messages. The
/// sweeper stops on [`stop`](Self::stop) or when the last clone is dropped.
///
/// # Example
///
/// ```rust
/// use msgstore_core::{noop_trigger, replacing_policy, InvalidationResult, MessageStore};
///
/// let policy = replacing_policy(|candidate: &u64, stored: &u64| {
///     if candidate > stored {
///         InvalidationResult::Invalidates
///     } else {
///         InvalidationResult::Invalidated
///     }
/// });
/// let store = MessageStore::new(policy, noop_trigger());
///
/// assert!(store.add(1));
/// assert!(!store.add(0));
/// assert!(store.add(2));
/// assert_eq!(store.get(), vec![2]);
/// ```
pub struct MessageStore<M> {
    inner: Arc<StoreInner<M>>,
}

impl<M> MessageStore<M>
where
    M: Clone + Send + Sync + 'static,
{
    /// Creates a store whose messages never expire
    pub fn new(policy: ReplacingPolicy<M>, trigger: InvalidationTrigger<M>) -> Self {
        Self {
            inner: Arc::new(StoreInner::new(policy, trigger, None)),
        }
    }

    /// Creates a store that expires messages after `config.ttl()`
    ///
    /// Spawns the expiration sweeper on the current Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NoRuntime`] when called outside a Tokio runtime,
    /// [`StoreError::ZeroTtl`] for a zero TTL and
    /// [`StoreError::ZeroCheckInterval`] when the sweeper interval works out
    /// to zero.
    pub fn new_expirable(
        policy: ReplacingPolicy<M>,
        trigger: InvalidationTrigger<M>,
        config: ExpirationConfig,
        hooks: ExpirationHooks<M>,
    ) -> Result<Self, StoreError> {
        if config.ttl().is_zero() {
            return Err(StoreError::ZeroTtl);
        }
        let interval = config.check_interval();
        if interval.is_zero() {
            return Err(StoreError::ZeroCheckInterval { ttl: config.ttl() });
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| StoreError::NoRuntime)?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let expiration = Expiration {
            config,
            hooks,
            shutdown_tx,
        };
        let inner = Arc::new(StoreInner::new(policy, trigger, Some(expiration)));

        info!(
            ttl = ?config.ttl(),
            interval = ?interval,
            "starting message store expiration sweeper"
        );
        runtime.spawn(Self::expiration_task(
            Arc::downgrade(&inner),
            interval,
            shutdown_rx,
        ));

        Ok(Self { inner })
    }

    /// Background task that periodically expires and purges old messages
    async fn expiration_task(
        inner: Weak<StoreInner<M>>,
        interval: Duration,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Skip the first immediate tick - we want to wait for the interval first
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;

                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let Some(inner) = inner.upgrade() else {
                        break;
                    };
                    if inner.needs_sweep() {
                        // A panicking hook must not end the sweeper
                        let swept = panic::catch_unwind(AssertUnwindSafe(|| inner.sweep()));
                        if swept.is_err() {
                            error!("message store sweep panicked, sweeper keeps running");
                        }
                    }
                }
            }
        }

        info!("message store expiration sweeper stopped");
    }

    /// Offers a message to the store
    ///
    /// Returns `false` if a stored message invalidates it, in which case the
    /// store is left untouched. Otherwise every stored message the candidate
    /// invalidates is handed to the invalidation trigger and removed before
    /// the candidate is appended, and `true` is returned.
    ///
    /// Displaced messages are removed before the trigger sees them. A
    /// panicking trigger propagates out of `add`; the displaced messages stay
    /// removed and the candidate is not stored.
    pub fn add(&self, message: M) -> bool {
        let inner = &*self.inner;
        let mut entries = inner.entries.write();

        let mut displaced = Vec::new();
        for (idx, stored) in entries.messages.iter().enumerate() {
            match (inner.policy)(&message, stored.payload()) {
                InvalidationResult::Invalidated => {
                    debug!(held = entries.messages.len(), "message rejected by stored message");
                    return false;
                }
                InvalidationResult::Invalidates => displaced.push(idx),
                InvalidationResult::NoAction => {}
            }
        }

        if !displaced.is_empty() {
            let Entries {
                messages,
                expired_count,
            } = &mut *entries;
            let mut removed = Vec::with_capacity(displaced.len());
            for &idx in displaced.iter().rev() {
                let stored = messages.remove(idx);
                if stored.is_expired() {
                    *expired_count -= 1;
                }
                removed.push(stored);
            }

            // Insertion order
            for stored in removed.iter().rev() {
                (inner.trigger)(stored.payload());
            }
            debug!(displaced = displaced.len(), "message displaced stored messages");
        }

        entries
            .messages
            .push(StoredMessage::new(message, Instant::now()));
        true
    }

    /// Returns whether `add` would currently accept the message
    ///
    /// Never mutates the store. The answer may be stale by the time the
    /// caller acts on it.
    #[must_use]
    pub fn check_valid(&self, message: &M) -> bool {
        let entries = self.inner.entries.read();
        !entries.messages.iter().any(|stored| {
            (self.inner.policy)(message, stored.payload()) == InvalidationResult::Invalidated
        })
    }

    /// Returns the number of messages that are not soft-expired
    #[must_use]
    pub fn size(&self) -> usize {
        let entries = self.inner.entries.read();
        entries.messages.len() - entries.expired_count
    }

    /// Returns `true` if no visible message is held
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Returns the number of held messages, soft-expired ones included
    #[must_use]
    pub fn len_including_expired(&self) -> usize {
        self.inner.entries.read().messages.len()
    }

    /// Returns a snapshot of every visible message in insertion order
    pub fn get(&self) -> Vec<M> {
        self.inner
            .entries
            .read()
            .messages
            .iter()
            .filter(|stored| !stored.is_expired())
            .map(|stored| stored.payload().clone())
            .collect()
    }

    /// Removes every message matching `predicate`
    ///
    /// Neither the invalidation trigger nor the expire callback is invoked.
    /// Returns the number of messages removed.
    pub fn purge<F>(&self, mut predicate: F) -> usize
    where
        F: FnMut(&M) -> bool,
    {
        let mut entries = self.inner.entries.write();
        let Entries {
            messages,
            expired_count,
        } = &mut *entries;

        let before = messages.len();
        messages.retain(|stored| {
            if !predicate(stored.payload()) {
                return true;
            }
            if stored.is_expired() {
                *expired_count -= 1;
            }
            false
        });
        before - messages.len()
    }

    /// Runs one expiration pass right away
    ///
    /// Note: This is also done automatically by the background task. A no-op
    /// on stores created with [`new`](Self::new).
    pub fn sweep(&self) -> SweepStats {
        self.inner.sweep()
    }

    /// Signals the expiration sweeper to stop
    ///
    /// Safe to call repeatedly and from several threads; only the first call
    /// has any effect. Does not wait for the task to exit. A no-op on stores
    /// created with [`new`](Self::new).
    pub fn stop(&self) {
        self.inner.signal_stop();
    }

    /// Returns `true` if the store was created with [`new_expirable`](Self::new_expirable)
    pub fn is_expirable(&self) -> bool {
        self.inner.expiration.is_some()
    }

    /// Returns `true` once the sweeper of an expirable store has been told to stop
    ///
    /// Always `false` for stores created with [`new`](Self::new).
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }
}

impl<M> StoreInner<M> {
    fn new(
        policy: ReplacingPolicy<M>,
        trigger: InvalidationTrigger<M>,
        expiration: Option<Expiration<M>>,
    ) -> Self {
        Self {
            policy,
            trigger,
            entries: RwLock::new(Entries {
                messages: Vec::new(),
                expired_count: 0,
            }),
            expiration,
            stopped: AtomicBool::new(false),
        }
    }

    /// Cheap read-locked check for anything due to expire or be purged
    fn needs_sweep(&self) -> bool {
        let Some(expiration) = &self.expiration else {
            return false;
        };
        let ttl = expiration.config.ttl();
        let purge_after = expiration.config.purge_after();
        let now = Instant::now();

        self.entries.read().messages.iter().any(|stored| {
            let age = stored.age(now);
            if stored.is_expired() {
                age > purge_after
            } else {
                age > ttl
            }
        })
    }

    fn sweep(&self) -> SweepStats {
        let Some(expiration) = &self.expiration else {
            return SweepStats::default();
        };
        let ttl = expiration.config.ttl();
        let purge_after = expiration.config.purge_after();
        let hooks = &expiration.hooks;

        // External lock first, released last
        let _external = ExternalLockGuard::acquire(hooks);
        let mut entries = self.entries.write();
        let Entries {
            messages,
            expired_count,
        } = &mut *entries;

        let now = Instant::now();
        let mut stats = SweepStats::default();
        messages.retain_mut(|stored| {
            let age = stored.age(now);
            if !stored.is_expired() {
                if age > ttl {
                    stored.mark_expired();
                    *expired_count += 1;
                    stats.expired += 1;
                    hooks.expire(stored.payload());
                }
                true
            } else if age > purge_after {
                *expired_count -= 1;
                stats.purged += 1;
                false
            } else {
                true
            }
        });
        drop(entries);

        if stats != SweepStats::default() {
            debug!(
                expired = stats.expired,
                purged = stats.purged,
                "message store sweep"
            );
        }
        stats
    }

    fn signal_stop(&self) {
        let Some(expiration) = &self.expiration else {
            return;
        };
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        // The task may already be gone; nothing to do then.
        let _ = expiration.shutdown_tx.send(true);
    }
}

impl<M> Clone for MessageStore<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M> fmt::Debug for MessageStore<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.inner.entries.read();
        f.debug_struct("MessageStore")
            .field("held", &entries.messages.len())
            .field("expired", &entries.expired_count)
            .field("expirable", &self.inner.expiration.is_some())
            .field("stopped", &self.inner.stopped.load(Ordering::Acquire))
            .finish()
    }
}

impl<M> Drop for StoreInner<M> {
    fn drop(&mut self) {
        // Signal the sweeper to stop when the last handle is dropped
        self.signal_stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{invalidation_trigger, noop_trigger, replacing_policy};
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct StateMsg {
        key: &'static str,
        seq: u64,
    }

    fn msg(key: &'static str, seq: u64) -> StateMsg {
        StateMsg { key, seq }
    }

    /// Higher sequence numbers win within a key; different keys coexist.
    fn by_sequence() -> ReplacingPolicy<StateMsg> {
        replacing_policy(|candidate: &StateMsg, stored: &StateMsg| {
            if candidate.key != stored.key {
                InvalidationResult::NoAction
            } else if candidate.seq > stored.seq {
                InvalidationResult::Invalidates
            } else {
                InvalidationResult::Invalidated
            }
        })
    }

    fn recording_trigger() -> (InvalidationTrigger<StateMsg>, Arc<Mutex<Vec<StateMsg>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let trigger = invalidation_trigger(move |m: &StateMsg| sink.lock().push(m.clone()));
        (trigger, seen)
    }

    fn create_test_store() -> (MessageStore<StateMsg>, Arc<Mutex<Vec<StateMsg>>>) {
        let (trigger, seen) = recording_trigger();
        (MessageStore::new(by_sequence(), trigger), seen)
    }

    #[test]
    fn test_sequence_scenario() {
        let (store, invalidated) = create_test_store();

        assert!(store.add(msg("k", 1)));
        assert!(!store.add(msg("k", 0)));
        assert_eq!(store.get(), vec![msg("k", 1)]);
        assert!(invalidated.lock().is_empty());

        assert!(store.add(msg("k", 2)));
        assert_eq!(*invalidated.lock(), vec![msg("k", 1)]);
        assert_eq!(store.get(), vec![msg("k", 2)]);
        assert_eq!(store.size(), 1);
    }

    #[test]
    fn test_rejected_add_leaves_store_unchanged() {
        let (store, invalidated) = create_test_store();
        assert!(store.add(msg("a", 5)));
        assert!(store.add(msg("b", 1)));

        assert!(!store.add(msg("a", 5)));
        assert!(!store.add(msg("a", 3)));

        assert_eq!(store.get(), vec![msg("a", 5), msg("b", 1)]);
        assert!(invalidated.lock().is_empty());
    }

    #[test]
    fn test_unrelated_messages_coexist_in_either_order() {
        let (first, _) = create_test_store();
        assert!(first.add(msg("a", 1)));
        assert!(first.add(msg("b", 1)));
        assert_eq!(first.get(), vec![msg("a", 1), msg("b", 1)]);

        let (second, _) = create_test_store();
        assert!(second.add(msg("b", 1)));
        assert!(second.add(msg("a", 1)));
        assert_eq!(second.get(), vec![msg("b", 1), msg("a", 1)]);
    }

    #[test]
    fn test_add_displaces_several_messages() {
        // A number invalidates its proper divisors and is invalidated by its multiples.
        let policy = replacing_policy(|candidate: &u64, stored: &u64| {
            if candidate != stored && candidate % stored == 0 {
                InvalidationResult::Invalidates
            } else if stored % candidate == 0 {
                InvalidationResult::Invalidated
            } else {
                InvalidationResult::NoAction
            }
        });
        let displaced = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&displaced);
        let store = MessageStore::new(policy, invalidation_trigger(move |m: &u64| sink.lock().push(*m)));

        assert!(store.add(2));
        assert!(store.add(5));
        assert!(store.add(3));
        assert!(store.add(6));

        assert_eq!(*displaced.lock(), vec![2, 3]);
        assert_eq!(store.get(), vec![5, 6]);
        assert!(!store.add(3));
        assert_eq!(store.size(), 2);
    }

    #[test]
    fn test_check_valid_does_not_mutate() {
        let (store, invalidated) = create_test_store();
        assert!(store.add(msg("k", 4)));

        assert!(!store.check_valid(&msg("k", 3)));
        assert!(store.check_valid(&msg("k", 9)));
        assert!(store.check_valid(&msg("other", 0)));

        assert_eq!(store.get(), vec![msg("k", 4)]);
        assert!(invalidated.lock().is_empty());
    }

    #[test]
    fn test_size_matches_get() {
        let (store, _) = create_test_store();
        assert!(store.is_empty());

        for (key, seq) in [("a", 1), ("b", 1), ("a", 2), ("c", 7), ("b", 0), ("c", 8)] {
            store.add(msg(key, seq));
            assert_eq!(store.size(), store.get().len());
        }
        assert_eq!(store.size(), 3);
        assert!(!store.is_empty());
    }

    #[test]
    fn test_purge_removes_matching_without_callbacks() {
        let (store, invalidated) = create_test_store();
        store.add(msg("a", 1));
        store.add(msg("b", 1));
        store.add(msg("c", 1));

        let removed = store.purge(|m| m.key != "b");
        assert_eq!(removed, 2);
        assert_eq!(store.get(), vec![msg("b", 1)]);
        assert!(invalidated.lock().is_empty());

        // A purged message no longer blocks older ones
        assert!(store.add(msg("a", 0)));
    }

    #[test]
    fn test_non_expirable_store_sweep_and_stop_are_noops() {
        let (store, _) = create_test_store();
        store.add(msg("k", 1));

        assert!(!store.is_expirable());
        assert_eq!(store.sweep(), SweepStats::default());
        store.stop();
        store.stop();
        assert!(!store.is_stopped());
        assert_eq!(store.get(), vec![msg("k", 1)]);
    }

    #[test]
    fn test_store_clone_shares_messages() {
        let (store1, _) = create_test_store();
        let store2 = store1.clone();

        store1.add(msg("k", 1));
        assert_eq!(store2.get(), vec![msg("k", 1)]);

        assert!(!store2.add(msg("k", 1)));
        assert!(store2.add(msg("k", 2)));
        assert_eq!(store1.get(), vec![msg("k", 2)]);
    }

    #[test]
    fn test_concurrent_adds_of_unrelated_messages() {
        let policy = replacing_policy(|candidate: &(usize, usize), stored: &(usize, usize)| {
            if candidate == stored {
                InvalidationResult::Invalidated
            } else {
                InvalidationResult::NoAction
            }
        });
        let store = MessageStore::new(policy, noop_trigger());
        let mut handles = vec![];

        // Spawn 8 threads, each adding 50 distinct messages
        for thread_id in 0..8 {
            let store = store.clone();
            handles.push(thread::spawn(move || {
                for i in 0..50 {
                    assert!(store.add((thread_id, i)));
                }
            }));
        }

        for handle in handles {
            handle.join().expect("Thread panicked");
        }

        assert_eq!(store.size(), 400);
        assert_eq!(store.get().len(), 400);
    }

    #[test]
    fn test_concurrent_adds_to_same_key_keep_highest() {
        let (trigger, invalidated) = recording_trigger();
        let store = MessageStore::new(by_sequence(), trigger);
        let accepted = Arc::new(Mutex::new(0usize));
        let mut handles = vec![];

        for thread_id in 0..10u64 {
            let store = store.clone();
            let accepted = Arc::clone(&accepted);
            handles.push(thread::spawn(move || {
                for i in 0..100u64 {
                    if store.add(msg("contested", i * 10 + thread_id)) {
                        *accepted.lock() += 1;
                    }
                }
            }));
        }

        for handle in handles {
            handle.join().expect("Thread panicked");
        }

        assert_eq!(store.get(), vec![msg("contested", 999)]);
        // Every accepted message except the survivor was displaced exactly once
        assert_eq!(invalidated.lock().len(), *accepted.lock() - 1);
    }

    #[test]
    fn test_expirable_store_requires_runtime() {
        let result = MessageStore::new_expirable(
            by_sequence(),
            noop_trigger(),
            ExpirationConfig::new(Duration::from_secs(1)),
            ExpirationHooks::default(),
        );
        assert_eq!(result.err(), Some(StoreError::NoRuntime));
    }

    #[tokio::test]
    async fn test_expirable_store_rejects_zero_durations() {
        let zero_ttl = MessageStore::new_expirable(
            by_sequence(),
            noop_trigger(),
            ExpirationConfig::new(Duration::ZERO),
            ExpirationHooks::default(),
        );
        assert_eq!(zero_ttl.err(), Some(StoreError::ZeroTtl));

        let ttl = Duration::from_nanos(50);
        let zero_interval = MessageStore::new_expirable(
            by_sequence(),
            noop_trigger(),
            ExpirationConfig::new(ttl),
            ExpirationHooks::default(),
        );
        assert_eq!(
            zero_interval.err(),
            Some(StoreError::ZeroCheckInterval { ttl })
        );
    }

    const TTL: Duration = Duration::from_secs(1);

    /// Expirable store whose hooks log "lock", "expire:<seq>" and "unlock".
    fn create_expirable_store(
        config: ExpirationConfig,
    ) -> (MessageStore<StateMsg>, Arc<Mutex<Vec<String>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let (lock_log, unlock_log, expire_log) =
            (events.clone(), events.clone(), events.clone());
        let hooks = ExpirationHooks::new()
            .with_external_lock(move || lock_log.lock().push("lock".to_string()))
            .with_external_unlock(move || unlock_log.lock().push("unlock".to_string()))
            .with_on_expire(move |m: &StateMsg| expire_log.lock().push(format!("expire:{}", m.seq)));

        let store = MessageStore::new_expirable(by_sequence(), noop_trigger(), config, hooks)
            .expect("store should be created");
        (store, events)
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_phase_expiration() {
        let (store, events) = create_expirable_store(ExpirationConfig::new(TTL));
        assert!(store.add(msg("k", 1)));

        tokio::time::sleep(TTL.mul_f32(1.5)).await;

        // Soft-expired: hidden, but still blocking older or equal messages
        assert_eq!(*events.lock(), vec!["lock", "expire:1", "unlock"]);
        assert!(store.get().is_empty());
        assert_eq!(store.size(), 0);
        assert_eq!(store.len_including_expired(), 1);
        assert!(!store.check_valid(&msg("k", 1)));
        assert!(!store.add(msg("k", 0)));

        tokio::time::sleep(TTL).await;

        // Purged: gone in every sense, and the callback did not fire again
        assert_eq!(
            *events.lock(),
            vec!["lock", "expire:1", "unlock", "lock", "unlock"]
        );
        assert_eq!(store.len_including_expired(), 0);
        assert!(store.check_valid(&msg("k", 0)));
        assert!(store.add(msg("k", 0)));
        assert_eq!(store.get(), vec![msg("k", 0)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_messages_survive_sweeps() {
        let (store, events) = create_expirable_store(ExpirationConfig::new(TTL));
        store.add(msg("old", 1));

        tokio::time::sleep(TTL / 2).await;
        store.add(msg("new", 1));
        tokio::time::sleep(TTL.mul_f32(0.75)).await;

        assert_eq!(store.get(), vec![msg("new", 1)]);
        assert_eq!(*events.lock(), vec!["lock", "expire:1", "unlock"]);
        assert_eq!(store.size(), store.get().len());
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_sweep() {
        // Long interval keeps the background task out of the way
        let config = ExpirationConfig::new(TTL).with_check_interval(Duration::from_secs(3600));
        let (store, _) = create_expirable_store(config);
        store.add(msg("k", 1));

        tokio::time::advance(TTL * 3).await;

        // Expiry and purge never happen to the same message in one pass
        assert_eq!(store.sweep(), SweepStats { expired: 1, purged: 0 });
        assert_eq!(store.sweep(), SweepStats { expired: 0, purged: 1 });
        assert_eq!(store.sweep(), SweepStats::default());
        assert_eq!(store.len_including_expired(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_displacing_expired_message_keeps_count_consistent() {
        let config = ExpirationConfig::new(TTL).with_check_interval(Duration::from_secs(3600));
        let (trigger, invalidated) = recording_trigger();
        let store =
            MessageStore::new_expirable(by_sequence(), trigger, config, ExpirationHooks::default())
                .expect("store should be created");

        store.add(msg("k", 1));
        store.add(msg("other", 1));
        tokio::time::advance(TTL.mul_f32(1.5)).await;
        assert_eq!(store.sweep().expired, 2);
        assert_eq!(store.size(), 0);

        assert!(store.add(msg("k", 2)));
        assert_eq!(*invalidated.lock(), vec![msg("k", 1)]);
        assert_eq!(store.size(), 1);
        assert_eq!(store.get(), vec![msg("k", 2)]);

        assert_eq!(store.purge(|m| m.key == "other"), 1);
        assert_eq!(store.len_including_expired(), 1);
        assert_eq!(store.size(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_halts_expiration() {
        let (store, events) = create_expirable_store(ExpirationConfig::new(TTL));
        store.add(msg("k", 1));

        store.stop();
        assert!(store.is_stopped());

        tokio::time::sleep(TTL * 3).await;

        assert!(events.lock().is_empty());
        assert_eq!(store.get(), vec![msg("k", 1)]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_stop_is_idempotent() {
        let (store, _) = create_expirable_store(ExpirationConfig::new(TTL));
        let mut handles = vec![];

        for _ in 0..8 {
            let store = store.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..10 {
                    store.stop();
                }
            }));
        }

        for handle in handles {
            handle.join().expect("Thread panicked");
        }

        assert!(store.is_stopped());
        store.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_multiple_stores_expire_independently() {
        let (fast, _) = create_expirable_store(ExpirationConfig::new(TTL));
        let (slow, _) = create_expirable_store(ExpirationConfig::new(TTL * 60));

        fast.add(msg("k", 1));
        slow.add(msg("k", 1));

        tokio::time::sleep(TTL * 3).await;

        assert_eq!(fast.len_including_expired(), 0);
        assert_eq!(slow.get(), vec![msg("k", 1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_expire_hook_does_not_stop_sweeper() {
        let expired = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&expired);
        let hooks = ExpirationHooks::new().with_on_expire(move |m: &StateMsg| {
            sink.lock().push(m.seq);
            if m.seq == 1 {
                panic!("expire hook failed for seq 1");
            }
        });
        let store =
            MessageStore::new_expirable(by_sequence(), noop_trigger(), ExpirationConfig::new(TTL), hooks)
                .expect("store should be created");

        store.add(msg("a", 1));
        tokio::time::sleep(TTL.mul_f32(1.5)).await;
        assert!(store.get().is_empty());

        store.add(msg("b", 2));
        tokio::time::sleep(TTL * 5).await;

        // The sweeper survived the panic and kept expiring and purging
        assert_eq!(*expired.lock(), vec![1, 2]);
        assert!(!store.is_stopped());
        assert!(store.get().is_empty());
        assert_eq!(store.len_including_expired(), 0);
        assert_eq!(store.size(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_last_handle_releases_state() {
        let fired = Arc::new(AtomicUsize::new(0));
        let (lock_fired, expire_fired) = (Arc::clone(&fired), Arc::clone(&fired));
        let hooks = ExpirationHooks::new()
            .with_external_lock(move || {
                lock_fired.fetch_add(1, Ordering::SeqCst);
            })
            .with_on_expire(move |_: &StateMsg| {
                expire_fired.fetch_add(1, Ordering::SeqCst);
            });
        let store =
            MessageStore::new_expirable(by_sequence(), noop_trigger(), ExpirationConfig::new(TTL), hooks)
                .expect("store should be created");
        let clone = store.clone();
        store.add(msg("k", 1));

        drop(store);
        assert_eq!(Arc::strong_count(&fired), 3);
        drop(clone);

        // The sweeper only holds a weak reference, so the hooks go with the store
        assert_eq!(Arc::strong_count(&fired), 1);

        tokio::time::sleep(TTL * 3).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_panicking_trigger_notifies_each_message_once() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&calls);
        let trigger = invalidation_trigger(move |m: &StateMsg| {
            let first = sink.lock().is_empty();
            sink.lock().push(m.clone());
            if first {
                panic!("trigger failed");
            }
        });
        let store = MessageStore::new(by_sequence(), trigger);
        assert!(store.add(msg("k", 1)));

        let result = panic::catch_unwind(AssertUnwindSafe(|| store.add(msg("k", 2))));
        assert!(result.is_err());

        // The displaced message is gone and the candidate was not stored
        assert!(store.get().is_empty());
        assert_eq!(store.size(), 0);

        assert!(store.add(msg("k", 3)));
        assert!(store.add(msg("k", 4)));
        assert_eq!(*calls.lock(), vec![msg("k", 1), msg("k", 3)]);
        assert_eq!(store.get(), vec![msg("k", 4)]);
    }
}
