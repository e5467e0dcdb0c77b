use anyhow::{ensure, Result};
use futures::future::join_all;
use msgstore_core::{
    invalidation_trigger, replacing_policy, ExpirationConfig, ExpirationHooks, InvalidationResult,
    MessageStore,
};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Heartbeat gossiped by a member: newer incarnations replace older ones
#[derive(Debug, Clone, PartialEq, Eq)]
struct AliveMessage {
    member: usize,
    incarnation: u64,
}

/// Simulation parameters, read from the environment
#[derive(Debug, Clone)]
struct SimConfig {
    ttl: Duration,
    peers: usize,
    members: usize,
    rounds: u64,
}

impl SimConfig {
    /// Reads:
    /// - `MSGSTORE_TTL_MS` - message TTL in milliseconds (default 500)
    /// - `MSGSTORE_PEERS` - number of gossiping peers (default 4)
    /// - `MSGSTORE_KEYS` - number of distinct members gossiped about (default 8)
    /// - `MSGSTORE_ROUNDS` - gossip rounds per peer (default 50)
    fn from_env() -> Self {
        Self {
            ttl: Duration::from_millis(env_or("MSGSTORE_TTL_MS", 500)),
            peers: env_or("MSGSTORE_PEERS", 4),
            members: env_or::<usize>("MSGSTORE_KEYS", 8).max(1),
            rounds: env_or("MSGSTORE_ROUNDS", 50),
        }
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

/// Binary lock that can be taken and released from separate calls, as the
/// store's external lock hooks require.
#[derive(Default)]
struct Gate {
    held: Mutex<bool>,
    released: Condvar,
}

impl Gate {
    fn lock(&self) {
        let mut held = self.held.lock();
        while *held {
            self.released.wait(&mut held);
        }
        *held = true;
    }

    fn unlock(&self) {
        *self.held.lock() = false;
        self.released.notify_one();
    }

    fn with<T>(&self, f: impl FnOnce() -> T) -> T {
        self.lock();
        let _held = GateGuard { gate: self };
        f()
    }
}

/// Releases the gate on drop, so a panic inside `Gate::with` cannot wedge the sweeper
struct GateGuard<'a> {
    gate: &'a Gate,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        self.gate.unlock();
    }
}

/// Caller-side view of live members, kept in step with the store
type MembershipIndex = Arc<Mutex<HashMap<usize, u64>>>;

#[derive(Default)]
struct Counters {
    accepted: AtomicUsize,
    rejected: AtomicUsize,
    displaced: AtomicUsize,
    expired: AtomicUsize,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "msgstore_gossip_sim=info,msgstore_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = SimConfig::from_env();
    tracing::info!("Gossip message store simulation");
    tracing::info!(
        "   TTL: {:?}, peers: {}, members: {}, rounds: {}",
        config.ttl,
        config.peers,
        config.members,
        config.rounds
    );

    let gate = Arc::new(Gate::default());
    let index: MembershipIndex = Arc::new(Mutex::new(HashMap::new()));
    let counters = Arc::new(Counters::default());
    let store = build_store(&config, &gate, &index, &counters)?;

    let start = Instant::now();
    run_peers(&config, &store, &gate, &index, &counters).await?;
    tracing::info!("   Gossip finished in {:?}", start.elapsed());
    verify_index_matches_store(&store, &gate, &index)?;

    wait_for_purge(&config, &store, &gate, &index).await?;

    store.stop();
    tracing::info!(
        "Done: accepted={} rejected={} displaced={} expired={}",
        counters.accepted.load(Ordering::Relaxed),
        counters.rejected.load(Ordering::Relaxed),
        counters.displaced.load(Ordering::Relaxed),
        counters.expired.load(Ordering::Relaxed),
    );

    Ok(())
}

fn build_store(
    config: &SimConfig,
    gate: &Arc<Gate>,
    index: &MembershipIndex,
    counters: &Arc<Counters>,
) -> Result<MessageStore<AliveMessage>> {
    let policy = replacing_policy(|candidate: &AliveMessage, stored: &AliveMessage| {
        if candidate.member != stored.member {
            InvalidationResult::NoAction
        } else if candidate.incarnation > stored.incarnation {
            InvalidationResult::Invalidates
        } else {
            InvalidationResult::Invalidated
        }
    });

    // Runs under the store's lock: must not touch the gate
    let displaced = Arc::clone(counters);
    let trigger = invalidation_trigger(move |_: &AliveMessage| {
        displaced.displaced.fetch_add(1, Ordering::Relaxed);
    });

    let (lock_gate, unlock_gate) = (Arc::clone(gate), Arc::clone(gate));
    let expire_index = Arc::clone(index);
    let expired = Arc::clone(counters);
    let hooks = ExpirationHooks::new()
        .with_external_lock(move || lock_gate.lock())
        .with_external_unlock(move || unlock_gate.unlock())
        .with_on_expire(move |m: &AliveMessage| {
            let mut index = expire_index.lock();
            if index.get(&m.member) == Some(&m.incarnation) {
                index.remove(&m.member);
            }
            expired.expired.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(member = m.member, incarnation = m.incarnation, "member expired");
        });

    let store = MessageStore::new_expirable(policy, trigger, ExpirationConfig::new(config.ttl), hooks)?;
    Ok(store)
}

/// Every peer gossips heartbeats about a rotating set of members
async fn run_peers(
    config: &SimConfig,
    store: &MessageStore<AliveMessage>,
    gate: &Arc<Gate>,
    index: &MembershipIndex,
    counters: &Arc<Counters>,
) -> Result<()> {
    tracing::info!("Phase: concurrent gossip ({} peers)", config.peers);

    let pause = config.ttl / 20;
    let handles: Vec<_> = (0..config.peers)
        .map(|peer| {
            let store = store.clone();
            let gate = Arc::clone(gate);
            let index = Arc::clone(index);
            let counters = Arc::clone(counters);
            let (members, rounds) = (config.members, config.rounds);

            tokio::task::spawn_blocking(move || {
                for round in 0..rounds {
                    let message = AliveMessage {
                        member: (peer * 7 + round as usize) % members,
                        incarnation: round,
                    };
                    if !store.check_valid(&message) {
                        counters.rejected.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }

                    gate.with(|| {
                        let incarnation = message.incarnation;
                        let member = message.member;
                        if store.add(message) {
                            index.lock().insert(member, incarnation);
                            counters.accepted.fetch_add(1, Ordering::Relaxed);
                        } else {
                            counters.rejected.fetch_add(1, Ordering::Relaxed);
                        }
                    });
                    std::thread::sleep(pause);
                }
            })
        })
        .collect();

    for result in join_all(handles).await {
        result?;
    }

    tracing::info!("   ✓ {} messages visible after gossip", store.size());
    Ok(())
}

/// Under the gate, the index must hold exactly the visible messages
fn verify_index_matches_store(
    store: &MessageStore<AliveMessage>,
    gate: &Gate,
    index: &MembershipIndex,
) -> Result<()> {
    gate.with(|| {
        let visible = store.get();
        let index = index.lock();

        ensure!(
            visible.len() == store.size(),
            "size {} disagrees with {} visible messages",
            store.size(),
            visible.len()
        );
        ensure!(
            visible.len() == index.len(),
            "index tracks {} members but store shows {}",
            index.len(),
            visible.len()
        );
        for message in &visible {
            ensure!(
                index.get(&message.member) == Some(&message.incarnation),
                "index out of step for member {}",
                message.member
            );
        }
        Ok(())
    })?;

    tracing::info!("   ✓ Membership index matches store");
    Ok(())
}

/// After twice the TTL nothing is left, in the store or in the index
async fn wait_for_purge(
    config: &SimConfig,
    store: &MessageStore<AliveMessage>,
    gate: &Gate,
    index: &MembershipIndex,
) -> Result<()> {
    tracing::info!("Phase: expiration");

    tokio::time::sleep(config.ttl + config.ttl / 2).await;
    verify_index_matches_store(store, gate, index)?;
    ensure!(store.is_empty(), "messages still visible after TTL");

    tokio::time::sleep(config.ttl).await;
    ensure!(
        store.len_including_expired() == 0,
        "{} messages not purged after twice the TTL",
        store.len_including_expired()
    );

    tracing::info!("   ✓ All messages expired and purged");
    Ok(())
}
