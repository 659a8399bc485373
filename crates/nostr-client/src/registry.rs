//! Process-wide subscription registry.
//!
//! Tracks every live subscription by id, optionally in named groups,
//! enforces a per-relay cap, and runs an optional health monitor that
//! flags subscriptions stuck in `Pending`, reconnects persistent ones,
//! and closes ephemeral ones once their EOSE arrives.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{ClientError, Result};
use crate::subscription::{Subscription, SubscriptionState};

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Maximum concurrent subscriptions per relay URL; 0 is unlimited.
    pub per_relay_cap: usize,
    /// How long a subscription may sit in `Pending` before the health
    /// monitor flags it.
    pub stuck_pending_timeout: Duration,
    /// Health monitor tick interval.
    pub monitor_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig {
            per_relay_cap: 0,
            stuck_pending_timeout: Duration::from_secs(30),
            monitor_interval: Duration::from_secs(10),
        }
    }
}

/// Per-registration options.
#[derive(Debug, Clone, Default)]
pub struct RegisterOptions {
    /// Named group for bulk close.
    pub group: Option<String>,
    /// Auto-close once EOSE arrives.
    pub ephemeral: bool,
    /// The health monitor reconnects this subscription's relay when it
    /// gets stuck.
    pub persistent: bool,
}

struct Entry {
    sub: Arc<Subscription>,
    group: Option<String>,
    ephemeral: bool,
    persistent: bool,
    registered_at: Instant,
    stuck_flagged: bool,
}

#[derive(Default)]
struct Counters {
    total_registered: AtomicU64,
    ephemeral_closed: AtomicU64,
    stuck_pending: AtomicU64,
    auto_reconnects: AtomicU64,
}

struct RegistryInner {
    config: RegistryConfig,
    entries: Mutex<HashMap<String, Entry>>,
    counters: Counters,
}

/// Registry statistics snapshot.
#[derive(Debug, Clone, Default)]
pub struct RegistryStats {
    pub total_registered: u64,
    pub active: usize,
    pub ephemeral_closed: u64,
    pub stuck_pending: u64,
    pub auto_reconnects: u64,
    pub avg_time_to_first_event: Option<Duration>,
    pub avg_eose_latency: Option<Duration>,
}

/// Subscription registry. `global()` returns the process-wide instance;
/// independent instances are constructible for tests.
pub struct SubscriptionRegistry {
    inner: Arc<RegistryInner>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    pub fn with_config(config: RegistryConfig) -> Self {
        SubscriptionRegistry {
            inner: Arc::new(RegistryInner {
                config,
                entries: Mutex::new(HashMap::new()),
                counters: Counters::default(),
            }),
            monitor: Mutex::new(None),
        }
    }

    /// The process-wide registry.
    pub fn global() -> &'static SubscriptionRegistry {
        static REGISTRY: OnceLock<SubscriptionRegistry> = OnceLock::new();
        REGISTRY.get_or_init(SubscriptionRegistry::new)
    }

    /// Register a subscription under its own id. Fails with `InvalidState`
    /// when the per-relay cap is already reached.
    pub fn register(&self, sub: Arc<Subscription>) -> Result<String> {
        self.register_with(sub, RegisterOptions::default())
    }

    pub fn register_with(&self, sub: Arc<Subscription>, options: RegisterOptions) -> Result<String> {
        let id = sub.id().to_string();
        let mut entries = self.inner.entries.lock().unwrap();
        if entries.contains_key(&id) {
            return Err(ClientError::InvalidState(format!(
                "subscription {id} already registered"
            )));
        }
        let cap = self.inner.config.per_relay_cap;
        if cap > 0
            && let Some(url) = sub.relay_url()
        {
            let on_relay = entries
                .values()
                .filter(|e| e.sub.relay_url().as_deref() == Some(url.as_str()))
                .count();
            if on_relay >= cap {
                return Err(ClientError::InvalidState(format!(
                    "relay {url} is at its cap of {cap} subscriptions"
                )));
            }
        }
        entries.insert(
            id.clone(),
            Entry {
                sub,
                group: options.group,
                ephemeral: options.ephemeral,
                persistent: options.persistent,
                registered_at: Instant::now(),
                stuck_flagged: false,
            },
        );
        self.inner
            .counters
            .total_registered
            .fetch_add(1, Ordering::Relaxed);
        Ok(id)
    }

    /// Drop a registration. Returns the subscription if it was present.
    pub fn unregister(&self, id: &str) -> Option<Arc<Subscription>> {
        self.inner
            .entries
            .lock()
            .unwrap()
            .remove(id)
            .map(|e| e.sub)
    }

    /// Look up a registered subscription, closed ones included.
    pub fn get(&self, id: &str) -> Option<Arc<Subscription>> {
        self.inner
            .entries
            .lock()
            .unwrap()
            .get(id)
            .map(|e| Arc::clone(&e.sub))
    }

    /// Close and unregister every subscription in a group. Returns how
    /// many were closed.
    pub async fn close_group(&self, group: &str) -> usize {
        let members: Vec<Arc<Subscription>> = {
            let mut entries = self.inner.entries.lock().unwrap();
            let ids: Vec<String> = entries
                .iter()
                .filter(|(_, e)| e.group.as_deref() == Some(group))
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| entries.remove(&id).map(|e| e.sub))
                .collect()
        };
        let count = members.len();
        for sub in members {
            if let Err(e) = sub.close().await {
                debug!("closing {} in group {group} failed: {e}", sub.id());
            }
        }
        info!("closed group {group} ({count} subscriptions)");
        count
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.lock().unwrap().is_empty()
    }

    /// Statistics over current registrations plus lifetime counters.
    pub fn stats(&self) -> RegistryStats {
        let entries = self.inner.entries.lock().unwrap();
        let active = entries
            .values()
            .filter(|e| {
                matches!(
                    e.sub.state(),
                    SubscriptionState::Active | SubscriptionState::EoseReceived
                )
            })
            .count();
        let ttfe: Vec<Duration> = entries
            .values()
            .filter_map(|e| e.sub.time_to_first_event())
            .collect();
        let eose: Vec<Duration> = entries
            .values()
            .filter_map(|e| e.sub.eose_latency())
            .collect();
        drop(entries);

        let avg = |samples: &[Duration]| {
            if samples.is_empty() {
                None
            } else {
                Some(samples.iter().sum::<Duration>() / samples.len() as u32)
            }
        };
        RegistryStats {
            total_registered: self.inner.counters.total_registered.load(Ordering::Relaxed),
            active,
            ephemeral_closed: self.inner.counters.ephemeral_closed.load(Ordering::Relaxed),
            stuck_pending: self.inner.counters.stuck_pending.load(Ordering::Relaxed),
            auto_reconnects: self.inner.counters.auto_reconnects.load(Ordering::Relaxed),
            avg_time_to_first_event: avg(&ttfe),
            avg_eose_latency: avg(&eose),
        }
    }

    /// Start the periodic health monitor. A second call replaces the
    /// previous task.
    pub fn start_health_monitor(&self) {
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(inner.config.monitor_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                monitor_tick(&inner).await;
            }
        });
        if let Some(previous) = self.monitor.lock().unwrap().replace(handle) {
            previous.abort();
        }
    }

    pub fn stop_health_monitor(&self) {
        if let Some(handle) = self.monitor.lock().unwrap().take() {
            handle.abort();
        }
    }

    /// One monitor pass, exposed for deterministic tests.
    pub async fn run_health_check(&self) {
        monitor_tick(&self.inner).await;
    }
}

impl Drop for SubscriptionRegistry {
    fn drop(&mut self) {
        if let Some(handle) = self.monitor.lock().unwrap().take() {
            handle.abort();
        }
    }
}

async fn monitor_tick(inner: &RegistryInner) {
    // Snapshot under the lock, act outside it.
    let mut stuck: Vec<Arc<Subscription>> = Vec::new();
    let mut ephemeral_done: Vec<String> = Vec::new();
    let mut drop_closed: Vec<String> = Vec::new();
    {
        let mut entries = inner.entries.lock().unwrap();
        for (id, entry) in entries.iter_mut() {
            match entry.sub.state() {
                SubscriptionState::Pending => {
                    if entry.registered_at.elapsed() >= inner.config.stuck_pending_timeout
                        && !entry.stuck_flagged
                    {
                        entry.stuck_flagged = true;
                        inner.counters.stuck_pending.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            "subscription {id} stuck in Pending for {:?}",
                            entry.registered_at.elapsed()
                        );
                        if entry.persistent {
                            stuck.push(Arc::clone(&entry.sub));
                        }
                    }
                }
                SubscriptionState::EoseReceived if entry.ephemeral => {
                    ephemeral_done.push(id.clone());
                }
                SubscriptionState::Closed | SubscriptionState::Error => {
                    drop_closed.push(id.clone());
                }
                _ => {}
            }
        }
    }

    for sub in stuck {
        let Some(relay) = sub.relay() else { continue };
        if relay.is_connected().await {
            continue;
        }
        info!(
            "reconnecting {} for persistent subscription {}",
            relay.url(),
            sub.id()
        );
        match relay.connect().await {
            Ok(()) => {
                inner
                    .counters
                    .auto_reconnects
                    .fetch_add(1, Ordering::Relaxed);
                if let Err(e) = sub.fire().await {
                    debug!("refire of {} failed: {e}", sub.id());
                }
            }
            Err(e) => warn!("reconnect of {} failed: {e}", relay.url()),
        }
    }

    for id in ephemeral_done {
        let sub = {
            let mut entries = inner.entries.lock().unwrap();
            entries.remove(&id).map(|e| e.sub)
        };
        if let Some(sub) = sub {
            if let Err(e) = sub.close().await {
                debug!("auto-close of ephemeral {id} failed: {e}");
            }
            inner
                .counters
                .ephemeral_closed
                .fetch_add(1, Ordering::Relaxed);
            debug!("ephemeral subscription {id} closed after EOSE");
        }
    }

    // Closed subscriptions stay queryable until someone unregisters them,
    // but ones that errored out are pruned here.
    let mut entries = inner.entries.lock().unwrap();
    for id in drop_closed {
        if let Some(entry) = entries.get(&id)
            && entry.sub.state() == SubscriptionState::Error
        {
            entries.remove(&id);
        }
    }
}
