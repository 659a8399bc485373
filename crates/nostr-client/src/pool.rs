//! Relay pool: a URL-keyed set of relays with broadcast query,
//! fan-in subscriptions, and pool-wide hooks.
//!
//! The pool owns no protocol state of its own. Its shared state is the
//! relay map, the live multi-subscriptions, and the hook table; everything
//! else lives in the per-relay tasks.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use nostr_core::Event;
use nostr_core::Filter;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};
use url::Url;

use crate::bus::EventBus;
use crate::error::{ClientError, Result};
use crate::relay::{AuthSigner, Relay, RelayConfig};
use crate::subscription::{Subscription, generate_subscription_id};

/// Cache lookup tried before any relay is queried. `None` or an empty
/// result means miss.
pub type CacheQueryHook = Arc<dyn Fn(&[Filter]) -> Option<Vec<Event>> + Send + Sync>;
/// Receives every deduplicated query batch before it is returned.
pub type EventSinkHook = Arc<dyn Fn(&[Event]) + Send + Sync>;
/// `(relay_url, event)` callback for fan-in subscriptions.
pub type MultiEventCallback = Arc<dyn Fn(&str, &Event) + Send + Sync>;
/// `(relay_url)` callback invoked per relay EOSE.
pub type MultiEoseCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Deadline for broadcast queries; partial results on expiry.
    pub query_timeout: Duration,
    /// Capacity of the query aggregation channel.
    pub aggregate_buffer: usize,
    /// Configuration applied to every relay the pool constructs.
    pub relay: RelayConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            query_timeout: Duration::from_secs(10),
            aggregate_buffer: 256,
            relay: RelayConfig::default(),
        }
    }
}

/// One logical subscription fanned out across every connected relay.
/// Relays joining the pool later are added automatically.
pub struct MultiSubscription {
    id: String,
    filters: Vec<Filter>,
    on_event: MultiEventCallback,
    on_eose: MultiEoseCallback,
    subs: StdMutex<HashMap<String, Arc<Subscription>>>,
    closed: AtomicBool,
}

impl MultiSubscription {
    fn new(
        filters: Vec<Filter>,
        on_event: MultiEventCallback,
        on_eose: MultiEoseCallback,
    ) -> Self {
        MultiSubscription {
            id: generate_subscription_id(),
            filters,
            on_event,
            on_eose,
            subs: StdMutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    /// How many relays currently carry this subscription.
    pub fn relay_count(&self) -> usize {
        self.subs.lock().unwrap().len()
    }

    /// Open this subscription on one relay. Replaces a dead previous
    /// subscription for the same relay; a live one is kept.
    async fn join(&self, relay: &Arc<Relay>) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        let key = relay.url().to_string();
        {
            let subs = self.subs.lock().unwrap();
            if let Some(existing) = subs.get(&key)
                && matches!(
                    existing.state(),
                    crate::subscription::SubscriptionState::Pending
                        | crate::subscription::SubscriptionState::Active
                        | crate::subscription::SubscriptionState::EoseReceived
                )
            {
                return Ok(());
            }
        }
        let sub = Arc::new(Subscription::new(
            generate_subscription_id(),
            self.filters.clone(),
            Arc::downgrade(relay),
        ));
        let url = key.clone();
        let on_event = Arc::clone(&self.on_event);
        sub.on_event(Box::new(move |event| on_event(&url, event)));
        let url = key.clone();
        let on_eose = Arc::clone(&self.on_eose);
        sub.on_eose(Box::new(move || on_eose(&url)));

        relay.attach_subscription(Arc::clone(&sub)).await?;
        self.subs.lock().unwrap().insert(key, sub);
        Ok(())
    }

    /// Close every per-relay subscription. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let subs: Vec<Arc<Subscription>> = {
            let mut map = self.subs.lock().unwrap();
            map.drain().map(|(_, sub)| sub).collect()
        };
        for sub in subs {
            if let Err(e) = sub.close().await {
                debug!("closing fan-in member {} failed: {e}", sub.id());
            }
        }
    }
}

/// A set of relays addressed by URL.
pub struct RelayPool {
    config: PoolConfig,
    relays: Mutex<HashMap<String, Arc<Relay>>>,
    multi_subs: Mutex<Vec<Arc<MultiSubscription>>>,
    cache_query: StdMutex<Option<CacheQueryHook>>,
    event_sink: StdMutex<Option<EventSinkHook>>,
    auth_signer: StdMutex<Option<AuthSigner>>,
}

impl Default for RelayPool {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayPool {
    pub fn new() -> Self {
        Self::with_config(PoolConfig::default())
    }

    pub fn with_config(config: PoolConfig) -> Self {
        RelayPool {
            config,
            relays: Mutex::new(HashMap::new()),
            multi_subs: Mutex::new(Vec::new()),
            cache_query: StdMutex::new(None),
            event_sink: StdMutex::new(None),
            auth_signer: StdMutex::new(None),
        }
    }

    /// Short-circuit queries against a local cache.
    pub fn set_cache_query(&self, hook: CacheQueryHook) {
        *self.cache_query.lock().unwrap() = Some(hook);
    }

    /// Persist every query batch automatically.
    pub fn set_event_sink(&self, hook: EventSinkHook) {
        *self.event_sink.lock().unwrap() = Some(hook);
    }

    /// Install a NIP-42 signer on every current and future relay.
    pub async fn set_auth_handler(&self, signer: AuthSigner) {
        *self.auth_signer.lock().unwrap() = Some(Arc::clone(&signer));
        for relay in self.relays.lock().await.values() {
            relay.set_auth_handler(Arc::clone(&signer));
        }
    }

    fn normalize(url: &str) -> Result<String> {
        let parsed = Url::parse(url)?;
        Ok(parsed.to_string())
    }

    /// Add a relay in `Disconnected`. Idempotent: adding a known URL
    /// returns the existing relay.
    pub async fn add_relay(&self, url: &str) -> Result<Arc<Relay>> {
        let key = Self::normalize(url)?;
        {
            let relays = self.relays.lock().await;
            if let Some(existing) = relays.get(&key) {
                return Ok(Arc::clone(existing));
            }
        }
        let relay = Arc::new(Relay::with_config(url, self.config.relay.clone())?);
        if let Some(signer) = self.auth_signer.lock().unwrap().clone() {
            relay.set_auth_handler(signer);
        }
        self.relays
            .lock()
            .await
            .insert(key.clone(), Arc::clone(&relay));
        info!("relay added to pool: {key}");
        EventBus::global().emit("relay::added", &key);
        Ok(relay)
    }

    /// Disconnect and drop a relay. Returns whether it was present.
    pub async fn remove_relay(&self, url: &str) -> Result<bool> {
        let key = Self::normalize(url)?;
        let relay = self.relays.lock().await.remove(&key);
        let Some(relay) = relay else {
            return Ok(false);
        };
        relay.disconnect().await?;
        for multi in self.multi_subs.lock().await.iter() {
            multi.subs.lock().unwrap().remove(&key);
        }
        info!("relay removed from pool: {key}");
        EventBus::global().emit("relay::removed", &key);
        Ok(true)
    }

    /// Reconcile the pool against a target URL list. Returns the URLs
    /// actually added and removed.
    pub async fn sync_relays(&self, urls: &[String]) -> Result<(Vec<String>, Vec<String>)> {
        let mut target = HashSet::new();
        for url in urls {
            target.insert(Self::normalize(url)?);
        }
        let current: HashSet<String> = self.relays.lock().await.keys().cloned().collect();

        let mut added = Vec::new();
        for url in target.difference(&current) {
            self.add_relay(url).await?;
            added.push(url.clone());
        }
        let mut removed = Vec::new();
        for url in current.difference(&target) {
            self.remove_relay(url).await?;
            removed.push(url.clone());
        }
        Ok((added, removed))
    }

    /// Reconcile against a URL provider callback.
    pub async fn sync_with_provider<F>(&self, provider: F) -> Result<(Vec<String>, Vec<String>)>
    where
        F: Fn(&mut Vec<String>),
    {
        let mut urls = Vec::new();
        provider(&mut urls);
        self.sync_relays(&urls).await
    }

    pub async fn relay(&self, url: &str) -> Option<Arc<Relay>> {
        let key = Self::normalize(url).ok()?;
        self.relays.lock().await.get(&key).cloned()
    }

    pub async fn urls(&self) -> Vec<String> {
        self.relays.lock().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.relays.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.relays.lock().await.is_empty()
    }

    async fn snapshot(&self) -> Vec<Arc<Relay>> {
        self.relays.lock().await.values().cloned().collect()
    }

    async fn connected_relays(&self) -> Vec<Arc<Relay>> {
        let mut connected = Vec::new();
        for relay in self.snapshot().await {
            if relay.is_connected().await {
                connected.push(relay);
            }
        }
        connected
    }

    /// Connect every relay in parallel. Ok only when all of them reach
    /// `Connected`; the ones that did connect stay connected either way.
    pub async fn connect_all(&self) -> Result<()> {
        let relays = self.snapshot().await;
        let results = futures::future::join_all(relays.iter().map(|relay| async move {
            match relay.connect().await {
                Ok(()) => Ok(()),
                // A concurrently-connected relay counts as success.
                Err(_) if relay.is_connected().await => Ok(()),
                Err(e) => Err(format!("{}: {e}", relay.url())),
            }
        }))
        .await;

        for relay in &relays {
            if relay.is_connected().await {
                self.join_multi_subs(relay).await;
            }
        }

        let failures: Vec<String> = results.into_iter().filter_map(|r| r.err()).collect();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(ClientError::ConnectionFailed(failures.join("; ")))
        }
    }

    /// Connect one relay and join it into live fan-in subscriptions.
    pub async fn connect_relay(&self, url: &str) -> Result<()> {
        let relay = self
            .relay(url)
            .await
            .ok_or_else(|| ClientError::InvalidState(format!("relay {url} not in pool")))?;
        relay.connect().await?;
        self.join_multi_subs(&relay).await;
        Ok(())
    }

    pub async fn disconnect_all(&self) {
        for relay in self.snapshot().await {
            if let Err(e) = relay.disconnect().await {
                warn!("disconnect of {} failed: {e}", relay.url());
            }
        }
    }

    async fn join_multi_subs(&self, relay: &Arc<Relay>) {
        let mut multis = self.multi_subs.lock().await;
        multis.retain(|m| !m.is_closed());
        for multi in multis.iter() {
            if let Err(e) = multi.join(relay).await {
                warn!(
                    "joining fan-in subscription {} on {} failed: {e}",
                    multi.id(),
                    relay.url()
                );
            }
        }
    }

    /// Broadcast query across every connected relay, deduplicated by
    /// event id. Returns whatever arrived when the deadline fires.
    pub async fn query(&self, filters: Vec<Filter>) -> Result<Vec<Event>> {
        self.query_with_timeout(filters, self.config.query_timeout)
            .await
    }

    pub async fn query_with_timeout(
        &self,
        filters: Vec<Filter>,
        deadline: Duration,
    ) -> Result<Vec<Event>> {
        if let Some(hook) = self.cache_query.lock().unwrap().clone()
            && let Some(events) = hook(&filters)
            && !events.is_empty()
        {
            debug!("query served from cache: {} events", events.len());
            return Ok(events);
        }

        let relays = self.connected_relays().await;
        let (tx, mut rx) = mpsc::channel::<Event>(self.config.aggregate_buffer);
        for relay in relays {
            let tx = tx.clone();
            let filters = filters.clone();
            tokio::spawn(async move {
                match relay.query_with_timeout(filters, deadline).await {
                    Ok(events) => {
                        for event in events {
                            if tx.send(event).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(e) => debug!("query on {} failed: {e}", relay.url()),
                }
            });
        }
        drop(tx);

        let mut seen = HashSet::new();
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            if seen.insert(event.id.clone()) {
                events.push(event);
            }
        }

        if let Some(sink) = self.event_sink.lock().unwrap().clone() {
            sink(&events);
        }
        Ok(events)
    }

    /// Subscribe on every connected relay. `on_event(relay_url, event)`
    /// fires for each event from any relay; `on_eose(relay_url)` once per
    /// relay. Relays connected through the pool later join automatically.
    pub async fn subscribe_multi(
        &self,
        filters: Vec<Filter>,
        on_event: MultiEventCallback,
        on_eose: MultiEoseCallback,
    ) -> Result<Arc<MultiSubscription>> {
        let multi = Arc::new(MultiSubscription::new(filters, on_event, on_eose));
        for relay in self.connected_relays().await {
            if let Err(e) = multi.join(&relay).await {
                warn!(
                    "fan-in subscribe on {} failed: {e}; continuing",
                    relay.url()
                );
            }
        }
        self.multi_subs.lock().await.push(Arc::clone(&multi));
        Ok(multi)
    }
}
