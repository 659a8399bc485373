//! Subscription lifecycle.
//!
//! A subscription owns a filter set and a subscription id, and routes the
//! EVENT/EOSE/CLOSED envelopes the relay reader hands it to registered
//! callbacks. It holds only a weak reference to its relay so a forgotten
//! subscription never keeps a connection alive.

use std::sync::Weak;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use nostr_core::Event;
use nostr_core::Filter;
use nostr_core::envelope::ClientMessage;
use tracing::debug;
use uuid::Uuid;

use crate::error::{ClientError, Result};
use crate::relay::Relay;

/// Callback invoked for each event delivered to this subscription.
pub type EventCallback = Box<dyn Fn(&Event) + Send + Sync>;
/// Callback invoked once when the relay signals end of stored events.
pub type EoseCallback = Box<dyn Fn() + Send + Sync>;
/// Callback invoked when the subscription closes, with a reason.
pub type ClosedCallback = Box<dyn Fn(&str) + Send + Sync>;

/// Subscription lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Created but REQ not yet sent
    Pending,
    /// REQ sent, receiving events
    Active,
    /// Relay signalled end of stored events; live events may still arrive
    EoseReceived,
    /// Failed while firing or running
    Error,
    /// Closed by client or relay
    Closed,
}

/// Generate a short random subscription id.
pub fn generate_subscription_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// A single subscription on a single relay.
pub struct Subscription {
    id: String,
    filters: Vec<Filter>,
    relay: Weak<Relay>,
    state: RwLock<SubscriptionState>,
    fired_at: Mutex<Option<Instant>>,
    first_event_at: Mutex<Option<Instant>>,
    eose_at: Mutex<Option<Instant>>,
    event_count: AtomicU64,
    on_event: Mutex<Option<EventCallback>>,
    on_eose: Mutex<Option<EoseCallback>>,
    on_closed: Mutex<Option<ClosedCallback>>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("event_count", &self.event_count())
            .finish()
    }
}

impl Subscription {
    /// Create a subscription in `Pending`. It does nothing until `fire()`.
    pub fn new(id: impl Into<String>, filters: Vec<Filter>, relay: Weak<Relay>) -> Self {
        Subscription {
            id: id.into(),
            filters,
            relay,
            state: RwLock::new(SubscriptionState::Pending),
            fired_at: Mutex::new(None),
            first_event_at: Mutex::new(None),
            eose_at: Mutex::new(None),
            event_count: AtomicU64::new(0),
            on_event: Mutex::new(None),
            on_eose: Mutex::new(None),
            on_closed: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn state(&self) -> SubscriptionState {
        *self.state.read().unwrap()
    }

    /// URL of the owning relay, when it is still alive.
    pub fn relay_url(&self) -> Option<String> {
        self.relay.upgrade().map(|r| r.url().to_string())
    }

    pub(crate) fn relay(&self) -> Option<std::sync::Arc<Relay>> {
        self.relay.upgrade()
    }

    pub fn on_event(&self, callback: EventCallback) {
        *self.on_event.lock().unwrap() = Some(callback);
    }

    pub fn on_eose(&self, callback: EoseCallback) {
        *self.on_eose.lock().unwrap() = Some(callback);
    }

    pub fn on_closed(&self, callback: ClosedCallback) {
        *self.on_closed.lock().unwrap() = Some(callback);
    }

    /// Send the REQ. Transitions `Pending` to `Active`; exactly one caller
    /// wins, every other caller gets `InvalidState`.
    pub async fn fire(&self) -> Result<()> {
        {
            let mut state = self.state.write().unwrap();
            if *state != SubscriptionState::Pending {
                return Err(ClientError::InvalidState(format!(
                    "cannot fire subscription {} in state {:?}",
                    self.id, *state
                )));
            }
            *state = SubscriptionState::Active;
        }
        *self.fired_at.lock().unwrap() = Some(Instant::now());

        let relay = self.relay.upgrade().ok_or(ClientError::NotConnected)?;
        let msg = ClientMessage::Req {
            subscription_id: self.id.clone(),
            filters: self.filters.clone(),
        };
        if let Err(e) = relay.send_message(&msg).await {
            *self.state.write().unwrap() = SubscriptionState::Error;
            self.notify_closed(&format!("fire failed: {e}"));
            return Err(e);
        }
        debug!("subscription {} fired", self.id);
        Ok(())
    }

    /// Close the subscription. Idempotent; sends CLOSE when the relay is
    /// still alive and connected.
    pub async fn close(&self) -> Result<()> {
        {
            let mut state = self.state.write().unwrap();
            if *state == SubscriptionState::Closed {
                return Ok(());
            }
            *state = SubscriptionState::Closed;
        }
        if let Some(relay) = self.relay.upgrade() {
            relay.remove_subscription(&self.id).await;
            if relay.is_connected().await {
                relay
                    .send_message(&ClientMessage::Close(self.id.clone()))
                    .await?;
            }
        }
        self.notify_closed("closed by client");
        Ok(())
    }

    /// Deliver an event received under this subscription's id.
    pub(crate) fn handle_event(&self, event: &Event) {
        match self.state() {
            SubscriptionState::Active | SubscriptionState::EoseReceived => {}
            other => {
                debug!(
                    "subscription {} dropping event in state {:?}",
                    self.id, other
                );
                return;
            }
        }
        {
            let mut first = self.first_event_at.lock().unwrap();
            if first.is_none() {
                *first = Some(Instant::now());
            }
        }
        self.event_count.fetch_add(1, Ordering::Relaxed);
        if let Some(cb) = self.on_event.lock().unwrap().as_ref() {
            cb(event);
        }
    }

    /// Record end of stored events.
    pub(crate) fn mark_eose(&self) {
        {
            let mut state = self.state.write().unwrap();
            if *state != SubscriptionState::Active {
                return;
            }
            *state = SubscriptionState::EoseReceived;
        }
        *self.eose_at.lock().unwrap() = Some(Instant::now());
        if let Some(cb) = self.on_eose.lock().unwrap().as_ref() {
            cb();
        }
    }

    /// Terminal transition driven by the relay (CLOSED envelope or
    /// disconnect). Idempotent.
    pub(crate) fn mark_closed(&self, reason: &str) {
        {
            let mut state = self.state.write().unwrap();
            if *state == SubscriptionState::Closed {
                return;
            }
            *state = SubscriptionState::Closed;
        }
        self.notify_closed(reason);
    }

    #[cfg(test)]
    pub(crate) fn force_state_for_tests(&self, state: SubscriptionState) {
        *self.state.write().unwrap() = state;
    }

    fn notify_closed(&self, reason: &str) {
        if let Some(cb) = self.on_closed.lock().unwrap().as_ref() {
            cb(reason);
        }
    }

    /// Events delivered so far.
    pub fn event_count(&self) -> u64 {
        self.event_count.load(Ordering::Relaxed)
    }

    /// Latency from `fire()` to the first delivered event.
    pub fn time_to_first_event(&self) -> Option<Duration> {
        let fired = (*self.fired_at.lock().unwrap())?;
        let first = (*self.first_event_at.lock().unwrap())?;
        Some(first.duration_since(fired))
    }

    /// Latency from `fire()` to EOSE.
    pub fn eose_latency(&self) -> Option<Duration> {
        let fired = (*self.fired_at.lock().unwrap())?;
        let eose = (*self.eose_at.lock().unwrap())?;
        Some(eose.duration_since(fired))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    fn detached(filters: Vec<Filter>) -> Subscription {
        Subscription::new(generate_subscription_id(), filters, Weak::new())
    }

    fn sample_event() -> Event {
        Event {
            id: "ab".repeat(32),
            pubkey: "cd".repeat(32),
            created_at: 1700000000,
            kind: 1,
            tags: vec![],
            content: "hello".to_string(),
            sig: "ef".repeat(64),
        }
    }

    #[test]
    fn test_generated_ids_are_short_and_distinct() {
        let a = generate_subscription_id();
        let b = generate_subscription_id();
        assert_eq!(a.len(), 8);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_fire_without_relay_fails() {
        let sub = detached(vec![Filter::new().kinds([1])]);
        assert_eq!(sub.state(), SubscriptionState::Pending);
        assert!(matches!(
            sub.fire().await,
            Err(ClientError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_double_fire_is_invalid_state() {
        let sub = detached(vec![Filter::new()]);
        // First fire claims the transition even though the send then fails.
        let _ = sub.fire().await;
        assert!(matches!(
            sub.fire().await,
            Err(ClientError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let sub = detached(vec![Filter::new()]);
        let closes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&closes);
        sub.on_closed(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        sub.close().await.unwrap();
        sub.close().await.unwrap();
        assert_eq!(sub.state(), SubscriptionState::Closed);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_events_only_delivered_while_live() {
        let sub = detached(vec![Filter::new()]);
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        sub.on_event(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        // Pending: dropped.
        sub.handle_event(&sample_event());
        assert_eq!(seen.load(Ordering::SeqCst), 0);

        *sub.state.write().unwrap() = SubscriptionState::Active;
        sub.handle_event(&sample_event());
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(sub.event_count(), 1);

        // Live events keep flowing after EOSE.
        sub.mark_eose();
        sub.handle_event(&sample_event());
        assert_eq!(seen.load(Ordering::SeqCst), 2);

        sub.mark_closed("relay went away");
        sub.handle_event(&sample_event());
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_eose_only_fires_from_active() {
        let sub = detached(vec![Filter::new()]);
        let eoses = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&eoses);
        sub.on_eose(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        sub.mark_eose();
        assert_eq!(sub.state(), SubscriptionState::Pending);
        assert_eq!(eoses.load(Ordering::SeqCst), 0);

        *sub.state.write().unwrap() = SubscriptionState::Active;
        sub.mark_eose();
        sub.mark_eose();
        assert_eq!(sub.state(), SubscriptionState::EoseReceived);
        assert_eq!(eoses.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_metrics_record_latencies() {
        let sub = detached(vec![Filter::new()]);
        assert!(sub.time_to_first_event().is_none());

        *sub.fired_at.lock().unwrap() = Some(Instant::now());
        *sub.state.write().unwrap() = SubscriptionState::Active;
        sub.handle_event(&sample_event());
        sub.mark_eose();

        assert!(sub.time_to_first_event().is_some());
        assert!(sub.eose_latency().is_some());
    }
}
