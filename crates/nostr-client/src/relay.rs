//! Relay client: one WebSocket connection to one relay.
//!
//! A connected relay runs two background tasks. The reader drains frames,
//! parses envelopes, and routes them: OK to pending publishes, EVENT/EOSE/
//! CLOSED to subscriptions, AUTH to the installed signer. The writer
//! serializes outbound envelopes from a bounded channel. The relay never
//! reconnects on its own; that is pool or caller policy.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use nostr_core::envelope::{ClientMessage, RelayMessage};
use nostr_core::event::{Event, EventTemplate, KIND_CLIENT_AUTH, Tag, timestamp_now};
use nostr_core::filter::Filter;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};
use url::Url;

use crate::bus::EventBus;
use crate::error::{ClientError, Result};
use crate::subscription::{Subscription, generate_subscription_id};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// NIP-42 signer: fills in the pubkey, computes the id, and signs.
pub type AuthSigner = Arc<dyn Fn(EventTemplate) -> Result<Event> + Send + Sync>;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected
    Disconnected,
    /// Connection attempt in progress
    Connecting,
    /// Connected and processing messages
    Connected,
    /// Connection lost without a user disconnect
    Error,
}

/// Relay client configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// WebSocket connect timeout
    pub connect_timeout: Duration,
    /// How long `publish` waits for the OK envelope
    pub publish_timeout: Duration,
    /// How long `query_sync` waits for EOSE
    pub query_timeout: Duration,
    /// Outbound channel capacity
    pub outbound_buffer: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            connect_timeout: Duration::from_secs(10),
            publish_timeout: Duration::from_secs(10),
            query_timeout: Duration::from_secs(30),
            outbound_buffer: 64,
        }
    }
}

/// Outcome of a publish, resolved by the relay's OK envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishConfirmation {
    pub event_id: String,
    pub accepted: bool,
    pub message: String,
}

/// Everything the reader task needs, cloned out of the relay so the task
/// holds no strong reference back to it.
struct ReaderCtx {
    url: String,
    state: Arc<RwLock<ConnectionState>>,
    outbound: Arc<Mutex<Option<mpsc::Sender<Message>>>>,
    pending_confirmations: Arc<Mutex<HashMap<String, oneshot::Sender<PublishConfirmation>>>>,
    subscriptions: Arc<Mutex<HashMap<String, Arc<Subscription>>>>,
    auth_signer: Arc<StdMutex<Option<AuthSigner>>>,
    verify_events: Arc<AtomicBool>,
}

/// A client connection to a single relay.
pub struct Relay {
    url: Url,
    config: RelayConfig,
    state: Arc<RwLock<ConnectionState>>,
    outbound: Arc<Mutex<Option<mpsc::Sender<Message>>>>,
    pending_confirmations: Arc<Mutex<HashMap<String, oneshot::Sender<PublishConfirmation>>>>,
    subscriptions: Arc<Mutex<HashMap<String, Arc<Subscription>>>>,
    auth_signer: Arc<StdMutex<Option<AuthSigner>>>,
    verify_events: Arc<AtomicBool>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    writer_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay").field("url", &self.url).finish()
    }
}

impl Relay {
    /// Create a relay for a `ws://` or `wss://` URL, in `Disconnected`.
    pub fn new(url: &str) -> Result<Self> {
        Self::with_config(url, RelayConfig::default())
    }

    pub fn with_config(url: &str, config: RelayConfig) -> Result<Self> {
        let url = Url::parse(url)?;
        match url.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(ClientError::InvalidUrl(format!(
                    "unsupported scheme: {other}"
                )));
            }
        }
        Ok(Relay {
            url,
            config,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outbound: Arc::new(Mutex::new(None)),
            pending_confirmations: Arc::new(Mutex::new(HashMap::new())),
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
            auth_signer: Arc::new(StdMutex::new(None)),
            verify_events: Arc::new(AtomicBool::new(false)),
            reader_task: Mutex::new(None),
            writer_task: Mutex::new(None),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub async fn is_connected(&self) -> bool {
        *self.state.read().await == ConnectionState::Connected
    }

    /// Verify the Schnorr signature of every received event, dropping
    /// failures. Off by default.
    pub fn set_verify_events(&self, on: bool) {
        self.verify_events.store(on, Ordering::Relaxed);
    }

    /// Install the NIP-42 signer used to answer AUTH challenges.
    pub fn set_auth_handler(&self, signer: AuthSigner) {
        *self.auth_signer.lock().unwrap() = Some(signer);
    }

    /// Open the WebSocket connection and start the reader and writer tasks.
    pub async fn connect(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            match *state {
                ConnectionState::Connected | ConnectionState::Connecting => {
                    return Err(ClientError::InvalidState(format!(
                        "connect while {:?}",
                        *state
                    )));
                }
                _ => *state = ConnectionState::Connecting,
            }
        }
        info!("connecting to relay: {}", self.url);

        let ws = match timeout(self.config.connect_timeout, connect_async(self.url.as_str()))
            .await
        {
            Ok(Ok((ws, _response))) => ws,
            Ok(Err(e)) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ClientError::ConnectionFailed(e.to_string()));
            }
            Err(_) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ClientError::Timeout(format!(
                    "connect to {} timed out after {:?}",
                    self.url, self.config.connect_timeout
                )));
            }
        };

        let (sink, stream) = ws.split();
        let (tx, rx) = mpsc::channel(self.config.outbound_buffer);
        *self.outbound.lock().await = Some(tx);
        *self.writer_task.lock().await =
            Some(tokio::spawn(writer_loop(sink, rx, self.url.to_string())));

        let ctx = ReaderCtx {
            url: self.url.to_string(),
            state: Arc::clone(&self.state),
            outbound: Arc::clone(&self.outbound),
            pending_confirmations: Arc::clone(&self.pending_confirmations),
            subscriptions: Arc::clone(&self.subscriptions),
            auth_signer: Arc::clone(&self.auth_signer),
            verify_events: Arc::clone(&self.verify_events),
        };
        *self.reader_task.lock().await = Some(tokio::spawn(reader_loop(ctx, stream)));

        *self.state.write().await = ConnectionState::Connected;
        info!("connected to relay: {}", self.url);
        Ok(())
    }

    /// Close the connection. Pending publishes are cancelled; live
    /// subscriptions observe a closed notification. Idempotent.
    pub async fn disconnect(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == ConnectionState::Disconnected {
                return Ok(());
            }
            *state = ConnectionState::Disconnected;
        }
        if let Some(handle) = self.reader_task.lock().await.take() {
            handle.abort();
        }
        if let Some(tx) = self.outbound.lock().await.take() {
            let _ = tx.send(Message::Close(None)).await;
        }
        if let Some(handle) = self.writer_task.lock().await.take() {
            let abort = handle.abort_handle();
            if timeout(Duration::from_secs(1), handle).await.is_err() {
                abort.abort();
            }
        }
        // Dropping the oneshot senders resolves waiting publishes as
        // cancelled.
        self.pending_confirmations.lock().await.clear();
        let subs: Vec<Arc<Subscription>> = self
            .subscriptions
            .lock()
            .await
            .drain()
            .map(|(_, sub)| sub)
            .collect();
        for sub in subs {
            sub.mark_closed("relay disconnected");
        }
        info!("disconnected from relay: {}", self.url);
        Ok(())
    }

    /// Serialize an envelope onto the outbound channel.
    pub(crate) async fn send_message(&self, msg: &ClientMessage) -> Result<()> {
        let sender = self
            .outbound
            .lock()
            .await
            .clone()
            .ok_or(ClientError::NotConnected)?;
        let json = msg.to_json()?;
        sender
            .send(Message::Text(json.into()))
            .await
            .map_err(|_| ClientError::NotConnected)?;
        Ok(())
    }

    pub(crate) async fn remove_subscription(&self, id: &str) {
        self.subscriptions.lock().await.remove(id);
    }

    /// Publish an event and wait for the relay's OK envelope. Concurrent
    /// publishes multiplex by event id.
    pub async fn publish(&self, event: &Event) -> Result<PublishConfirmation> {
        self.publish_with_timeout(event, self.config.publish_timeout)
            .await
    }

    pub async fn publish_with_timeout(
        &self,
        event: &Event,
        deadline: Duration,
    ) -> Result<PublishConfirmation> {
        if !self.is_connected().await {
            return Err(ClientError::NotConnected);
        }
        let (tx, rx) = oneshot::channel();
        self.pending_confirmations
            .lock()
            .await
            .insert(event.id.clone(), tx);

        if let Err(e) = self.send_message(&ClientMessage::Event(event.clone())).await {
            self.pending_confirmations.lock().await.remove(&event.id);
            return Err(e);
        }

        match timeout(deadline, rx).await {
            Ok(Ok(confirmation)) => Ok(confirmation),
            Ok(Err(_)) => Err(ClientError::Cancelled(format!(
                "connection closed before OK for {}",
                event.id
            ))),
            Err(_) => {
                self.pending_confirmations.lock().await.remove(&event.id);
                Err(ClientError::Timeout(format!(
                    "no OK for {} within {deadline:?}",
                    event.id
                )))
            }
        }
    }

    /// Open a subscription and send its REQ.
    pub async fn subscribe(self: &Arc<Self>, filters: Vec<Filter>) -> Result<Arc<Subscription>> {
        self.subscribe_with_id(generate_subscription_id(), filters)
            .await
    }

    pub async fn subscribe_with_id(
        self: &Arc<Self>,
        id: String,
        filters: Vec<Filter>,
    ) -> Result<Arc<Subscription>> {
        let sub = Arc::new(Subscription::new(id, filters, Arc::downgrade(self)));
        self.attach_subscription(Arc::clone(&sub)).await?;
        Ok(sub)
    }

    /// Register a pre-built subscription (callbacks already wired) and
    /// fire it. Use this instead of `subscribe` when callbacks must be in
    /// place before the REQ goes out. The subscription must hold a weak
    /// reference to this relay.
    pub async fn attach_subscription(&self, sub: Arc<Subscription>) -> Result<()> {
        if !self.is_connected().await {
            return Err(ClientError::NotConnected);
        }
        self.subscriptions
            .lock()
            .await
            .insert(sub.id().to_string(), Arc::clone(&sub));
        if let Err(e) = sub.fire().await {
            self.subscriptions.lock().await.remove(sub.id());
            return Err(e);
        }
        Ok(())
    }

    /// One-shot query: a temporary subscription collected until EOSE.
    /// Returns whatever arrived if the deadline fires first.
    pub async fn query_sync(self: &Arc<Self>, filters: Vec<Filter>) -> Result<Vec<Event>> {
        self.query_with_timeout(filters, self.config.query_timeout)
            .await
    }

    pub async fn query_with_timeout(
        self: &Arc<Self>,
        filters: Vec<Filter>,
        deadline: Duration,
    ) -> Result<Vec<Event>> {
        let sub = Arc::new(Subscription::new(
            generate_subscription_id(),
            filters,
            Arc::downgrade(self),
        ));

        let (tx, mut rx) = mpsc::unbounded_channel::<Option<Event>>();
        let event_tx = tx.clone();
        sub.on_event(Box::new(move |event| {
            let _ = event_tx.send(Some(event.clone()));
        }));
        let eose_tx = tx.clone();
        sub.on_eose(Box::new(move || {
            let _ = eose_tx.send(None);
        }));
        sub.on_closed(Box::new(move |_| {
            let _ = tx.send(None);
        }));

        self.attach_subscription(Arc::clone(&sub)).await?;

        let mut events = Vec::new();
        let finished = timeout(deadline, async {
            while let Some(item) = rx.recv().await {
                match item {
                    Some(event) => events.push(event),
                    None => break,
                }
            }
        })
        .await;
        if finished.is_err() {
            debug!(
                "query on {} hit {deadline:?} deadline with {} events",
                self.url,
                events.len()
            );
        }

        let _ = sub.close().await;
        Ok(events)
    }
}

async fn writer_loop(
    mut sink: SplitSink<WsStream, Message>,
    mut rx: mpsc::Receiver<Message>,
    url: String,
) {
    while let Some(msg) = rx.recv().await {
        let is_close = matches!(msg, Message::Close(_));
        if let Err(e) = sink.send(msg).await {
            debug!("write to {url} failed: {e}");
            return;
        }
        if is_close {
            break;
        }
    }
    let _ = sink.close().await;
}

async fn reader_loop(ctx: ReaderCtx, mut stream: SplitStream<WsStream>) {
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => handle_frame(&ctx, text.as_str()).await,
            Some(Ok(Message::Ping(data))) => {
                if let Some(tx) = ctx.outbound.lock().await.clone() {
                    let _ = tx.send(Message::Pong(data)).await;
                }
            }
            Some(Ok(Message::Close(_))) => {
                info!("relay {} closed the connection", ctx.url);
                break;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                warn!("websocket error from {}: {e}", ctx.url);
                break;
            }
            None => break,
        }
    }
    teardown(&ctx, "connection lost").await;
}

/// Transition to `Error` after an unexpected connection loss, cancelling
/// every pending operation. A user disconnect has already left the state
/// at `Disconnected`; in that case this is a no-op.
async fn teardown(ctx: &ReaderCtx, reason: &str) {
    {
        let mut state = ctx.state.write().await;
        if *state == ConnectionState::Disconnected {
            return;
        }
        *state = ConnectionState::Error;
    }
    ctx.outbound.lock().await.take();
    ctx.pending_confirmations.lock().await.clear();
    let subs: Vec<Arc<Subscription>> = ctx
        .subscriptions
        .lock()
        .await
        .drain()
        .map(|(_, sub)| sub)
        .collect();
    for sub in subs {
        sub.mark_closed(reason);
    }
    warn!("relay {} entered error state: {reason}", ctx.url);
    EventBus::global().emit(&format!("error::{}", ctx.url), reason);
}

async fn handle_frame(ctx: &ReaderCtx, text: &str) {
    let msg = match RelayMessage::from_json(text) {
        Ok(msg) => msg,
        Err(e) => {
            debug!("dropping unparseable frame from {}: {e}", ctx.url);
            return;
        }
    };
    match msg {
        RelayMessage::Event {
            subscription_id,
            event,
        } => {
            if ctx.verify_events.load(Ordering::Relaxed)
                && !event.verify().unwrap_or(false)
            {
                warn!(
                    "dropping event {} from {}: signature verification failed",
                    event.id, ctx.url
                );
                return;
            }
            // Clone out of the table so user callbacks never run under
            // the subscriptions lock.
            let sub = ctx.subscriptions.lock().await.get(&subscription_id).cloned();
            match sub {
                Some(sub) => sub.handle_event(&event),
                None => debug!(
                    "event for unknown subscription {subscription_id} from {}",
                    ctx.url
                ),
            }
            if let Ok(json) = event.to_json() {
                EventBus::global().emit(&format!("event::kind::{}", event.kind), &json);
            }
        }
        RelayMessage::Ok {
            event_id,
            accepted,
            message,
        } => {
            let confirmation = PublishConfirmation {
                event_id: event_id.clone(),
                accepted,
                message: message.clone(),
            };
            if let Some(tx) = ctx.pending_confirmations.lock().await.remove(&event_id) {
                let _ = tx.send(confirmation);
            }
            let payload = if accepted {
                "accepted".to_string()
            } else {
                format!("rejected: {message}")
            };
            EventBus::global().emit(&format!("ok::{event_id}"), &payload);
        }
        RelayMessage::Eose(subscription_id) => {
            let sub = ctx.subscriptions.lock().await.get(&subscription_id).cloned();
            if let Some(sub) = sub {
                sub.mark_eose();
            }
            EventBus::global().emit(&format!("eose::{subscription_id}"), &ctx.url);
        }
        RelayMessage::Closed {
            subscription_id,
            message,
        } => {
            if let Some(sub) = ctx.subscriptions.lock().await.remove(&subscription_id) {
                sub.mark_closed(&message);
            }
        }
        RelayMessage::Notice(message) => {
            warn!("notice from {}: {message}", ctx.url);
            EventBus::global().emit(&format!("notice::{}", ctx.url), &message);
        }
        RelayMessage::Auth(challenge) => {
            answer_auth_challenge(ctx, &challenge).await;
        }
        RelayMessage::Count {
            subscription_id,
            count,
        } => {
            debug!(
                "count for {subscription_id} from {}: {count}",
                ctx.url
            );
        }
        RelayMessage::Unknown { label, .. } => {
            debug!("ignoring {label} from {}", ctx.url);
        }
    }
}

/// NIP-42: sign a kind-22242 event carrying the relay URL and challenge,
/// and send it back as an AUTH envelope.
async fn answer_auth_challenge(ctx: &ReaderCtx, challenge: &str) {
    let signer = match ctx.auth_signer.lock().unwrap().clone() {
        Some(signer) => signer,
        None => {
            debug!("AUTH challenge from {} but no signer installed", ctx.url);
            return;
        }
    };
    let template = EventTemplate {
        created_at: timestamp_now(),
        kind: KIND_CLIENT_AUTH,
        tags: vec![
            Tag::new(["relay", ctx.url.as_str()]),
            Tag::new(["challenge", challenge]),
        ],
        content: String::new(),
    };
    let event = match signer(template) {
        Ok(event) => event,
        Err(e) => {
            warn!("AUTH signing for {} failed: {e}", ctx.url);
            return;
        }
    };
    let msg = ClientMessage::Auth(event);
    match msg.to_json() {
        Ok(json) => {
            if let Some(tx) = ctx.outbound.lock().await.clone() {
                if tx.send(Message::Text(json.into())).await.is_err() {
                    warn!("failed to send AUTH response to {}", ctx.url);
                }
            }
        }
        Err(e) => warn!("failed to encode AUTH response: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_non_websocket_urls() {
        assert!(matches!(
            Relay::new("https://relay.example.com"),
            Err(ClientError::InvalidUrl(_))
        ));
        assert!(Relay::new("not a url").is_err());
        assert!(Relay::new("ws://127.0.0.1:7777").is_ok());
        assert!(Relay::new("wss://relay.example.com").is_ok());
    }

    #[tokio::test]
    async fn test_starts_disconnected() {
        let relay = Relay::new("ws://127.0.0.1:7777").unwrap();
        assert_eq!(relay.state().await, ConnectionState::Disconnected);
        assert!(!relay.is_connected().await);
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let relay = Arc::new(Relay::new("ws://127.0.0.1:7777").unwrap());
        let event = Event {
            id: "ab".repeat(32),
            pubkey: "cd".repeat(32),
            created_at: 0,
            kind: 1,
            tags: vec![],
            content: String::new(),
            sig: "ef".repeat(64),
        };
        assert!(matches!(
            relay.publish(&event).await,
            Err(ClientError::NotConnected)
        ));
        assert!(matches!(
            relay.subscribe(vec![Filter::new()]).await,
            Err(ClientError::NotConnected)
        ));
        assert!(matches!(
            relay.query_sync(vec![Filter::new()]).await,
            Err(ClientError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_connect_refused_returns_to_disconnected() {
        // Nothing listens on this port; connect must fail cleanly.
        let relay = Relay::with_config(
            "ws://127.0.0.1:1",
            RelayConfig {
                connect_timeout: Duration::from_secs(2),
                ..RelayConfig::default()
            },
        )
        .unwrap();
        let result = relay.connect().await;
        assert!(matches!(
            result,
            Err(ClientError::ConnectionFailed(_)) | Err(ClientError::Timeout(_))
        ));
        assert_eq!(relay.state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let relay = Relay::new("ws://127.0.0.1:7777").unwrap();
        relay.disconnect().await.unwrap();
        relay.disconnect().await.unwrap();
    }

    #[test]
    fn test_default_config() {
        let config = RelayConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.publish_timeout, Duration::from_secs(10));
        assert!(config.outbound_buffer > 0);
    }
}
