//! The mock relay server.
//!
//! Just enough of the relay side of the protocol to be a test oracle:
//! per-connection subscription tables, a simplified filter matcher over
//! seeded events, EOSE after stored results, capture of every published
//! event, and live fan-out of accepted publishes to matching
//! subscriptions. NIP-11 is answered on the same port by peeking at the
//! request head before the WebSocket handshake.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use nostr_core::envelope::{ClientMessage, RelayMessage};
use nostr_core::event::Event;
use nostr_core::filter::Filter;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, broadcast};
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::relay_info::RelayInformation;

#[derive(Debug, Error)]
pub enum MockRelayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid seed line {line}: {message}")]
    InvalidSeed { line: usize, message: String },
}

/// Mock relay configuration.
#[derive(Debug, Clone)]
pub struct MockRelayConfig {
    /// Bind address; port 0 auto-assigns.
    pub bind_addr: SocketAddr,
    /// Send EOSE after the stored results of each REQ.
    pub auto_eose: bool,
    /// Verify Schnorr signatures before accepting a publish.
    pub validate_signatures: bool,
    /// Artificial delay before each response batch.
    pub response_delay: Option<Duration>,
    /// Cap on events returned per REQ; `None` is unlimited.
    pub max_events_per_req: Option<usize>,
    /// Send this NIP-42 AUTH challenge to every new connection.
    pub auth_challenge: Option<String>,
    /// NIP-11 document.
    pub info: RelayInformation,
}

impl Default for MockRelayConfig {
    fn default() -> Self {
        MockRelayConfig {
            bind_addr: "127.0.0.1:0".parse().expect("static addr is valid"),
            auto_eose: true,
            validate_signatures: false,
            response_delay: None,
            max_events_per_req: None,
            auth_challenge: None,
            info: RelayInformation::default(),
        }
    }
}

/// Counters, snapshotted by `MockRelay::stats`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MockRelayStats {
    pub seeded: u64,
    pub matched: u64,
    pub published: u64,
    pub req_count: u64,
    pub close_count: u64,
    pub connections: u64,
}

struct Shared {
    config: MockRelayConfig,
    events: Mutex<Vec<Event>>,
    published: Mutex<Vec<Event>>,
    publish_queue: Mutex<VecDeque<Event>>,
    publish_notify: Notify,
    auth_responses: Mutex<Vec<Event>>,
    auth_notify: Notify,
    stats: Mutex<MockRelayStats>,
    broadcast_tx: broadcast::Sender<Event>,
}

/// A running mock relay. Dropping it stops the server.
pub struct MockRelay {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl MockRelay {
    /// Bind and start serving. With port 0 the OS picks the port;
    /// `url()` reports the real one.
    pub async fn start(config: MockRelayConfig) -> Result<Self, MockRelayError> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        let (broadcast_tx, _) = broadcast::channel(256);
        let shared = Arc::new(Shared {
            config,
            events: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
            publish_queue: Mutex::new(VecDeque::new()),
            publish_notify: Notify::new(),
            auth_responses: Mutex::new(Vec::new()),
            auth_notify: Notify::new(),
            stats: Mutex::new(MockRelayStats::default()),
            broadcast_tx,
        });
        let accept_shared = Arc::clone(&shared);
        let accept_task = tokio::spawn(accept_loop(listener, accept_shared));
        info!("mock relay listening on ws://{local_addr}");
        Ok(MockRelay {
            shared,
            local_addr,
            accept_task,
        })
    }

    pub async fn start_default() -> Result<Self, MockRelayError> {
        Self::start(MockRelayConfig::default()).await
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.local_addr)
    }

    pub fn http_url(&self) -> String {
        format!("http://{}", self.local_addr)
    }

    /// Add one event to the stored set.
    pub fn seed_event(&self, event: Event) {
        self.shared.events.lock().unwrap().push(event);
        self.shared.stats.lock().unwrap().seeded += 1;
    }

    pub fn seed_events(&self, events: impl IntoIterator<Item = Event>) {
        for event in events {
            self.seed_event(event);
        }
    }

    /// Seed from JSONL text: one transport-form event per line, blank
    /// lines and `#` comments skipped, trailing `\r` tolerated.
    pub fn seed_jsonl(&self, contents: &str) -> Result<usize, MockRelayError> {
        let mut count = 0;
        for (index, line) in contents.lines().enumerate() {
            let line = line.trim_end_matches('\r').trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let event = Event::from_json(line).map_err(|e| MockRelayError::InvalidSeed {
                line: index + 1,
                message: e.to_string(),
            })?;
            self.seed_event(event);
            count += 1;
        }
        Ok(count)
    }

    pub async fn seed_file(&self, path: &Path) -> Result<usize, MockRelayError> {
        let contents = tokio::fs::read_to_string(path).await?;
        self.seed_jsonl(&contents)
    }

    /// Events accepted through EVENT envelopes, in arrival order.
    pub fn published_events(&self) -> Vec<Event> {
        self.shared.published.lock().unwrap().clone()
    }

    pub fn published_count(&self) -> usize {
        self.shared.published.lock().unwrap().len()
    }

    /// Block until a publish arrives, consuming it from the waiters'
    /// queue. `None` on deadline.
    pub async fn await_publish(&self, deadline: Duration) -> Option<Event> {
        let deadline = tokio::time::Instant::now() + deadline;
        loop {
            {
                let mut queue = self.shared.publish_queue.lock().unwrap();
                if let Some(event) = queue.pop_front() {
                    return Some(event);
                }
            }
            let notified = self.shared.publish_notify.notified();
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    /// Signed NIP-42 events clients sent back for our challenge.
    pub fn auth_responses(&self) -> Vec<Event> {
        self.shared.auth_responses.lock().unwrap().clone()
    }

    /// Block until a client answers the AUTH challenge. `None` on
    /// deadline.
    pub async fn await_auth_response(&self, deadline: Duration) -> Option<Event> {
        let deadline = tokio::time::Instant::now() + deadline;
        loop {
            {
                let responses = self.shared.auth_responses.lock().unwrap();
                if let Some(event) = responses.last() {
                    return Some(event.clone());
                }
            }
            let notified = self.shared.auth_notify.notified();
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    pub fn stats(&self) -> MockRelayStats {
        *self.shared.stats.lock().unwrap()
    }

    pub fn relay_info(&self) -> RelayInformation {
        self.shared.config.info.clone()
    }

    pub fn shutdown(&self) {
        self.accept_task.abort();
    }
}

impl Drop for MockRelay {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                shared.stats.lock().unwrap().connections += 1;
                let shared = Arc::clone(&shared);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, addr, shared).await {
                        debug!("connection from {addr} ended: {e}");
                    }
                });
            }
            Err(e) => {
                warn!("accept failed: {e}");
            }
        }
    }
}

/// Peek the request head without consuming it. `true` when this is a
/// plain HTTP GET asking for the NIP-11 document rather than a
/// WebSocket upgrade.
async fn wants_relay_info(stream: &TcpStream) -> bool {
    let mut buf = [0u8; 2048];
    let mut n = 0;
    for _ in 0..20 {
        n = match stream.peek(&mut buf).await {
            Ok(n) => n,
            Err(_) => return false,
        };
        if buf[..n].windows(4).any(|w| w == b"\r\n\r\n") || n == buf.len() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let head = String::from_utf8_lossy(&buf[..n]).to_ascii_lowercase();
    head.starts_with("get ") && head.contains("application/nostr+json")
}

async fn serve_relay_info(mut stream: TcpStream, shared: &Shared) -> std::io::Result<()> {
    // Consume the request head we only peeked at so far.
    let mut buf = vec![0u8; 4096];
    let _ = stream.read(&mut buf).await?;
    let body = serde_json::to_string(&shared.config.info).map_err(std::io::Error::other)?;
    let response = format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: application/nostr+json\r\n\
         Access-Control-Allow-Origin: *\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n{}",
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    shared: Arc<Shared>,
) -> Result<(), MockRelayError> {
    if wants_relay_info(&stream).await {
        debug!("serving NIP-11 document to {addr}");
        serve_relay_info(stream, &shared).await?;
        return Ok(());
    }

    let ws = accept_async(stream)
        .await
        .map_err(|e| MockRelayError::Io(std::io::Error::other(e)))?;
    debug!("websocket connection from {addr}");

    let (mut write, mut read) = ws.split();
    let mut subscriptions: HashMap<String, Vec<Filter>> = HashMap::new();
    let mut broadcast_rx = shared.broadcast_tx.subscribe();

    if let Some(challenge) = &shared.config.auth_challenge
        && let Ok(json) = RelayMessage::Auth(challenge.clone()).to_json()
        && write.send(Message::Text(json.into())).await.is_err()
    {
        return Ok(());
    }

    loop {
        tokio::select! {
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let responses = handle_client_text(&shared, &mut subscriptions, text.as_str());
                    if let Some(delay) = shared.config.response_delay {
                        tokio::time::sleep(delay).await;
                    }
                    for response in responses {
                        if write.send(Message::Text(response.into())).await.is_err() {
                            return Ok(());
                        }
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = write.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("websocket error from {addr}: {e}");
                    break;
                }
            },
            result = broadcast_rx.recv() => match result {
                Ok(event) => {
                    for (sub_id, filters) in &subscriptions {
                        if filters.iter().any(|f| filter_matches(f, &event))
                            && let Ok(json) = (RelayMessage::Event {
                                subscription_id: sub_id.clone(),
                                event: event.clone(),
                            })
                            .to_json()
                            && write.send(Message::Text(json.into())).await.is_err()
                        {
                            return Ok(());
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("connection {addr} lagged {n} broadcasts");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
    debug!("connection from {addr} closed");
    Ok(())
}

/// Process one client envelope and build the response frames. A parse
/// failure produces a NOTICE and keeps the connection.
fn handle_client_text(
    shared: &Shared,
    subscriptions: &mut HashMap<String, Vec<Filter>>,
    text: &str,
) -> Vec<String> {
    let msg = match ClientMessage::from_json(text) {
        Ok(msg) => msg,
        Err(e) => {
            debug!("unparseable client message: {e}");
            return encode([RelayMessage::Notice(format!("could not parse message: {e}"))]);
        }
    };
    match msg {
        ClientMessage::Event(event) => handle_publish(shared, event),
        ClientMessage::Req {
            subscription_id,
            filters,
        } => {
            shared.stats.lock().unwrap().req_count += 1;
            let matched = matching_events(shared, &filters);
            shared.stats.lock().unwrap().matched += matched.len() as u64;
            subscriptions.insert(subscription_id.clone(), filters);

            let mut responses: Vec<RelayMessage> = matched
                .into_iter()
                .map(|event| RelayMessage::Event {
                    subscription_id: subscription_id.clone(),
                    event,
                })
                .collect();
            if shared.config.auto_eose {
                responses.push(RelayMessage::Eose(subscription_id));
            }
            encode(responses)
        }
        ClientMessage::Count {
            subscription_id,
            filters,
        } => {
            let count = matching_events(shared, &filters).len() as u64;
            encode([RelayMessage::Count {
                subscription_id,
                count,
            }])
        }
        ClientMessage::Close(subscription_id) => {
            shared.stats.lock().unwrap().close_count += 1;
            subscriptions.remove(&subscription_id);
            Vec::new()
        }
        ClientMessage::Auth(event) => {
            debug!("AUTH response from client: {}", event.id);
            shared.auth_responses.lock().unwrap().push(event);
            shared.auth_notify.notify_one();
            Vec::new()
        }
    }
}

fn handle_publish(shared: &Shared, event: Event) -> Vec<String> {
    if shared.config.validate_signatures && !event.verify().unwrap_or(false) {
        return encode([RelayMessage::Ok {
            event_id: event.id,
            accepted: false,
            message: "invalid: signature verification failed".to_string(),
        }]);
    }

    shared.events.lock().unwrap().push(event.clone());
    shared.published.lock().unwrap().push(event.clone());
    shared
        .publish_queue
        .lock()
        .unwrap()
        .push_back(event.clone());
    shared.stats.lock().unwrap().published += 1;
    shared.publish_notify.notify_one();
    // No receivers is fine; send only fails then.
    let _ = shared.broadcast_tx.send(event.clone());

    encode([RelayMessage::Ok {
        event_id: event.id,
        accepted: true,
        message: String::new(),
    }])
}

fn encode(messages: impl IntoIterator<Item = RelayMessage>) -> Vec<String> {
    messages
        .into_iter()
        .filter_map(|m| m.to_json().ok())
        .collect()
}

/// Stored events matching any of the filters, in seed order, capped by
/// the smallest filter limit and the per-REQ cap.
fn matching_events(shared: &Shared, filters: &[Filter]) -> Vec<Event> {
    if filters.iter().all(|f| f.limit_zero) && !filters.is_empty() {
        return Vec::new();
    }
    let events = shared.events.lock().unwrap();
    let mut matched: Vec<Event> = events
        .iter()
        .filter(|event| filters.iter().any(|f| filter_matches(f, event)))
        .cloned()
        .collect();
    drop(events);

    let filter_limit = filters
        .iter()
        .filter_map(|f| f.limit)
        .min()
        .map(|l| l as usize);
    let cap = match (filter_limit, shared.config.max_events_per_req) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    };
    if let Some(cap) = cap {
        matched.truncate(cap);
    }
    matched
}

/// Simplified matcher: id/author prefix, exact kinds, inclusive
/// since/until, single-letter tag values.
fn filter_matches(filter: &Filter, event: &Event) -> bool {
    if let Some(ids) = &filter.ids
        && !ids.iter().any(|p| event.id.starts_with(p.as_str()))
    {
        return false;
    }
    if let Some(authors) = &filter.authors
        && !authors.iter().any(|p| event.pubkey.starts_with(p.as_str()))
    {
        return false;
    }
    if let Some(kinds) = &filter.kinds
        && !kinds.contains(&event.kind)
    {
        return false;
    }
    if let Some(since) = filter.since
        && event.created_at < since
    {
        return false;
    }
    if let Some(until) = filter.until
        && event.created_at > until
    {
        return false;
    }
    for (letter, values) in &filter.tags {
        let hit = event.tags.iter().any(|tag| {
            tag.key() == Some(letter.as_str())
                && tag.value().is_some_and(|v| values.iter().any(|x| x == v))
        });
        if !hit {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr_core::event::Tag;

    fn event(id: &str, pubkey: &str, kind: u64, created_at: i64) -> Event {
        Event {
            id: id.repeat(64 / id.len()),
            pubkey: pubkey.repeat(64 / pubkey.len()),
            created_at,
            kind,
            tags: vec![],
            content: String::new(),
            sig: "0".repeat(128),
        }
    }

    #[test]
    fn test_filter_matches_prefixes_and_kinds() {
        let ev = event("a", "1", 1, 100);
        assert!(filter_matches(&Filter::new().ids(["aaaa"]), &ev));
        assert!(!filter_matches(&Filter::new().ids(["bbbb"]), &ev));
        assert!(filter_matches(&Filter::new().authors(["11"]), &ev));
        assert!(filter_matches(&Filter::new().kinds([1]), &ev));
        assert!(!filter_matches(&Filter::new().kinds([2]), &ev));
    }

    #[test]
    fn test_filter_matches_time_window_inclusive() {
        let ev = event("a", "1", 1, 100);
        assert!(filter_matches(&Filter::new().since(100), &ev));
        assert!(filter_matches(&Filter::new().until(100), &ev));
        assert!(!filter_matches(&Filter::new().since(101), &ev));
        assert!(!filter_matches(&Filter::new().until(99), &ev));
    }

    #[test]
    fn test_filter_matches_tags() {
        let mut ev = event("a", "1", 1, 100);
        ev.tags = vec![Tag::new(["e", "aa"]), Tag::new(["p", "bb"])];
        assert!(filter_matches(&Filter::new().event_refs(["aa"]), &ev));
        assert!(!filter_matches(&Filter::new().event_refs(["zz"]), &ev));
    }

    #[tokio::test]
    async fn test_seed_jsonl_skips_comments_and_blanks() {
        let relay = MockRelay::start_default().await.unwrap();
        let ev = event("a", "1", 1, 100);
        let line = serde_json::to_string(&ev).unwrap();
        let contents = format!("# comment\n\n{line}\r\n   \n{line}\n");
        let count = relay.seed_jsonl(&contents).unwrap();
        assert_eq!(count, 2);
        assert_eq!(relay.stats().seeded, 2);
    }

    #[tokio::test]
    async fn test_seed_jsonl_reports_bad_line() {
        let relay = MockRelay::start_default().await.unwrap();
        let result = relay.seed_jsonl("# ok\nnot json\n");
        assert!(matches!(
            result,
            Err(MockRelayError::InvalidSeed { line: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_limit_zero_filters_return_no_stored_events() {
        let relay = MockRelay::start_default().await.unwrap();
        relay.seed_event(event("a", "1", 1, 100));

        let none = matching_events(&relay.shared, &[Filter::new().limit(0)]);
        assert!(none.is_empty());

        // One filter still asking for results disables the short-circuit.
        let some = matching_events(
            &relay.shared,
            &[Filter::new().limit(0), Filter::new().kinds([1])],
        );
        assert_eq!(some.len(), 1);
    }

    #[tokio::test]
    async fn test_seed_file_reads_jsonl() {
        let relay = MockRelay::start_default().await.unwrap();
        let ev = event("a", "1", 1, 100);
        let line = serde_json::to_string(&ev).unwrap();
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), format!("{line}\n# trailing comment\n")).unwrap();

        let count = relay.seed_file(file.path()).await.unwrap();
        assert_eq!(count, 1);
        assert_eq!(relay.stats().seeded, 1);
    }

    #[tokio::test]
    async fn test_await_publish_times_out() {
        let relay = MockRelay::start_default().await.unwrap();
        let got = relay.await_publish(Duration::from_millis(50)).await;
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_auto_assigned_port_is_real() {
        let relay = MockRelay::start_default().await.unwrap();
        assert_ne!(relay.local_addr().port(), 0);
        assert!(relay.url().starts_with("ws://127.0.0.1:"));
    }
}
