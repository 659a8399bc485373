//! In-process pub/sub for protocol notifications.
//!
//! Topics are `::`-delimited paths (`event::kind::1`, `eose::sub-123`,
//! `ok::<event-id>`, `notice::<relay-url>`). Patterns may use `*` for
//! exactly one segment and `**` for zero or more trailing segments.
//! Dispatch is synchronous on the caller's thread and never awaits;
//! the internal lock is held only to snapshot the matching subscriber
//! list, never across user callbacks.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;

use tracing::warn;

/// Callback invoked with `(topic, payload)`.
pub type BusCallback = Box<dyn Fn(&str, &str) + Send + Sync>;
/// Predicate applied after pattern match and before the callback.
pub type BusPredicate = Box<dyn Fn(&str, &str) -> bool + Send + Sync>;

/// Opaque subscription handle with numeric identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BusHandle(u64);

const CACHE_CAP: usize = 10_000;
const HIST_BINS: usize = 32;
const HIST_BASE_NS: f64 = 1000.0;
const HIST_FACTOR: f64 = 1.5;

struct Subscriber {
    id: u64,
    pattern: String,
    predicate: Option<BusPredicate>,
    callback: BusCallback,
    cancelled: AtomicBool,
}

/// Dispatch latency distribution over 32 exponential bins
/// (1 microsecond base, 1.5x growth).
#[derive(Default)]
struct LatencyHistogram {
    bins: [u64; HIST_BINS],
    count: u64,
    sum_ns: u64,
    min_ns: u64,
    max_ns: u64,
}

impl LatencyHistogram {
    fn record(&mut self, ns: u64) {
        let mut bound = HIST_BASE_NS;
        let mut idx = 0usize;
        while (ns as f64) > bound && idx < HIST_BINS - 1 {
            bound *= HIST_FACTOR;
            idx += 1;
        }
        self.bins[idx] += 1;
        self.count += 1;
        self.sum_ns += ns;
        if self.count == 1 || ns < self.min_ns {
            self.min_ns = ns;
        }
        if ns > self.max_ns {
            self.max_ns = ns;
        }
    }

    /// Upper bound of the bin containing the p-th sample.
    fn percentile(&self, p: f64) -> u64 {
        if self.count == 0 {
            return 0;
        }
        let target = (self.count as f64 * p).ceil() as u64;
        let mut cumulative = 0u64;
        let mut bound = HIST_BASE_NS;
        for bin in &self.bins {
            cumulative += bin;
            if cumulative >= target {
                return bound as u64;
            }
            bound *= HIST_FACTOR;
        }
        self.max_ns
    }
}

/// Point-in-time statistics snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BusStats {
    pub subscriptions: usize,
    pub emits: u64,
    pub callbacks: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// Deliveries skipped because the subscriber was cancelled or its
    /// predicate rejected the payload.
    pub events_dropped: u64,
    pub latency_count: u64,
    pub latency_avg_ns: u64,
    pub latency_min_ns: u64,
    pub latency_max_ns: u64,
    pub latency_p50_ns: u64,
    pub latency_p95_ns: u64,
    pub latency_p99_ns: u64,
}

#[derive(Default)]
struct Inner {
    subscribers: Vec<Arc<Subscriber>>,
    cache: HashMap<String, bool>,
    cache_order: VecDeque<String>,
    emits: u64,
    callbacks: u64,
    cache_hits: u64,
    cache_misses: u64,
    events_dropped: u64,
    histogram: LatencyHistogram,
}

/// Hierarchical topic pub/sub. Construct instances freely in tests; the
/// process-wide instance is [`EventBus::global`].
pub struct EventBus {
    inner: Mutex<Inner>,
    next_id: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// One pattern segment list against one topic segment list.
fn match_segments(pattern: &[&str], topic: &[&str]) -> bool {
    match pattern.split_first() {
        None => topic.is_empty(),
        Some((&"**", rest)) => {
            match_segments(rest, topic)
                || (!topic.is_empty() && match_segments(pattern, &topic[1..]))
        }
        Some((&"*", rest)) => !topic.is_empty() && match_segments(rest, &topic[1..]),
        Some((head, rest)) => topic
            .split_first()
            .is_some_and(|(t, ts)| head == t && match_segments(rest, ts)),
    }
}

/// Whether `pattern` matches `topic`. Exact and wildcard-free patterns
/// short-circuit without splitting.
pub fn pattern_matches(pattern: &str, topic: &str) -> bool {
    if pattern == topic {
        return true;
    }
    if !pattern.contains('*') {
        return false;
    }
    let p: Vec<&str> = pattern.split("::").collect();
    let t: Vec<&str> = topic.split("::").collect();
    match_segments(&p, &t)
}

impl EventBus {
    pub fn new() -> Self {
        EventBus {
            inner: Mutex::new(Inner::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// The process-wide bus, initialized on first use.
    pub fn global() -> &'static EventBus {
        static GLOBAL: OnceLock<EventBus> = OnceLock::new();
        GLOBAL.get_or_init(EventBus::new)
    }

    /// Register a callback for every topic matching `pattern`.
    pub fn subscribe(
        &self,
        pattern: impl Into<String>,
        callback: impl Fn(&str, &str) + Send + Sync + 'static,
    ) -> BusHandle {
        self.subscribe_inner(pattern.into(), None, Box::new(callback))
    }

    /// Like [`EventBus::subscribe`] with an extra predicate evaluated
    /// after the pattern match and before the callback.
    pub fn subscribe_filtered(
        &self,
        pattern: impl Into<String>,
        predicate: impl Fn(&str, &str) -> bool + Send + Sync + 'static,
        callback: impl Fn(&str, &str) + Send + Sync + 'static,
    ) -> BusHandle {
        self.subscribe_inner(pattern.into(), Some(Box::new(predicate)), Box::new(callback))
    }

    fn subscribe_inner(
        &self,
        pattern: String,
        predicate: Option<BusPredicate>,
        callback: BusCallback,
    ) -> BusHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let sub = Arc::new(Subscriber {
            id,
            pattern,
            predicate,
            callback,
            cancelled: AtomicBool::new(false),
        });
        self.inner.lock().unwrap().subscribers.push(sub);
        BusHandle(id)
    }

    /// Cancel a subscription. Idempotent; safe to call from inside a
    /// callback. An invocation already in flight completes, later emits
    /// see the cancellation.
    pub fn unsubscribe(&self, handle: BusHandle) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(pos) = inner.subscribers.iter().position(|s| s.id == handle.0) {
            inner.subscribers[pos].cancelled.store(true, Ordering::SeqCst);
            inner.subscribers.remove(pos);
        }
    }

    fn cached_match(inner: &mut Inner, pattern: &str, topic: &str) -> bool {
        let key = format!("{pattern}\u{1f}{topic}");
        if let Some(&hit) = inner.cache.get(&key) {
            inner.cache_hits += 1;
            return hit;
        }
        inner.cache_misses += 1;
        let result = pattern_matches(pattern, topic);
        if inner.cache.len() >= CACHE_CAP
            && let Some(oldest) = inner.cache_order.pop_front()
        {
            inner.cache.remove(&oldest);
        }
        inner.cache.insert(key.clone(), result);
        inner.cache_order.push_back(key);
        result
    }

    /// Snapshot the subscribers matching `topic` under the lock.
    fn matching(&self, topic: &str) -> Vec<Arc<Subscriber>> {
        let mut inner = self.inner.lock().unwrap();
        let subs = inner.subscribers.clone();
        subs.into_iter()
            .filter(|s| Self::cached_match(&mut inner, &s.pattern, topic))
            .collect()
    }

    fn dispatch(&self, matched: &[Arc<Subscriber>], topic: &str, payload: &str) -> (u64, u64) {
        let mut invoked = 0u64;
        let mut dropped = 0u64;
        for sub in matched {
            if sub.cancelled.load(Ordering::SeqCst) {
                dropped += 1;
                continue;
            }
            if let Some(ref pred) = sub.predicate
                && !pred(topic, payload)
            {
                dropped += 1;
                continue;
            }
            (sub.callback)(topic, payload);
            invoked += 1;
        }
        (invoked, dropped)
    }

    /// Invoke every matching subscriber synchronously, in registration
    /// order, on the calling thread. The payload is borrowed for the
    /// duration of the call.
    pub fn emit(&self, topic: &str, payload: &str) {
        let start = Instant::now();
        let matched = self.matching(topic);
        let (invoked, dropped) = self.dispatch(&matched, topic, payload);
        let elapsed_ns = start.elapsed().as_nanos() as u64;

        let mut inner = self.inner.lock().unwrap();
        inner.emits += 1;
        inner.callbacks += invoked;
        inner.events_dropped += dropped;
        inner.histogram.record(elapsed_ns);
    }

    /// Emit several payloads on one topic, resolving the match set once.
    /// Each subscriber observes the payloads in input order.
    pub fn emit_batch<I, S>(&self, topic: &str, payloads: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let start = Instant::now();
        let matched = self.matching(topic);
        let mut invoked = 0u64;
        let mut dropped = 0u64;
        let mut batch = 0u64;
        for payload in payloads {
            let (i, d) = self.dispatch(&matched, topic, payload.as_ref());
            invoked += i;
            dropped += d;
            batch += 1;
        }
        let elapsed_ns = start.elapsed().as_nanos() as u64;

        let mut inner = self.inner.lock().unwrap();
        inner.emits += batch;
        inner.callbacks += invoked;
        inner.events_dropped += dropped;
        inner.histogram.record(elapsed_ns);
    }

    pub fn stats(&self) -> BusStats {
        let inner = self.inner.lock().unwrap();
        let hist = &inner.histogram;
        BusStats {
            subscriptions: inner.subscribers.len(),
            emits: inner.emits,
            callbacks: inner.callbacks,
            cache_hits: inner.cache_hits,
            cache_misses: inner.cache_misses,
            events_dropped: inner.events_dropped,
            latency_count: hist.count,
            latency_avg_ns: if hist.count > 0 { hist.sum_ns / hist.count } else { 0 },
            latency_min_ns: hist.min_ns,
            latency_max_ns: hist.max_ns,
            latency_p50_ns: hist.percentile(0.50),
            latency_p95_ns: hist.percentile(0.95),
            latency_p99_ns: hist.percentile(0.99),
        }
    }

    /// Drop every subscription and reset statistics. Test isolation only.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.subscribers.is_empty() {
            warn!(count = inner.subscribers.len(), "resetting bus with live subscribers");
        }
        for sub in &inner.subscribers {
            sub.cancelled.store(true, Ordering::SeqCst);
        }
        *inner = Inner::default();
    }
}
