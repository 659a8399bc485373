//! Event structure and operations: the signed record at the heart of the
//! protocol, its unsigned draft forms, id computation over the canonical
//! signing form, Schnorr signing and verification, and kind classification.

use bitcoin::hashes::{Hash, sha256};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::canonical;
use crate::keys::{self, Keys};

/// Unix seconds, signed to tolerate pre-epoch and far-future values.
pub type Timestamp = i64;

/// Current wall-clock time as Unix seconds.
pub fn timestamp_now() -> Timestamp {
    use std::time::{SystemTime, UNIX_EPOCH};
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    }
}

/// Errors from event construction, signing, and verification.
#[derive(Debug, Error)]
pub enum EventError {
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("signing failed: {0}")]
    SignatureFailed(String),

    #[error("parse failed: {0}")]
    ParseFailed(#[from] serde_json::Error),
}

/// A single tag: an ordered, non-empty list of strings whose first element
/// is the tag key. Tags are opaque to the core; duplicates are allowed and
/// insertion order is part of the canonical form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tag(Vec<String>);

impl Tag {
    pub fn new<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Tag(items.into_iter().map(Into::into).collect())
    }

    /// The tag key (first element), or `None` for a malformed empty tag.
    pub fn key(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    /// The first value after the key.
    pub fn value(&self) -> Option<&str> {
        self.0.get(1).map(String::as_str)
    }

    /// All elements after the key.
    pub fn values(&self) -> &[String] {
        if self.0.is_empty() { &[] } else { &self.0[1..] }
    }

    /// NIP-10 positional marker: element 3 of an `e` tag
    /// ("root", "reply", "mention").
    pub fn marker(&self) -> Option<&str> {
        if self.key() == Some("e") || self.key() == Some("E") {
            self.0.get(3).map(String::as_str)
        } else {
            None
        }
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<String>> for Tag {
    fn from(items: Vec<String>) -> Self {
        Tag(items)
    }
}

// Well-known event kinds.
pub const KIND_METADATA: u64 = 0;
pub const KIND_SHORT_TEXT_NOTE: u64 = 1;
pub const KIND_CONTACTS: u64 = 3;
pub const KIND_ENCRYPTED_DM: u64 = 4;
pub const KIND_REACTION: u64 = 7;
pub const KIND_COMMENT: u64 = 1111;
pub const KIND_RELAY_LIST: u64 = 10002;
pub const KIND_CLIENT_AUTH: u64 = 22242;

/// Event kind classification per protocol storage rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindClassification {
    /// Expected to be stored by relays
    Regular,
    /// Only the latest event per pubkey+kind is stored
    Replaceable,
    /// Not expected to be stored by relays
    Ephemeral,
    /// Only the latest event per pubkey+kind+d-tag is stored
    Addressable,
    /// Outside every defined range
    Unknown,
}

/// Classify an event kind.
pub fn classify_kind(kind: u64) -> KindClassification {
    if (1000..10000).contains(&kind) || (4..45).contains(&kind) || kind == 1 || kind == 2 {
        return KindClassification::Regular;
    }
    if (10000..20000).contains(&kind) || kind == 0 || kind == 3 {
        return KindClassification::Replaceable;
    }
    if (20000..30000).contains(&kind) {
        return KindClassification::Ephemeral;
    }
    if (30000..40000).contains(&kind) {
        return KindClassification::Addressable;
    }
    KindClassification::Unknown
}

pub fn is_regular_kind(kind: u64) -> bool {
    matches!(classify_kind(kind), KindClassification::Regular)
}

pub fn is_replaceable_kind(kind: u64) -> bool {
    matches!(classify_kind(kind), KindClassification::Replaceable)
}

pub fn is_ephemeral_kind(kind: u64) -> bool {
    matches!(classify_kind(kind), KindClassification::Ephemeral)
}

pub fn is_addressable_kind(kind: u64) -> bool {
    matches!(classify_kind(kind), KindClassification::Addressable)
}

/// A signed event. `id` and `sig` are derived outputs; any semantic
/// mutation invalidates both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// 32-byte lowercase hex sha256 of the canonical signing form
    pub id: String,
    /// 32-byte lowercase hex x-only public key of the creator
    pub pubkey: String,
    /// Unix timestamp in seconds
    pub created_at: Timestamp,
    /// Event kind
    pub kind: u64,
    /// Ordered tag list
    pub tags: Vec<Tag>,
    /// Arbitrary string content
    pub content: String,
    /// 64-byte lowercase hex Schnorr signature over `id`
    pub sig: String,
}

/// An unsigned draft: everything but `id` and `sig`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedEvent {
    pub pubkey: String,
    pub created_at: Timestamp,
    pub kind: u64,
    pub tags: Vec<Tag>,
    pub content: String,
}

/// A template for creating events. The pubkey comes from the signing key.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EventTemplate {
    pub created_at: Timestamp,
    pub kind: u64,
    pub tags: Vec<Tag>,
    pub content: String,
}

fn is_lower_hex(s: &str, len: usize) -> bool {
    s.len() == len
        && s.chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

impl UnsignedEvent {
    /// The canonical signing form of this draft.
    pub fn signing_form(&self) -> String {
        canonical::signing_form(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        )
    }

    /// Event id: lowercase hex sha256 of the signing form.
    pub fn id_hex(&self) -> String {
        let hash = sha256::Hash::hash(self.signing_form().as_bytes());
        hex::encode(hash.as_byte_array())
    }

    /// Sign this draft. Fails with `InvalidKey` when `keys` does not match
    /// the draft's pubkey.
    pub fn sign(&self, keys: &Keys) -> Result<Event, EventError> {
        if self.pubkey != keys.public_key_hex() {
            return Err(EventError::InvalidKey(
                "draft pubkey does not match signing key".to_string(),
            ));
        }
        let id = self.id_hex();
        let mut msg = [0u8; 32];
        hex::decode_to_slice(&id, &mut msg)
            .map_err(|e| EventError::SignatureFailed(e.to_string()))?;
        let sig = keys
            .sign_schnorr(&msg)
            .map_err(|e| EventError::SignatureFailed(e.to_string()))?;
        Ok(Event {
            id,
            pubkey: self.pubkey.clone(),
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags.clone(),
            content: self.content.clone(),
            sig: hex::encode(sig),
        })
    }
}

impl EventTemplate {
    /// Fill in the pubkey from `keys` and sign, producing a complete event.
    pub fn sign(&self, keys: &Keys) -> Result<Event, EventError> {
        let unsigned = UnsignedEvent {
            pubkey: keys.public_key_hex(),
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags.clone(),
            content: self.content.clone(),
        };
        unsigned.sign(keys)
    }
}

impl Event {
    /// Structural validity: hex field shapes and non-empty tags. Does not
    /// check the id hash or the signature.
    pub fn validate_structure(&self) -> bool {
        is_lower_hex(&self.id, 64)
            && is_lower_hex(&self.pubkey, 64)
            && is_lower_hex(&self.sig, 128)
            && self.tags.iter().all(|t| !t.is_empty())
    }

    /// Full verification: structure, id over the canonical form, and the
    /// BIP-340 signature. Returns `Ok(false)` on any mismatch; `Err` only
    /// for malformed inputs that prevent the check from running.
    pub fn verify(&self) -> Result<bool, EventError> {
        if !self.validate_structure() {
            return Ok(false);
        }
        let unsigned = UnsignedEvent {
            pubkey: self.pubkey.clone(),
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags.clone(),
            content: self.content.clone(),
        };
        if unsigned.id_hex() != self.id {
            return Ok(false);
        }

        let mut msg = [0u8; 32];
        hex::decode_to_slice(&self.id, &mut msg)
            .map_err(|e| EventError::InvalidEvent(e.to_string()))?;
        let mut sig = [0u8; 64];
        hex::decode_to_slice(&self.sig, &mut sig)
            .map_err(|e| EventError::InvalidEvent(e.to_string()))?;
        let mut pk = [0u8; 32];
        hex::decode_to_slice(&self.pubkey, &mut pk)
            .map_err(|e| EventError::InvalidEvent(e.to_string()))?;

        Ok(keys::schnorr_verify(&msg, &pk, &sig))
    }

    /// Decode from transport-form JSON.
    pub fn from_json(json: &str) -> Result<Self, EventError> {
        let event: Event = serde_json::from_str(json)?;
        if event.tags.iter().any(|t| t.is_empty()) {
            return Err(EventError::InvalidEvent("empty tag".to_string()));
        }
        Ok(event)
    }

    /// Encode to transport-form JSON.
    pub fn to_json(&self) -> Result<String, EventError> {
        Ok(serde_json::to_string(self)?)
    }

    /// First value of the first tag with the given key.
    pub fn tag_value(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.key() == Some(key))
            .and_then(Tag::value)
    }
}

/// Sort reverse-chronologically by `created_at`, ties broken by id.
pub fn sort_events(events: &mut [Event]) {
    events.sort_by(|a, b| match b.created_at.cmp(&a.created_at) {
        std::cmp::Ordering::Equal => a.id.cmp(&b.id),
        other => other,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_PRIVATE_KEY: &str =
        "d217c1ff2f8a65c3e3a1740db3b9f58b8c848bb45e26d00ed4714e4a0f4ceecf";

    fn test_keys() -> Keys {
        Keys::from_hex(TEST_PRIVATE_KEY).unwrap()
    }

    #[test]
    fn test_sign_produces_well_formed_event() {
        let keys = test_keys();
        let template = EventTemplate {
            created_at: 1617932115,
            kind: KIND_SHORT_TEXT_NOTE,
            tags: vec![],
            content: "Hello, world!".to_string(),
        };
        let event = template.sign(&keys).unwrap();

        assert_eq!(event.kind, 1);
        assert_eq!(event.created_at, 1617932115);
        assert_eq!(event.pubkey, keys.public_key_hex());
        assert_eq!(event.id.len(), 64);
        assert_eq!(event.sig.len(), 128);
        assert!(event.verify().unwrap());
    }

    #[test]
    fn test_id_matches_canonical_hash() {
        let keys = test_keys();
        let event = EventTemplate {
            created_at: 1617932115,
            kind: 1,
            tags: vec![Tag::new(["t", "test"])],
            content: "id check".to_string(),
        }
        .sign(&keys)
        .unwrap();

        let unsigned = UnsignedEvent {
            pubkey: event.pubkey.clone(),
            created_at: event.created_at,
            kind: event.kind,
            tags: event.tags.clone(),
            content: event.content.clone(),
        };
        assert_eq!(event.id, unsigned.id_hex());
    }

    #[test]
    fn test_tampered_content_fails_verify() {
        let keys = test_keys();
        let mut event = EventTemplate {
            created_at: 1617932115,
            kind: 1,
            tags: vec![],
            content: "original".to_string(),
        }
        .sign(&keys)
        .unwrap();

        event.content = "tampered".to_string();
        assert!(!event.verify().unwrap());
    }

    #[test]
    fn test_tampered_sig_fails_verify() {
        let keys = test_keys();
        let mut event = EventTemplate {
            created_at: 1617932115,
            kind: 1,
            tags: vec![],
            content: "sig check".to_string(),
        }
        .sign(&keys)
        .unwrap();

        // Flip one nibble of the signature.
        let mut sig: Vec<char> = event.sig.chars().collect();
        sig[0] = if sig[0] == '0' { '1' } else { '0' };
        event.sig = sig.into_iter().collect();
        assert!(!event.verify().unwrap());
    }

    #[test]
    fn test_tampered_tag_fails_verify() {
        let keys = test_keys();
        let mut event = EventTemplate {
            created_at: 1617932115,
            kind: 1,
            tags: vec![Tag::new(["e", "aa"])],
            content: "tag check".to_string(),
        }
        .sign(&keys)
        .unwrap();

        event.tags[0] = Tag::new(["e", "bb"]);
        assert!(!event.verify().unwrap());
    }

    #[test]
    fn test_transport_round_trip() {
        let keys = test_keys();
        let event = EventTemplate {
            created_at: 1617932115,
            kind: 1,
            tags: vec![Tag::new(["p", &keys.public_key_hex()])],
            content: "round trip \"quotes\" and\nnewlines".to_string(),
        }
        .sign(&keys)
        .unwrap();

        let json = event.to_json().unwrap();
        let parsed = Event::from_json(&json).unwrap();
        assert_eq!(parsed, event);
        assert!(parsed.verify().unwrap());
    }

    #[test]
    fn test_from_json_rejects_empty_tag() {
        let json = r#"{"id":"00","pubkey":"00","created_at":1,"kind":1,"tags":[[]],"content":"","sig":"00"}"#;
        assert!(Event::from_json(json).is_err());
    }

    #[test]
    fn test_negative_created_at_survives() {
        let keys = test_keys();
        let event = EventTemplate {
            created_at: -1,
            kind: 1,
            tags: vec![],
            content: "before the epoch".to_string(),
        }
        .sign(&keys)
        .unwrap();
        assert!(event.verify().unwrap());
    }

    #[test]
    fn test_classify_kind_ranges() {
        assert_eq!(classify_kind(1), KindClassification::Regular);
        assert_eq!(classify_kind(0), KindClassification::Replaceable);
        assert_eq!(classify_kind(3), KindClassification::Replaceable);
        assert_eq!(classify_kind(10002), KindClassification::Replaceable);
        assert_eq!(classify_kind(22242), KindClassification::Ephemeral);
        assert_eq!(classify_kind(30023), KindClassification::Addressable);
        assert_eq!(classify_kind(40000), KindClassification::Unknown);
    }

    #[test]
    fn test_sort_events_reverse_chronological() {
        let mk = |id: &str, created_at: i64| Event {
            id: id.to_string(),
            pubkey: String::new(),
            created_at,
            kind: 1,
            tags: vec![],
            content: String::new(),
            sig: String::new(),
        };
        let mut events = vec![mk("b", 10), mk("a", 10), mk("c", 20)];
        sort_events(&mut events);
        assert_eq!(events[0].id, "c");
        assert_eq!(events[1].id, "a");
        assert_eq!(events[2].id, "b");
    }

    #[test]
    fn test_tag_accessors() {
        let tag = Tag::new(["e", "eventid", "wss://r.example", "reply"]);
        assert_eq!(tag.key(), Some("e"));
        assert_eq!(tag.value(), Some("eventid"));
        assert_eq!(tag.values().len(), 3);
        assert_eq!(tag.marker(), Some("reply"));

        let plain = Tag::new(["p", "pubkey"]);
        assert_eq!(plain.marker(), None);
    }
}
