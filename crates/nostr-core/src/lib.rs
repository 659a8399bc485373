//! Core Nostr protocol library: event data model, canonical signing form,
//! filters, wire envelopes, and the cryptographic operations behind them
//! (BIP-340 Schnorr, NIP-04, NIP-06, NIP-19, NIP-44, NIP-49).
//!
//! Network I/O lives in `nostr-client`; this crate is pure data and crypto.

pub mod canonical;
pub mod envelope;
pub mod event;
pub mod filter;
pub mod keys;
pub mod nip04;
pub mod nip06;
pub mod nip19;
pub mod nip44;
pub mod nip49;
pub mod secure;

pub use envelope::{ClientMessage, RelayMessage};
pub use event::{Event, EventTemplate, Tag, Timestamp, UnsignedEvent};
pub use filter::Filter;
pub use keys::Keys;
pub use secure::SecretBuffer;
