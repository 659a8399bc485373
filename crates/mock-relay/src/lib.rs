//! An in-process Nostr relay for tests.
//!
//! Seed it with events, point a client at `url()`, and inspect what got
//! published. Also ships as a standalone binary for tests written in
//! other processes.

pub mod relay_info;
pub mod server;

pub use relay_info::RelayInformation;
pub use server::{MockRelay, MockRelayConfig, MockRelayError, MockRelayStats};
