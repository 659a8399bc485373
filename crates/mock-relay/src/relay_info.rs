//! NIP-11 relay information document.

use serde::{Deserialize, Serialize};

/// The JSON document served on an HTTP GET with
/// `Accept: application/nostr+json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayInformation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Relay admin pubkey, 32-byte hex
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pubkey: Option<String>,

    /// Admin contact URI
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub supported_nips: Option<Vec<u32>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub software: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl Default for RelayInformation {
    fn default() -> Self {
        RelayInformation {
            name: Some("MockRelay".to_string()),
            description: Some("In-process relay for tests".to_string()),
            pubkey: None,
            contact: None,
            supported_nips: Some(vec![1, 11, 42]),
            software: Some("mock-relay".to_string()),
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
        }
    }
}

impl RelayInformation {
    pub fn named(name: impl Into<String>) -> Self {
        RelayInformation {
            name: Some(name.into()),
            ..RelayInformation::default()
        }
    }
}
