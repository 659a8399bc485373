//! Client error types

use thiserror::Error;

/// Client error type
#[derive(Error, Debug)]
pub enum ClientError {
    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Connection error
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Invalid URL
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Envelope codec error
    #[error("protocol error: {0}")]
    Protocol(#[from] nostr_core::envelope::EnvelopeError),

    /// Event error
    #[error("invalid event: {0}")]
    InvalidEvent(#[from] nostr_core::event::EventError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// URL parse error
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    /// Operation timed out
    #[error("timeout: {0}")]
    Timeout(String),

    /// Operation cancelled
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Not connected
    #[error("not connected to relay")]
    NotConnected,

    /// Operation disallowed in current state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Event publish failed
    #[error("publish failed: {0}")]
    PublishFailed(String),

    /// Subscription error
    #[error("subscription error: {0}")]
    Subscription(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

/// Client result type
pub type Result<T> = std::result::Result<T, ClientError>;
