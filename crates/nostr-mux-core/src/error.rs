//! Error types for nostr-mux Core.

use thiserror::Error;

/// Errors raised while constructing core values.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid relay url {url}: {reason}")]
    InvalidRelayUrl { url: String, reason: String },

    #[error("invalid event id: {0}")]
    InvalidEventId(String),

    #[error("invalid subscription id: {0}")]
    InvalidSubscriptionId(String),
}

/// Errors raised while encoding or decoding wire messages.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("invalid message format: {0}")]
    InvalidFormat(String),

    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Core(#[from] CoreError),
}
