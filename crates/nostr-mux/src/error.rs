//! Error types for the client.

use nostr_mux_pool::PoolError;
use thiserror::Error;

/// Errors that can occur during client operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// An event was published to an empty relay set.
    #[error("no relays to send to")]
    NoRelays,

    /// Connection pool error.
    #[error("pool error: {0}")]
    Pool(#[from] PoolError),
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
