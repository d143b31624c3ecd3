//! Error types for the pool module.

use thiserror::Error;

use nostr_mux_core::RelayUrl;

/// Errors that can occur while managing relay connections.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The connection factory refused to build a connection.
    #[error("cannot create connection to {relay}: {reason}")]
    Factory { relay: RelayUrl, reason: String },
}

/// Result type for pool operations.
pub type Result<T> = std::result::Result<T, PoolError>;
