//! # nostr-mux Core
//!
//! Pure primitives for the nostr-mux relay multiplexer: relay identities,
//! filters, the NIP-01 wire vocabulary, and filter diffing.
//!
//! This crate contains no I/O and no shared state. Everything here is
//! value types and pure functions over them.
//!
//! ## Key Types
//!
//! - [`RelayUrl`] - Normalized relay identity, used as a map key everywhere
//! - [`Filter`] - Immutable query descriptor sent in REQ and COUNT
//! - [`SubscriptionId`] - Caller-chosen tag shared by REQ/COUNT/CLOSE
//! - [`Command`] / [`RelayMessage`] - Client-to-relay and relay-to-client messages
//!
//! ## Filter Diffing
//!
//! [`needs_resend`] decides whether a changed filter set must be pushed to a
//! relay. See [`filter_diff`] module.

pub mod error;
pub mod event;
pub mod filter;
pub mod filter_diff;
pub mod message;
pub mod relay_url;
pub mod types;

pub use error::{CoreError, MessageError};
pub use event::Event;
pub use filter::Filter;
pub use filter_diff::needs_resend;
pub use message::{Command, RelayMessage};
pub use relay_url::RelayUrl;
pub use types::{now_millis, EventId, SubscriptionId, MAX_SUBSCRIPTION_ID_LEN};
