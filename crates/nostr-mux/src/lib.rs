//! # nostr-mux
//!
//! A subscription and publication multiplexer for Nostr clients that talk
//! to many relays at once.
//!
//! ## Overview
//!
//! The application states what it wants: which filters on which relays,
//! which counts, which events published where. The client keeps every
//! relay converged on that desired state across reconnects, never sends
//! a duplicate REQ, and retries publication a bounded number of times.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::collections::HashMap;
//! use nostr_mux::{ClientConfig, NostrClient, MemoryNetwork};
//! use nostr_mux::core::{Filter, RelayUrl, SubscriptionId};
//!
//! async fn example() {
//!     // Any ConnectionFactory works; the in-memory network is for tests.
//!     let network = MemoryNetwork::new();
//!     let client = NostrClient::new(network.factory(), ClientConfig::default());
//!     client.connect();
//!
//!     let relay = RelayUrl::parse("wss://relay.example.com").unwrap();
//!     let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
//!     client.open_req_subscription(
//!         &SubscriptionId::new("feed").unwrap(),
//!         HashMap::from([(relay, vec![Filter::new().kinds([1])])]),
//!         Some(tx),
//!     );
//!
//!     while let Some(update) = rx.recv().await {
//!         println!("{:?}", update);
//!     }
//! }
//! ```
//!
//! ## Re-exports
//!
//! - `nostr_mux::core` - Relay urls, filters, wire messages
//! - `nostr_mux::pool` - Pools, connection contract, in-memory relays

pub mod client;
pub mod error;

pub use nostr_mux_core as core;
pub use nostr_mux_pool as pool;

pub use client::{ClientConfig, Notification, NostrClient};
pub use error::{ClientError, Result};

pub use nostr_mux_core::{Command, Event, EventId, Filter, RelayMessage, RelayUrl, SubscriptionId};
pub use nostr_mux_pool::{
    ConnectionEvent, ConnectionEventKind, ConnectionFactory, CountListener, CountStatus,
    CountUpdate, MemoryNetwork, OutboxConfig, OutboxUpdate, RelayConnection, ReqListener,
    ReqStatus, ReqUpdate,
};
