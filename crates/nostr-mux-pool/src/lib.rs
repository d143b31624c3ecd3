//! # nostr-mux Pool
//!
//! Relay multiplexing: keeps every relay's subscriptions, count queries and
//! pending events converged on what the application currently wants.
//!
//! ## Overview
//!
//! The application only ever states desired state ("subscription `s1`
//! wants these filters on these relays"). The pools work out the minimal
//! REQ/COUNT/CLOSE/EVENT traffic per relay and track what each relay was
//! told, so repeated updates never produce duplicate commands.
//!
//! ## Key Types
//!
//! - [`RequestPool`] - REQ subscriptions per relay
//! - [`CountPool`] - COUNT queries per relay
//! - [`EventOutbox`] - At-least-once publication with bounded retries
//! - [`ConnectionPool`] - One [`RelayConnection`] per relay
//!
//! ## Dispatch
//!
//! Pools never own connections. Every operation that may emit a command
//! takes a `dispatch` closure that hands the command to a connection and
//! reports whether it was accepted:
//!
//! ```rust
//! use std::collections::HashMap;
//! use nostr_mux_core::{Command, Filter, RelayUrl, SubscriptionId};
//! use nostr_mux_pool::RequestPool;
//!
//! let pool = RequestPool::new();
//! let relay = RelayUrl::parse("wss://relay.example.com").unwrap();
//! let sub = SubscriptionId::new("feed").unwrap();
//!
//! let affected = pool.add_or_update(
//!     &sub,
//!     HashMap::from([(relay.clone(), vec![Filter::new().kinds([1])])]),
//!     None,
//! );
//!
//! let mut sent = Vec::new();
//! pool.reconcile_relays(&sub, &affected, &mut |relay: &RelayUrl, cmd: Command| {
//!     sent.push((relay.clone(), cmd));
//!     true
//! });
//! assert_eq!(sent.len(), 1);
//! ```

pub mod connection;
pub mod connection_pool;
pub mod counts;
pub mod error;
pub mod outbox;
pub mod requests;
pub mod state;
pub mod subscriptions;

pub use connection::{
    memory::MemoryNetwork, BackoffConfig, ConnectionEvent, ConnectionEventKind, ConnectionFactory,
    EventSender, ReconnectBackoff, RelayConnection,
};
pub use connection_pool::{ConnectionPhase, ConnectionPool};
pub use counts::{CountListener, CountPool, CountUpdate};
pub use error::{PoolError, Result};
pub use outbox::{DeliveryState, EventOutbox, OutboxConfig, OutboxUpdate, PendingEvent};
pub use requests::{ReqListener, ReqUpdate, RequestPool};
pub use state::{
    plan, CountPhase, CountStatus, Filters, Phase, Plan, RelaySubscriptionState, ReqPhase,
    ReqStatus, SubscriptionUpdate,
};
pub use subscriptions::{Listener, SubscriptionPool};
