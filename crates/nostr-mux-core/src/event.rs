//! Signed events, carried as opaque payloads.
//!
//! The multiplexer never inspects or verifies an event beyond its id. Kinds
//! and tags are forwarded untouched.

use serde::{Deserialize, Serialize};

use crate::types::EventId;

/// A signed Nostr event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
}
