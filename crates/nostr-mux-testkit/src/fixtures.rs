//! Test fixtures and helpers.
//!
//! Common setup code for pool and client tests.

use std::collections::{HashMap, HashSet};

use tokio::sync::mpsc;

use nostr_mux_core::{Command, Event, EventId, Filter, RelayUrl, SubscriptionId};
use nostr_mux_pool::{Phase, SubscriptionPool};

/// `wss://<name>.example.com`.
pub fn relay(name: &str) -> RelayUrl {
    RelayUrl::parse(&format!("wss://{}.example.com", name)).expect("fixture relay url")
}

/// A set of relays by name.
pub fn relays<'a>(names: impl IntoIterator<Item = &'a str>) -> HashSet<RelayUrl> {
    names.into_iter().map(relay).collect()
}

pub fn sub(id: &str) -> SubscriptionId {
    SubscriptionId::new(id).expect("fixture subscription id")
}

/// The same filters on every relay in `relays`.
pub fn on_relays(relays: &HashSet<RelayUrl>, filters: Vec<Filter>) -> HashMap<RelayUrl, Vec<Filter>> {
    relays
        .iter()
        .map(|relay| (relay.clone(), filters.clone()))
        .collect()
}

/// Everything currently queued on a listener channel.
pub fn drain<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> Vec<T> {
    let mut items = Vec::new();
    while let Ok(item) = rx.try_recv() {
        items.push(item);
    }
    items
}

/// Records every command handed to it and accepts or refuses them all.
#[derive(Debug, Default)]
pub struct Recorder {
    pub sent: Vec<(RelayUrl, Command)>,
    pub refuse: bool,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// A recorder that refuses everything, as if no socket were open.
    pub fn refusing() -> Self {
        Self {
            sent: Vec::new(),
            refuse: true,
        }
    }

    /// A dispatch closure that records into this recorder.
    pub fn dispatch(&mut self) -> impl FnMut(&RelayUrl, Command) -> bool + '_ {
        move |relay: &RelayUrl, command: Command| {
            self.sent.push((relay.clone(), command));
            !self.refuse
        }
    }

    /// Take the recorded commands.
    pub fn take(&mut self) -> Vec<(RelayUrl, Command)> {
        std::mem::take(&mut self.sent)
    }

    /// Take the recorded commands and report each one as written to its
    /// socket, as a connection would after the dispatch returns.
    pub fn acknowledge<P: Phase>(&mut self, pool: &SubscriptionPool<P>) -> Vec<(RelayUrl, Command)> {
        let sent = self.take();
        for (relay, command) in &sent {
            pool.on_sent(relay, command, !self.refuse);
        }
        sent
    }

    /// Commands sent to `relay`, by label.
    pub fn labels_for(&self, relay: &RelayUrl) -> Vec<&'static str> {
        self.sent
            .iter()
            .filter(|(to, _)| to == relay)
            .map(|(_, command)| command.label())
            .collect()
    }
}

/// Builds unsigned-looking events with distinct ids.
pub struct TestFixture {
    pub pubkey: String,
    next: u64,
}

impl TestFixture {
    pub fn new() -> Self {
        Self::with_seed(0)
    }

    /// Ids and pubkey derived from `seed`, so separate fixtures never collide.
    pub fn with_seed(seed: u8) -> Self {
        Self {
            pubkey: hex::encode([seed; 32]),
            next: u64::from(seed) << 32,
        }
    }

    /// A kind-1 note.
    pub fn make_note(&mut self, content: &str) -> Event {
        self.make_event(1, content)
    }

    pub fn make_event(&mut self, kind: u16, content: &str) -> Event {
        self.next += 1;
        let mut id = [0u8; 32];
        id[..8].copy_from_slice(&self.next.to_be_bytes());
        Event {
            id: EventId::from_bytes(id),
            pubkey: self.pubkey.clone(),
            created_at: 1_700_000_000 + self.next % 1_000_000,
            kind,
            tags: Vec::new(),
            content: content.to_string(),
            sig: "00".repeat(64),
        }
    }
}

impl Default for TestFixture {
    fn default() -> Self {
        Self::new()
    }
}
