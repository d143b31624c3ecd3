//! One connection per relay.
//!
//! The pool creates connections lazily, diffs itself against the relays
//! anyone still needs, and watches connection events to keep the
//! connected and available relay sets current.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::watch;

use nostr_mux_core::{Command, RelayUrl};

use crate::connection::{ConnectionEvent, ConnectionEventKind, ConnectionFactory, EventSender, RelayConnection};
use crate::error::Result;

/// Last known phase of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Disconnected,
    Connecting,
    Connected,
}

struct ConnectionRecord {
    connection: Arc<dyn RelayConnection>,
    phase: ConnectionPhase,
}

/// Connections keyed by relay.
pub struct ConnectionPool {
    factory: Arc<dyn ConnectionFactory>,
    events: EventSender,
    records: DashMap<RelayUrl, ConnectionRecord>,
    connected: watch::Sender<HashSet<RelayUrl>>,
    available: watch::Sender<HashSet<RelayUrl>>,
}

impl ConnectionPool {
    /// Create a pool whose connections report on `events`.
    pub fn new(factory: Arc<dyn ConnectionFactory>, events: EventSender) -> Self {
        let (connected, _) = watch::channel(HashSet::new());
        let (available, _) = watch::channel(HashSet::new());
        Self {
            factory,
            events,
            records: DashMap::new(),
            connected,
            available,
        }
    }

    /// The connection to `relay`, created on first use.
    pub fn get_or_create(&self, relay: &RelayUrl) -> Result<Arc<dyn RelayConnection>> {
        let connection = match self.records.entry(relay.clone()) {
            Entry::Occupied(entry) => return Ok(Arc::clone(&entry.get().connection)),
            Entry::Vacant(entry) => {
                let connection = self.factory.create(relay, self.events.clone())?;
                entry.insert(ConnectionRecord {
                    connection: Arc::clone(&connection),
                    phase: ConnectionPhase::Disconnected,
                });
                connection
            }
        };

        tracing::info!(%relay, "relay added to pool");
        self.publish_available();
        Ok(connection)
    }

    /// Make the pool hold exactly `desired`.
    ///
    /// New relays get a connection, relays nobody needs are disconnected
    /// and dropped, and the rest are left alone.
    pub fn update_pool(&self, desired: &HashSet<RelayUrl>) {
        let unwanted: Vec<RelayUrl> = self
            .records
            .iter()
            .filter(|record| !desired.contains(record.key()))
            .map(|record| record.key().clone())
            .collect();
        for relay in &unwanted {
            self.remove(relay);
        }

        for relay in desired {
            if self.records.contains_key(relay) {
                continue;
            }
            if let Err(e) = self.get_or_create(relay) {
                tracing::warn!(%relay, "cannot add relay: {}", e);
            }
        }
    }

    /// Disconnect and drop the connection to `relay`.
    pub fn remove(&self, relay: &RelayUrl) -> bool {
        let Some((_, record)) = self.records.remove(relay) else {
            return false;
        };
        record.connection.disconnect();
        tracing::info!(%relay, "relay removed from pool");

        self.connected.send_if_modified(|set| set.remove(relay));
        self.publish_available();
        true
    }

    /// Reconnect what needs it: stale transports get a fresh socket, closed
    /// connections are reopened subject to their backoff.
    pub fn reconnect_if_needs_to(&self, ignore_retry_delays: bool) {
        for connection in self.connections() {
            if connection.is_connected() {
                if connection.needs_to_reconnect() {
                    tracing::debug!(relay = %connection.relay(), "transport stale, reconnecting");
                    connection.disconnect();
                    connection.connect();
                }
            } else {
                connection.connect_and_sync_if_disconnected(ignore_retry_delays);
            }
        }
    }

    pub fn send_or_connect_and_sync(&self, relay: &RelayUrl, command: Command) -> bool {
        match self.get_or_create(relay) {
            Ok(connection) => connection.send_or_connect_and_sync(command),
            Err(e) => {
                tracing::warn!(%relay, "dropping {}: {}", command.label(), e);
                false
            }
        }
    }

    /// Send on an existing, open connection only.
    pub fn send_if_connected(&self, relay: &RelayUrl, command: Command) -> bool {
        let connection = self
            .records
            .get(relay)
            .map(|record| Arc::clone(&record.connection));
        connection.is_some_and(|connection| connection.send_if_connected(command))
    }

    pub fn connect(&self) {
        for connection in self.connections() {
            connection.connect();
        }
    }

    pub fn disconnect(&self) {
        for connection in self.connections() {
            connection.disconnect();
        }
    }

    /// Fold a connection event into the aggregate state. Call before
    /// forwarding the event anywhere else.
    pub fn intercept(&self, event: &ConnectionEvent) {
        let relay = &event.relay;
        let phase = match &event.kind {
            ConnectionEventKind::Connecting => ConnectionPhase::Connecting,
            ConnectionEventKind::Connected { .. } => ConnectionPhase::Connected,
            ConnectionEventKind::Disconnected | ConnectionEventKind::CannotConnect { .. } => {
                ConnectionPhase::Disconnected
            }
            ConnectionEventKind::Sent { .. } | ConnectionEventKind::Incoming { .. } => return,
        };

        let known = match self.records.get_mut(relay) {
            Some(mut record) => {
                record.phase = phase;
                true
            }
            None => false,
        };

        if phase == ConnectionPhase::Connected && known {
            tracing::info!(%relay, "connected");
            self.connected.send_if_modified(|set| set.insert(relay.clone()));
        } else if phase != ConnectionPhase::Connected {
            self.connected.send_if_modified(|set| set.remove(relay));
        }
    }

    pub fn phase(&self, relay: &RelayUrl) -> Option<ConnectionPhase> {
        self.records.get(relay).map(|record| record.phase)
    }

    pub fn relays(&self) -> HashSet<RelayUrl> {
        self.records.iter().map(|record| record.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Live view of relays with an open socket.
    pub fn connected_relays(&self) -> watch::Receiver<HashSet<RelayUrl>> {
        self.connected.subscribe()
    }

    /// Live view of relays in the pool.
    pub fn available_relays(&self) -> watch::Receiver<HashSet<RelayUrl>> {
        self.available.subscribe()
    }

    fn connections(&self) -> Vec<Arc<dyn RelayConnection>> {
        self.records
            .iter()
            .map(|record| Arc::clone(&record.connection))
            .collect()
    }

    fn publish_available(&self) {
        let relays = self.relays();
        self.available.send_if_modified(|current| {
            if *current == relays {
                false
            } else {
                *current = relays;
                true
            }
        });
    }
}
