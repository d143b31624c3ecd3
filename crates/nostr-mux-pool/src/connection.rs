//! Relay connection contract.
//!
//! A connection owns one socket to one relay. Commands are handed over
//! fire-and-forget; the connection owns its own queue and reports what
//! happened as [`ConnectionEvent`]s on the channel it was created with.
//! Implementations may use WebSockets or anything else that carries text
//! frames.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use nostr_mux_core::{Command, RelayMessage, RelayUrl};

use crate::error::Result;

/// Channel connections report their [`ConnectionEvent`]s on.
pub type EventSender = mpsc::UnboundedSender<ConnectionEvent>;

/// Something that happened on a relay connection.
#[derive(Debug, Clone)]
pub struct ConnectionEvent {
    pub relay: RelayUrl,
    pub kind: ConnectionEventKind,
}

impl ConnectionEvent {
    pub fn new(relay: RelayUrl, kind: ConnectionEventKind) -> Self {
        Self { relay, kind }
    }
}

#[derive(Debug, Clone)]
pub enum ConnectionEventKind {
    Connecting,
    Connected { ping_millis: u64, compressed: bool },
    Disconnected,
    /// The socket could not be opened.
    CannotConnect { message: String },
    /// A command left (or failed to leave) the send queue.
    Sent {
        text: String,
        command: Command,
        success: bool,
    },
    /// A message arrived and parsed.
    Incoming { text: String, message: RelayMessage },
}

/// One logical connection to one relay.
///
/// Implementations must be thread-safe (Send + Sync) and must never call
/// back into the pools synchronously; everything goes through the event
/// channel.
pub trait RelayConnection: Send + Sync {
    fn relay(&self) -> &RelayUrl;

    fn connect(&self);

    fn disconnect(&self);

    fn is_connected(&self) -> bool;

    /// Connected, but over a transport that went stale (network change).
    fn needs_to_reconnect(&self) -> bool;

    /// Queue `command`, connecting first if needed.
    ///
    /// Returns true if the command was queued on an open socket. When the
    /// socket had to be opened the command is not queued: the desired state
    /// is synced once the connection reports `Connected`.
    fn send_or_connect_and_sync(&self, command: Command) -> bool;

    /// Queue `command` only on an open socket.
    fn send_if_connected(&self, command: Command) -> bool;

    /// Reconnect if disconnected, honoring retry delays unless told not to.
    fn connect_and_sync_if_disconnected(&self, ignore_retry_delays: bool);
}

/// Builds connections for the pool.
pub trait ConnectionFactory: Send + Sync {
    fn create(&self, relay: &RelayUrl, events: EventSender) -> Result<Arc<dyn RelayConnection>>;
}

/// Reconnect delay policy.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay after the first failure.
    pub reconnect_delay: Duration,
    /// Ceiling for the doubling delay.
    pub max_reconnect_delay: Duration,
    /// Delay after a hard failure (relay refused us outright).
    pub penalty_delay: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(5 * 60),
            penalty_delay: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Per-connection reconnect gate.
///
/// The n-th consecutive failure waits `base_delay * 2^n`, capped at
/// `max_delay`.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    base_delay: Duration,
    max_delay: Duration,
    penalty_delay: Duration,
    attempt: u32,
    next_attempt: Option<Instant>,
}

impl ReconnectBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            base_delay: config.reconnect_delay,
            max_delay: config.max_reconnect_delay,
            penalty_delay: config.penalty_delay,
            attempt: 0,
            next_attempt: None,
        }
    }

    /// Whether a connection attempt may start now.
    pub fn try_begin(&self, ignore_retry_delays: bool) -> bool {
        match self.next_attempt {
            Some(at) if !ignore_retry_delays => Instant::now() >= at,
            _ => true,
        }
    }

    pub fn on_connected(&mut self) {
        self.reset();
    }

    /// A soft failure: wait, then double the next wait.
    pub fn on_failure(&mut self) {
        let delay = self.next_delay();
        self.next_attempt = Some(Instant::now() + delay);
    }

    /// A hard failure: do not try again for a long time.
    pub fn penalize(&mut self) {
        self.next_attempt = Some(Instant::now() + self.penalty_delay);
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
        self.next_attempt = None;
    }

    /// Consecutive failures since the last successful connect.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Wait the next failure would impose.
    pub fn current_delay(&self) -> Duration {
        let multiplier = 1u32.checked_shl(self.attempt.min(31)).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(multiplier)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.current_delay();
        self.attempt = self.attempt.saturating_add(1);
        delay
    }
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

/// An in-memory relay network for testing.
///
/// Relays are scripted from the test: bring them up or down, push messages
/// to the client, and inspect every command they received.
pub mod memory {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Mutex, MutexGuard};

    fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
        mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Availability {
        Online,
        Offline,
        Refusing(String),
    }

    struct Session {
        connection_id: u64,
        events: EventSender,
    }

    struct RelayState {
        availability: Availability,
        session: Option<Session>,
        received: Vec<Command>,
        attempts: usize,
        stale_transport: bool,
    }

    impl Default for RelayState {
        fn default() -> Self {
            Self {
                availability: Availability::Online,
                session: None,
                received: Vec::new(),
                attempts: 0,
                stale_transport: false,
            }
        }
    }

    enum OpenError {
        Offline,
        Refused(String),
    }

    /// Shared state of every simulated relay.
    pub struct MemoryNetwork {
        relays: Mutex<HashMap<RelayUrl, RelayState>>,
        backoff: BackoffConfig,
        next_connection_id: AtomicU64,
    }

    impl MemoryNetwork {
        /// Create a network whose relays are all online.
        pub fn new() -> Arc<Self> {
            Self::with_backoff(BackoffConfig::default())
        }

        pub fn with_backoff(backoff: BackoffConfig) -> Arc<Self> {
            Arc::new(Self {
                relays: Mutex::new(HashMap::new()),
                backoff,
                next_connection_id: AtomicU64::new(1),
            })
        }

        /// Factory creating connections into this network.
        pub fn factory(self: &Arc<Self>) -> Arc<dyn ConnectionFactory> {
            Arc::new(MemoryFactory {
                network: Arc::clone(self),
            })
        }

        /// Bring `relay` up or down. Going down drops the open session.
        pub fn set_online(&self, relay: &RelayUrl, online: bool) {
            let dropped = {
                let mut relays = lock(&self.relays);
                let state = relays.entry(relay.clone()).or_default();
                state.availability = if online {
                    Availability::Online
                } else {
                    Availability::Offline
                };
                if online {
                    None
                } else {
                    state.session.take()
                }
            };
            if let Some(session) = dropped {
                let _ = session
                    .events
                    .send(ConnectionEvent::new(relay.clone(), ConnectionEventKind::Disconnected));
            }
        }

        /// Make `relay` reject every connection attempt with `message`.
        pub fn refuse(&self, relay: &RelayUrl, message: impl Into<String>) {
            let mut relays = lock(&self.relays);
            relays.entry(relay.clone()).or_default().availability =
                Availability::Refusing(message.into());
        }

        /// Server-side close of the open session, if any.
        pub fn drop_connection(&self, relay: &RelayUrl) {
            let dropped = lock(&self.relays)
                .get_mut(relay)
                .and_then(|state| state.session.take());
            if let Some(session) = dropped {
                let _ = session
                    .events
                    .send(ConnectionEvent::new(relay.clone(), ConnectionEventKind::Disconnected));
            }
        }

        /// Flag the open session's transport as stale.
        pub fn mark_transport_stale(&self, relay: &RelayUrl) {
            lock(&self.relays).entry(relay.clone()).or_default().stale_transport = true;
        }

        /// Push `message` to the client connected to `relay`.
        ///
        /// Returns false if no client is connected.
        pub fn deliver(&self, relay: &RelayUrl, message: RelayMessage) -> bool {
            let relays = lock(&self.relays);
            let Some(session) = relays.get(relay).and_then(|state| state.session.as_ref()) else {
                return false;
            };
            let text = match message.to_json() {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(%relay, "cannot encode relay message: {}", e);
                    return false;
                }
            };
            session
                .events
                .send(ConnectionEvent::new(
                    relay.clone(),
                    ConnectionEventKind::Incoming { text, message },
                ))
                .is_ok()
        }

        /// Every command `relay` received, in order.
        pub fn received(&self, relay: &RelayUrl) -> Vec<Command> {
            lock(&self.relays)
                .get(relay)
                .map(|state| state.received.clone())
                .unwrap_or_default()
        }

        pub fn clear_received(&self, relay: &RelayUrl) {
            if let Some(state) = lock(&self.relays).get_mut(relay) {
                state.received.clear();
            }
        }

        /// Connection attempts made against `relay`.
        pub fn attempts(&self, relay: &RelayUrl) -> usize {
            lock(&self.relays)
                .get(relay)
                .map(|state| state.attempts)
                .unwrap_or(0)
        }

        pub fn is_connected(&self, relay: &RelayUrl) -> bool {
            lock(&self.relays)
                .get(relay)
                .is_some_and(|state| state.session.is_some())
        }

        fn open(&self, relay: &RelayUrl, connection_id: u64, events: &EventSender) -> std::result::Result<(), OpenError> {
            let mut relays = lock(&self.relays);
            let state = relays.entry(relay.clone()).or_default();
            state.attempts += 1;
            match &state.availability {
                Availability::Online => {
                    state.session = Some(Session {
                        connection_id,
                        events: events.clone(),
                    });
                    state.stale_transport = false;
                    Ok(())
                }
                Availability::Offline => Err(OpenError::Offline),
                Availability::Refusing(message) => Err(OpenError::Refused(message.clone())),
            }
        }

        fn close(&self, relay: &RelayUrl, connection_id: u64) -> bool {
            let mut relays = lock(&self.relays);
            match relays.get_mut(relay) {
                Some(state) if state.session_id() == Some(connection_id) => {
                    state.session = None;
                    true
                }
                _ => false,
            }
        }

        fn session_id(&self, relay: &RelayUrl) -> Option<u64> {
            lock(&self.relays).get(relay).and_then(RelayState::session_id)
        }

        fn stale_transport(&self, relay: &RelayUrl) -> bool {
            lock(&self.relays)
                .get(relay)
                .is_some_and(|state| state.stale_transport)
        }

        fn record(&self, relay: &RelayUrl, connection_id: u64, command: Command) -> bool {
            let mut relays = lock(&self.relays);
            match relays.get_mut(relay) {
                Some(state) if state.session_id() == Some(connection_id) => {
                    state.received.push(command);
                    true
                }
                _ => false,
            }
        }
    }

    impl RelayState {
        fn session_id(&self) -> Option<u64> {
            self.session.as_ref().map(|session| session.connection_id)
        }
    }

    /// [`ConnectionFactory`] for a [`MemoryNetwork`].
    pub struct MemoryFactory {
        network: Arc<MemoryNetwork>,
    }

    impl ConnectionFactory for MemoryFactory {
        fn create(&self, relay: &RelayUrl, events: EventSender) -> Result<Arc<dyn RelayConnection>> {
            let id = self.network.next_connection_id.fetch_add(1, Ordering::Relaxed);
            Ok(Arc::new(MemoryConnection {
                relay: relay.clone(),
                id,
                network: Arc::clone(&self.network),
                events,
                backoff: Mutex::new(ReconnectBackoff::new(self.network.backoff.clone())),
            }))
        }
    }

    /// A simulated connection. Connecting completes synchronously.
    pub struct MemoryConnection {
        relay: RelayUrl,
        id: u64,
        network: Arc<MemoryNetwork>,
        events: EventSender,
        backoff: Mutex<ReconnectBackoff>,
    }

    impl MemoryConnection {
        fn emit(&self, kind: ConnectionEventKind) {
            let _ = self.events.send(ConnectionEvent::new(self.relay.clone(), kind));
        }

        fn open(&self, ignore_retry_delays: bool) {
            if self.is_connected() {
                return;
            }
            if !lock(&self.backoff).try_begin(ignore_retry_delays) {
                tracing::trace!(relay = %self.relay, "reconnect delayed");
                return;
            }

            self.emit(ConnectionEventKind::Connecting);
            match self.network.open(&self.relay, self.id, &self.events) {
                Ok(()) => {
                    lock(&self.backoff).on_connected();
                    self.emit(ConnectionEventKind::Connected {
                        ping_millis: 0,
                        compressed: false,
                    });
                }
                Err(OpenError::Offline) => {
                    lock(&self.backoff).on_failure();
                    self.emit(ConnectionEventKind::CannotConnect {
                        message: "relay offline".into(),
                    });
                    self.emit(ConnectionEventKind::Disconnected);
                }
                Err(OpenError::Refused(message)) => {
                    lock(&self.backoff).penalize();
                    self.emit(ConnectionEventKind::CannotConnect { message });
                    self.emit(ConnectionEventKind::Disconnected);
                }
            }
        }

        fn send(&self, command: Command) -> bool {
            let text = match command.to_json() {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(relay = %self.relay, "cannot encode {}: {}", command.label(), e);
                    return false;
                }
            };
            let success = self.network.record(&self.relay, self.id, command.clone());
            self.emit(ConnectionEventKind::Sent {
                text,
                command,
                success,
            });
            success
        }
    }

    impl RelayConnection for MemoryConnection {
        fn relay(&self) -> &RelayUrl {
            &self.relay
        }

        fn connect(&self) {
            self.open(true);
        }

        fn disconnect(&self) {
            if self.network.close(&self.relay, self.id) {
                self.emit(ConnectionEventKind::Disconnected);
            }
        }

        fn is_connected(&self) -> bool {
            self.network.session_id(&self.relay) == Some(self.id)
        }

        fn needs_to_reconnect(&self) -> bool {
            self.is_connected() && self.network.stale_transport(&self.relay)
        }

        fn send_or_connect_and_sync(&self, command: Command) -> bool {
            if self.is_connected() {
                self.send(command)
            } else {
                self.open(false);
                false
            }
        }

        fn send_if_connected(&self, command: Command) -> bool {
            self.is_connected() && self.send(command)
        }

        fn connect_and_sync_if_disconnected(&self, ignore_retry_delays: bool) {
            self.open(ignore_retry_delays);
        }
    }
}
