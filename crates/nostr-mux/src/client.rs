//! The client: wires the pools to the connections.
//!
//! Three background tasks run per client:
//!
//! - the event loop, which feeds every connection event through the
//!   connection pool, then the subscription pools and the outbox, then
//!   the application's notification channel
//! - the relay sampler, which shrinks and grows the connection pool to the
//!   relays anyone still needs, at most once per `relay_sync_interval`
//! - the reconnect driver, which debounces reconnect requests and
//!   periodically reopens dropped connections
//!
//! A single event loop per client keeps each relay's messages in order.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use nostr_mux_core::{Command, Event, EventId, Filter, RelayUrl, SubscriptionId};
use nostr_mux_pool::{
    ConnectionEvent, ConnectionEventKind, ConnectionFactory, ConnectionPool, CountListener,
    CountPool, CountStatus, EventOutbox, Filters, OutboxConfig, OutboxUpdate, RelayConnection,
    ReqListener, ReqStatus, RequestPool,
};

use crate::error::{ClientError, Result};

/// Configuration for the client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Minimum spacing between connection pool resizes.
    pub relay_sync_interval: Duration,
    /// Reconnect requests arriving within this window are merged.
    pub reconnect_debounce: Duration,
    /// How often dropped connections are retried without being asked.
    pub reconnect_interval: Duration,
    /// Buffer of the notification broadcast channel.
    pub notification_capacity: usize,
    /// Publication retry ceilings.
    pub outbox: OutboxConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_sync_interval: Duration::from_millis(300),
            reconnect_debounce: Duration::from_millis(200),
            reconnect_interval: Duration::from_secs(60),
            notification_capacity: 1024,
            outbox: OutboxConfig::default(),
        }
    }
}

/// Application-level notification.
#[derive(Debug, Clone)]
pub enum Notification {
    /// Every connection event, after the pools processed it.
    Connection(ConnectionEvent),
    /// Publication progress.
    Outbox(OutboxUpdate),
}

#[derive(Debug, Clone, Copy)]
struct ReconnectRequest {
    only_if_changed: bool,
    ignore_retry_delays: bool,
}

impl ReconnectRequest {
    fn merge(self, other: ReconnectRequest) -> Self {
        Self {
            only_if_changed: self.only_if_changed && other.only_if_changed,
            ignore_retry_delays: self.ignore_retry_delays || other.ignore_retry_delays,
        }
    }
}

struct ClientInner {
    config: ClientConfig,
    connections: ConnectionPool,
    requests: RequestPool,
    counts: CountPool,
    outbox: EventOutbox,
    active: AtomicBool,
    notifications: broadcast::Sender<Notification>,
    reconnects: mpsc::UnboundedSender<ReconnectRequest>,
}

/// A multiplexing Nostr client.
///
/// Starts inactive: desired state is recorded but nothing is sent until
/// [`connect`](Self::connect). Must be created inside a Tokio runtime.
pub struct NostrClient {
    inner: Arc<ClientInner>,
    tasks: Vec<JoinHandle<()>>,
}

impl NostrClient {
    /// Create a client whose connections come from `factory`.
    pub fn new(factory: Arc<dyn ConnectionFactory>, config: ClientConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        let (reconnects_tx, reconnects_rx) = mpsc::unbounded_channel();
        let (notifications, _) = broadcast::channel(config.notification_capacity.max(1));

        let inner = Arc::new(ClientInner {
            connections: ConnectionPool::new(factory, events_tx),
            requests: RequestPool::new(),
            counts: CountPool::new(),
            outbox: EventOutbox::new(config.outbox.clone()).with_listener(outbox_tx),
            active: AtomicBool::new(false),
            notifications,
            reconnects: reconnects_tx,
            config,
        });

        let tasks = vec![
            tokio::spawn(run_event_loop(Arc::clone(&inner), events_rx, outbox_rx)),
            tokio::spawn(run_relay_sampler(Arc::clone(&inner))),
            tokio::spawn(run_reconnect_driver(Arc::clone(&inner), reconnects_rx)),
        ];

        Self { inner, tasks }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Subscriptions
    // ─────────────────────────────────────────────────────────────────────────

    /// Open or update a REQ subscription.
    ///
    /// `filters` maps each relay to its filters; relays left out (or mapped
    /// to no filters) are closed. A `Some` listener replaces the previous one.
    pub fn open_req_subscription(
        &self,
        subscription_id: &SubscriptionId,
        filters: HashMap<RelayUrl, Vec<Filter>>,
        listener: Option<ReqListener>,
    ) {
        let affected = self.inner.requests.add_or_update(subscription_id, filters, listener);
        self.inner
            .requests
            .reconcile_relays(subscription_id, &affected, &mut self.inner.dispatcher());
        self.wake_dropped_relays();
    }

    /// Open or update a COUNT query.
    pub fn query_count(
        &self,
        subscription_id: &SubscriptionId,
        filters: HashMap<RelayUrl, Vec<Filter>>,
        listener: Option<CountListener>,
    ) {
        let affected = self.inner.counts.add_or_update(subscription_id, filters, listener);
        self.inner
            .counts
            .reconcile_relays(subscription_id, &affected, &mut self.inner.dispatcher());
        self.wake_dropped_relays();
    }

    /// Close a subscription or count query on every relay serving it.
    pub fn close(&self, subscription_id: &SubscriptionId) {
        let mut relays = self.inner.requests.remove(subscription_id);
        relays.extend(self.inner.counts.remove(subscription_id));

        for relay in &relays {
            self.inner.dispatch(
                relay,
                Command::Close {
                    subscription_id: subscription_id.clone(),
                },
            );
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Publication
    // ─────────────────────────────────────────────────────────────────────────

    /// Publish `event` to `relays`, retrying within the outbox ceilings.
    pub fn send(&self, event: &Event, relays: &HashSet<RelayUrl>) -> Result<()> {
        if relays.is_empty() {
            return Err(ClientError::NoRelays);
        }

        let to_send = self.inner.outbox.mark_as_sending(event, relays);
        self.inner
            .outbox
            .send_to_relays(&event.id, &to_send, &mut self.inner.dispatcher());
        self.wake_dropped_relays();
        Ok(())
    }

    pub fn is_pending(&self, event_id: &EventId) -> bool {
        self.inner.outbox.is_pending(event_id)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Connectivity
    // ─────────────────────────────────────────────────────────────────────────

    /// Activate the client and open every relay that is wanted.
    pub fn connect(&self) {
        tracing::info!("client connecting");
        self.inner.active.store(true, Ordering::Release);
        self.inner.connections.update_pool(&self.inner.desired_relays());
        self.inner.connections.connect();
    }

    /// Deactivate the client and close every connection. Desired state is
    /// kept and resent on the next [`connect`](Self::connect).
    pub fn disconnect(&self) {
        tracing::info!("client disconnecting");
        self.inner.active.store(false, Ordering::Release);
        self.inner.connections.disconnect();
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Request a reconnect. Requests within `reconnect_debounce` are merged.
    ///
    /// With `only_if_changed` only dropped or stale connections are
    /// reopened; otherwise every connection is cycled.
    pub fn reconnect(&self, only_if_changed: bool, ignore_retry_delays: bool) {
        let _ = self.inner.reconnects.send(ReconnectRequest {
            only_if_changed,
            ignore_retry_delays,
        });
    }

    /// New work may target a relay that is waiting out its retry delay.
    fn wake_dropped_relays(&self) {
        if self.is_active() {
            self.reconnect(true, false);
        }
    }

    /// Resend everything `relay` should be serving.
    pub fn renew_filters(&self, relay: &RelayUrl) {
        self.inner.renew_filters(relay);
    }

    /// Handle to the connection for `relay`, created if needed.
    pub fn connection(&self, relay: &RelayUrl) -> Result<Arc<dyn RelayConnection>> {
        Ok(self.inner.connections.get_or_create(relay)?)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Observation
    // ─────────────────────────────────────────────────────────────────────────

    /// Notifications for every connection event and publication update.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.inner.notifications.subscribe()
    }

    /// Subscriptions `relay` is currently serving.
    pub fn active_requests(&self, relay: &RelayUrl) -> HashMap<SubscriptionId, Filters> {
        self.inner.requests.active_filters_for(relay)
    }

    /// Count queries `relay` is currently serving.
    pub fn active_counts(&self, relay: &RelayUrl) -> HashMap<SubscriptionId, Filters> {
        self.inner.counts.active_filters_for(relay)
    }

    /// Events still owed to `relay`.
    pub fn active_outbox(&self, relay: &RelayUrl) -> Vec<Event> {
        self.inner.outbox.pending_for(relay)
    }

    pub fn req_filters(&self, subscription_id: &SubscriptionId) -> Option<HashMap<RelayUrl, Filters>> {
        self.inner.requests.filters_of(subscription_id)
    }

    pub fn count_filters(&self, subscription_id: &SubscriptionId) -> Option<HashMap<RelayUrl, Filters>> {
        self.inner.counts.filters_of(subscription_id)
    }

    pub fn req_status(&self, subscription_id: &SubscriptionId, relay: &RelayUrl) -> Option<ReqStatus> {
        self.inner.requests.status(subscription_id, relay)
    }

    pub fn count_status(&self, subscription_id: &SubscriptionId, relay: &RelayUrl) -> Option<CountStatus> {
        self.inner.counts.status(subscription_id, relay)
    }

    pub fn connected_relays(&self) -> tokio::sync::watch::Receiver<HashSet<RelayUrl>> {
        self.inner.connections.connected_relays()
    }

    pub fn available_relays(&self) -> tokio::sync::watch::Receiver<HashSet<RelayUrl>> {
        self.inner.connections.available_relays()
    }
}

impl Drop for NostrClient {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl ClientInner {
    /// Hand `command` to its relay's connection.
    ///
    /// CLOSE and AUTH only make sense on an already-open socket; everything
    /// else opens one if needed.
    fn dispatch(&self, relay: &RelayUrl, command: Command) -> bool {
        if !self.active.load(Ordering::Acquire) {
            return false;
        }
        tracing::debug!(%relay, command = command.label(), "dispatch");
        if command.requires_open_connection() {
            self.connections.send_if_connected(relay, command)
        } else {
            self.connections.send_or_connect_and_sync(relay, command)
        }
    }

    fn dispatcher(&self) -> impl FnMut(&RelayUrl, Command) -> bool + '_ {
        move |relay: &RelayUrl, command: Command| self.dispatch(relay, command)
    }

    fn renew_filters(&self, relay: &RelayUrl) {
        let mut dispatch = self.dispatcher();
        self.requests.sync_state(relay, &mut dispatch);
        self.counts.sync_state(relay, &mut dispatch);
        self.outbox.sync_state(relay, &mut dispatch);
    }

    fn desired_relays(&self) -> HashSet<RelayUrl> {
        let mut relays = self.requests.desired_relays().borrow().clone();
        relays.extend(self.counts.desired_relays().borrow().iter().cloned());
        relays.extend(self.outbox.relays().borrow().iter().cloned());
        relays
    }

    fn handle_event(&self, event: ConnectionEvent) {
        self.connections.intercept(&event);

        let relay = &event.relay;
        match &event.kind {
            ConnectionEventKind::Connecting => {
                self.requests.on_connecting(relay);
                self.counts.on_connecting(relay);
            }
            ConnectionEventKind::Connected { .. } => self.renew_filters(relay),
            ConnectionEventKind::Disconnected => {
                self.requests.on_disconnected(relay);
                self.counts.on_disconnected(relay);
            }
            ConnectionEventKind::CannotConnect { message } => {
                tracing::warn!(%relay, reason = %message, "cannot connect");
                self.requests.on_cannot_connect(relay, message);
                self.counts.on_cannot_connect(relay, message);
                self.outbox.on_cannot_connect(relay, message);
            }
            ConnectionEventKind::Sent {
                command, success, ..
            } => {
                if !success {
                    tracing::warn!(%relay, command = command.label(), "send failed");
                }
                self.requests.on_sent(relay, command, *success);
                self.counts.on_sent(relay, command, *success);
                self.outbox.on_sent(relay, command, *success);
            }
            ConnectionEventKind::Incoming { message, .. } => {
                let mut dispatch = self.dispatcher();
                self.requests.on_incoming_message(relay, message, &mut dispatch);
                self.counts.on_incoming_message(relay, message, &mut dispatch);
                self.outbox.on_incoming_message(relay, message);
            }
        }

        // No receivers is fine.
        let _ = self.notifications.send(Notification::Connection(event));
    }

    fn perform_reconnect(&self, request: ReconnectRequest) {
        if !self.active.load(Ordering::Acquire) {
            return;
        }
        tracing::debug!(
            only_if_changed = request.only_if_changed,
            ignore_retry_delays = request.ignore_retry_delays,
            "reconnecting"
        );
        if request.only_if_changed {
            self.connections.reconnect_if_needs_to(request.ignore_retry_delays);
        } else {
            self.connections.disconnect();
            self.connections.connect();
        }
    }
}

async fn run_event_loop(
    inner: Arc<ClientInner>,
    mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
    mut outbox: mpsc::UnboundedReceiver<OutboxUpdate>,
) {
    loop {
        tokio::select! {
            Some(event) = events.recv() => inner.handle_event(event),
            Some(update) = outbox.recv() => {
                let _ = inner.notifications.send(Notification::Outbox(update));
            }
            else => break,
        }
    }
}

async fn run_relay_sampler(inner: Arc<ClientInner>) {
    let mut requests = inner.requests.desired_relays();
    let mut counts = inner.counts.desired_relays();
    let mut outbox = inner.outbox.relays();

    loop {
        let changed = tokio::select! {
            r = requests.changed() => r,
            r = counts.changed() => r,
            r = outbox.changed() => r,
        };
        if changed.is_err() {
            break;
        }

        tokio::time::sleep(inner.config.relay_sync_interval).await;

        let mut desired = requests.borrow_and_update().clone();
        desired.extend(counts.borrow_and_update().iter().cloned());
        desired.extend(outbox.borrow_and_update().iter().cloned());
        inner.connections.update_pool(&desired);
    }
}

async fn run_reconnect_driver(
    inner: Arc<ClientInner>,
    mut requests: mpsc::UnboundedReceiver<ReconnectRequest>,
) {
    let mut interval = tokio::time::interval(inner.config.reconnect_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval.tick().await;

    loop {
        let request = tokio::select! {
            Some(first) = requests.recv() => {
                tokio::time::sleep(inner.config.reconnect_debounce).await;
                let mut merged = first;
                while let Ok(next) = requests.try_recv() {
                    merged = merged.merge(next);
                }
                merged
            }
            _ = interval.tick() => ReconnectRequest {
                only_if_changed: true,
                ignore_retry_delays: false,
            },
        };
        inner.perform_reconnect(request);
    }
}
