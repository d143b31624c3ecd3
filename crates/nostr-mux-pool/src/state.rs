//! Per-relay subscription state machines.
//!
//! Every (subscription, relay) pair is in exactly one phase. Phases that
//! know what the relay was last sent carry those filters, so "has filters"
//! and "was sent" can never disagree.
//!
//! ```text
//!            open                 EOSE
//!   Idle ───────────► QueryingPast ─────► Live
//!     ▲                  │    │             │
//!     │ forget           │    └── close ──┐ │ close
//!     │                  │               ▼ ▼
//!   Stale ◄─ disconnect ─┘            Closing ──► Closed
//! ```
//!
//! `Stale` is the reconnection marker: the socket went away, the relay no
//! longer holds the subscription, and the pair must be resent. It reports
//! as idle and only a successful resend clears it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use nostr_mux_core::{needs_resend, Command, Filter, RelayUrl, SubscriptionId};

/// Filters shared between desired state, phases and listener updates.
pub type Filters = Arc<[Filter]>;

/// Phase of a REQ subscription on one relay.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ReqPhase {
    #[default]
    Idle,
    /// REQ sent, stored events are still arriving.
    QueryingPast { filters: Filters },
    /// EOSE received, events are live.
    Live { filters: Filters },
    /// CLOSE sent, not yet acknowledged by the socket.
    Closing { filters: Filters },
    Closed,
    /// The relay lost this subscription and it must be resent.
    Stale { filters: Filters },
}

/// Externally visible REQ status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReqStatus {
    Idle,
    QueryingPast,
    Live,
    Closing,
    Closed,
}

/// Phase of a COUNT query on one relay.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum CountPhase {
    #[default]
    Idle,
    /// COUNT sent, waiting for the reply.
    Sent { filters: Filters },
    /// Reply received.
    Counted { filters: Filters, count: u64 },
    Closing { filters: Filters },
    Closed,
    Stale { filters: Filters },
}

/// Externally visible COUNT status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountStatus {
    Idle,
    Sent,
    Counted(u64),
    Closing,
    Closed,
}

/// Constructors for the notifications every subscription kind emits.
pub trait SubscriptionUpdate: fmt::Debug + Send + 'static {
    /// The open command reached the relay's socket.
    fn started(subscription_id: SubscriptionId, relay: RelayUrl, filters: Filters) -> Self;

    /// The CLOSE command reached the relay's socket.
    fn close_sent(subscription_id: SubscriptionId, relay: RelayUrl) -> Self;

    /// The relay terminated the subscription.
    fn closed(subscription_id: SubscriptionId, relay: RelayUrl, message: String) -> Self;

    /// The relay could not be reached.
    fn cannot_connect(subscription_id: SubscriptionId, relay: RelayUrl, message: String) -> Self;
}

/// Behavior shared by [`ReqPhase`] and [`CountPhase`].
pub trait Phase: Clone + Default + fmt::Debug + Send + Sync + 'static {
    type Status: fmt::Debug + Clone + Copy + PartialEq;
    type Update: SubscriptionUpdate;

    /// Wire name of the open command, for logs.
    const COMMAND: &'static str;

    fn opened(filters: Filters) -> Self;
    fn closing(filters: Filters) -> Self;
    fn closed() -> Self;
    fn stale(filters: Filters) -> Self;

    fn status(&self) -> Self::Status;

    /// Filters last sent to the relay, whatever the phase.
    fn filters(&self) -> Option<&Filters>;

    /// Filters the relay is actively serving.
    fn serving(&self) -> Option<&Filters>;

    /// Waiting for the terminal reply to an open command.
    fn is_in_flight(&self) -> bool;

    fn is_stale(&self) -> bool;

    fn is_closing(&self) -> bool;

    fn open_command(subscription_id: &SubscriptionId, filters: &[Filter]) -> Command;
}

impl Phase for ReqPhase {
    type Status = ReqStatus;
    type Update = crate::requests::ReqUpdate;

    const COMMAND: &'static str = "REQ";

    fn opened(filters: Filters) -> Self {
        ReqPhase::QueryingPast { filters }
    }

    fn closing(filters: Filters) -> Self {
        ReqPhase::Closing { filters }
    }

    fn closed() -> Self {
        ReqPhase::Closed
    }

    fn stale(filters: Filters) -> Self {
        ReqPhase::Stale { filters }
    }

    fn status(&self) -> ReqStatus {
        match self {
            ReqPhase::Idle | ReqPhase::Stale { .. } => ReqStatus::Idle,
            ReqPhase::QueryingPast { .. } => ReqStatus::QueryingPast,
            ReqPhase::Live { .. } => ReqStatus::Live,
            ReqPhase::Closing { .. } => ReqStatus::Closing,
            ReqPhase::Closed => ReqStatus::Closed,
        }
    }

    fn filters(&self) -> Option<&Filters> {
        match self {
            ReqPhase::QueryingPast { filters }
            | ReqPhase::Live { filters }
            | ReqPhase::Closing { filters }
            | ReqPhase::Stale { filters } => Some(filters),
            ReqPhase::Idle | ReqPhase::Closed => None,
        }
    }

    fn serving(&self) -> Option<&Filters> {
        match self {
            ReqPhase::QueryingPast { filters } | ReqPhase::Live { filters } => Some(filters),
            _ => None,
        }
    }

    fn is_in_flight(&self) -> bool {
        matches!(self, ReqPhase::QueryingPast { .. })
    }

    fn is_stale(&self) -> bool {
        matches!(self, ReqPhase::Stale { .. })
    }

    fn is_closing(&self) -> bool {
        matches!(self, ReqPhase::Closing { .. })
    }

    fn open_command(subscription_id: &SubscriptionId, filters: &[Filter]) -> Command {
        Command::Req {
            subscription_id: subscription_id.clone(),
            filters: filters.to_vec(),
        }
    }
}

impl Phase for CountPhase {
    type Status = CountStatus;
    type Update = crate::counts::CountUpdate;

    const COMMAND: &'static str = "COUNT";

    fn opened(filters: Filters) -> Self {
        CountPhase::Sent { filters }
    }

    fn closing(filters: Filters) -> Self {
        CountPhase::Closing { filters }
    }

    fn closed() -> Self {
        CountPhase::Closed
    }

    fn stale(filters: Filters) -> Self {
        CountPhase::Stale { filters }
    }

    fn status(&self) -> CountStatus {
        match self {
            CountPhase::Idle | CountPhase::Stale { .. } => CountStatus::Idle,
            CountPhase::Sent { .. } => CountStatus::Sent,
            CountPhase::Counted { count, .. } => CountStatus::Counted(*count),
            CountPhase::Closing { .. } => CountStatus::Closing,
            CountPhase::Closed => CountStatus::Closed,
        }
    }

    fn filters(&self) -> Option<&Filters> {
        match self {
            CountPhase::Sent { filters }
            | CountPhase::Counted { filters, .. }
            | CountPhase::Closing { filters }
            | CountPhase::Stale { filters } => Some(filters),
            CountPhase::Idle | CountPhase::Closed => None,
        }
    }

    fn serving(&self) -> Option<&Filters> {
        match self {
            CountPhase::Sent { filters } | CountPhase::Counted { filters, .. } => Some(filters),
            _ => None,
        }
    }

    fn is_in_flight(&self) -> bool {
        matches!(self, CountPhase::Sent { .. })
    }

    fn is_stale(&self) -> bool {
        matches!(self, CountPhase::Stale { .. })
    }

    fn is_closing(&self) -> bool {
        matches!(self, CountPhase::Closing { .. })
    }

    fn open_command(subscription_id: &SubscriptionId, filters: &[Filter]) -> Command {
        Command::Count {
            subscription_id: subscription_id.clone(),
            filters: filters.to_vec(),
        }
    }
}

/// Phases of one subscription across all relays it touches.
#[derive(Debug, Clone, Default)]
pub struct RelaySubscriptionState<P> {
    relays: HashMap<RelayUrl, P>,
}

impl<P: Phase> RelaySubscriptionState<P> {
    pub fn new() -> Self {
        Self {
            relays: HashMap::new(),
        }
    }

    pub fn phase(&self, relay: &RelayUrl) -> Option<&P> {
        self.relays.get(relay)
    }

    /// Status on `relay`. Relays never touched report idle.
    pub fn status(&self, relay: &RelayUrl) -> P::Status {
        match self.relays.get(relay) {
            Some(phase) => phase.status(),
            None => P::default().status(),
        }
    }

    /// Filters last sent to `relay`, kept for diagnostics.
    pub fn current_filters(&self, relay: &RelayUrl) -> Option<&Filters> {
        self.relays.get(relay).and_then(P::filters)
    }

    /// Filters `relay` is actively serving.
    pub fn serving_filters(&self, relay: &RelayUrl) -> Option<&Filters> {
        self.relays.get(relay).and_then(P::serving)
    }

    pub fn is_stale(&self, relay: &RelayUrl) -> bool {
        self.relays.get(relay).is_some_and(P::is_stale)
    }

    /// Relays with any recorded phase.
    pub fn relays(&self) -> impl Iterator<Item = &RelayUrl> {
        self.relays.keys()
    }

    /// Relays that currently serve this subscription.
    pub fn serving_relays(&self) -> impl Iterator<Item = &RelayUrl> {
        self.relays
            .iter()
            .filter(|(_, phase)| phase.serving().is_some())
            .map(|(relay, _)| relay)
    }

    pub fn on_open(&mut self, relay: &RelayUrl, filters: Filters) {
        self.relays.insert(relay.clone(), P::opened(filters));
    }

    pub fn on_close_req(&mut self, relay: &RelayUrl) {
        if let Some(phase) = self.relays.get_mut(relay) {
            if let Some(filters) = phase.filters().cloned() {
                *phase = P::closing(filters);
            }
        }
    }

    pub fn on_closed(&mut self, relay: &RelayUrl) {
        self.relays.insert(relay.clone(), P::closed());
    }

    /// The CLOSE left the socket. Only a pending close completes; a pair
    /// reopened in the meantime keeps its new phase.
    pub fn on_close_sent(&mut self, relay: &RelayUrl) {
        if let Some(phase) = self.relays.get_mut(relay) {
            if phase.is_closing() {
                *phase = P::closed();
            }
        }
    }

    pub fn on_connecting(&mut self, relay: &RelayUrl) {
        self.mark_stale(relay);
    }

    pub fn on_disconnected(&mut self, relay: &RelayUrl) {
        self.mark_stale(relay);
    }

    /// The open command never reached the relay.
    pub fn on_send_failed(&mut self, relay: &RelayUrl) {
        if let Some(phase) = self.relays.get_mut(relay) {
            if let Some(filters) = phase.serving().cloned() {
                *phase = P::stale(filters);
            }
        }
    }

    pub fn forget(&mut self, relay: &RelayUrl) {
        self.relays.remove(relay);
    }

    fn mark_stale(&mut self, relay: &RelayUrl) {
        if let Some(phase) = self.relays.get_mut(relay) {
            if phase.is_stale() {
                return;
            }
            if let Some(filters) = phase.filters().cloned() {
                *phase = P::stale(filters);
            }
        }
    }
}

impl RelaySubscriptionState<ReqPhase> {
    /// Events do not move the phase.
    pub fn on_new_event(&mut self, _relay: &RelayUrl) {}

    /// Returns true if the relay moved from querying to live.
    pub fn on_eose(&mut self, relay: &RelayUrl) -> bool {
        let Some(phase) = self.relays.get_mut(relay) else {
            return false;
        };
        if let ReqPhase::QueryingPast { filters } = phase {
            *phase = ReqPhase::Live {
                filters: Arc::clone(filters),
            };
            return true;
        }
        false
    }
}

impl RelaySubscriptionState<CountPhase> {
    /// Returns true if the reply matched an outstanding query.
    pub fn on_count(&mut self, relay: &RelayUrl, count: u64) -> bool {
        let Some(phase) = self.relays.get_mut(relay) else {
            return false;
        };
        if let CountPhase::Sent { filters } = phase {
            *phase = CountPhase::Counted {
                filters: Arc::clone(filters),
                count,
            };
            return true;
        }
        false
    }
}

/// What reconciling one (subscription, relay) pair should do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
    /// Send the open command with these filters.
    Open(Filters),
    /// Send CLOSE.
    Close,
    /// Drop a stale record nobody wants anymore.
    Forget,
    /// A resend is due but the relay is still answering the previous one.
    Deferred,
    Unchanged,
}

/// Decide how to move `phase` toward `desired`.
///
/// `desired` must be `None` rather than an empty slice when the relay is no
/// longer wanted.
pub fn plan<P: Phase>(phase: Option<&P>, desired: Option<&Filters>) -> Plan {
    if phase.is_some_and(P::is_stale) {
        return match desired {
            Some(filters) => Plan::Open(Arc::clone(filters)),
            None => Plan::Forget,
        };
    }

    match (phase.and_then(P::serving), desired) {
        (Some(_), None) => Plan::Close,
        (None, Some(filters)) => Plan::Open(Arc::clone(filters)),
        (Some(serving), Some(filters)) => {
            if !needs_resend(serving, filters) {
                Plan::Unchanged
            } else if phase.is_some_and(P::is_in_flight) {
                Plan::Deferred
            } else {
                Plan::Open(Arc::clone(filters))
            }
        }
        (None, None) => Plan::Unchanged,
    }
}
