//! Desired-state registry shared by REQ subscriptions and COUNT queries.
//!
//! The application states what it wants per relay; the pool compares that
//! against what each relay was last told and emits the minimal command to
//! close the gap. Desired state is the source of truth and survives every
//! connectivity failure.
//!
//! All decisions for one subscription happen under its map entry guard, so
//! an inbound EOSE and an application update for the same subscription id
//! can never interleave between the compare and the write.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, watch};

use nostr_mux_core::{Command, Filter, RelayUrl, SubscriptionId};

use crate::state::{plan, Filters, Phase, Plan, RelaySubscriptionState, SubscriptionUpdate};

/// Channel receiving a subscription's updates.
pub type Listener<P> = mpsc::UnboundedSender<<P as Phase>::Update>;

struct Entry<P: Phase> {
    desired: HashMap<RelayUrl, Filters>,
    listener: Option<Listener<P>>,
    state: RelaySubscriptionState<P>,
}

impl<P: Phase> Entry<P> {
    fn notify(&self, update: P::Update) {
        if let Some(listener) = &self.listener {
            // A dropped receiver just means nobody is listening anymore.
            let _ = listener.send(update);
        }
    }
}

/// Desired-state registry for one subscription kind.
///
/// Use through the [`RequestPool`](crate::RequestPool) and
/// [`CountPool`](crate::CountPool) aliases.
pub struct SubscriptionPool<P: Phase> {
    entries: DashMap<SubscriptionId, Entry<P>>,
    desired_relays: watch::Sender<HashSet<RelayUrl>>,
}

impl<P: Phase> Default for SubscriptionPool<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Phase> SubscriptionPool<P> {
    pub fn new() -> Self {
        let (desired_relays, _) = watch::channel(HashSet::new());
        Self {
            entries: DashMap::new(),
            desired_relays,
        }
    }

    /// Replace the desired filters of `subscription_id`.
    ///
    /// Relays mapped to an empty filter list count as not desired. If
    /// `listener` is `Some` it replaces the previous one.
    ///
    /// Returns every relay whose state may need to change: the previously
    /// desired relays, the newly desired relays, and relays still holding
    /// state for this subscription.
    pub fn add_or_update(
        &self,
        subscription_id: &SubscriptionId,
        filters_by_relay: HashMap<RelayUrl, Vec<Filter>>,
        listener: Option<Listener<P>>,
    ) -> HashSet<RelayUrl> {
        let desired: HashMap<RelayUrl, Filters> = filters_by_relay
            .into_iter()
            .filter(|(_, filters)| !filters.is_empty())
            .map(|(relay, filters)| (relay, Filters::from(filters)))
            .collect();

        let affected = {
            let mut entry = self
                .entries
                .entry(subscription_id.clone())
                .or_insert_with(|| Entry {
                    desired: HashMap::new(),
                    listener: None,
                    state: RelaySubscriptionState::new(),
                });

            let mut affected: HashSet<RelayUrl> = entry.desired.keys().cloned().collect();
            affected.extend(desired.keys().cloned());
            affected.extend(entry.state.relays().cloned());

            entry.desired = desired;
            if listener.is_some() {
                entry.listener = listener;
            }
            affected
        };

        tracing::debug!(
            kind = P::COMMAND,
            subscription = %subscription_id,
            relays = affected.len(),
            "desired filters updated"
        );
        self.publish_desired_relays();
        affected
    }

    /// Forget `subscription_id` entirely.
    ///
    /// Returns the relays currently serving it, which must be sent CLOSE.
    pub fn remove(&self, subscription_id: &SubscriptionId) -> HashSet<RelayUrl> {
        let Some((_, entry)) = self.entries.remove(subscription_id) else {
            return HashSet::new();
        };

        let serving: HashSet<RelayUrl> = entry.state.serving_relays().cloned().collect();
        tracing::debug!(
            kind = P::COMMAND,
            subscription = %subscription_id,
            relays = serving.len(),
            "subscription removed"
        );
        self.publish_desired_relays();
        serving
    }

    /// Move one (subscription, relay) pair toward its desired state.
    ///
    /// `dispatch` hands a command to the relay's connection and reports
    /// whether it was accepted. State only advances for accepted commands,
    /// so a refused command is retried by the next reconcile.
    pub fn reconcile<D>(&self, subscription_id: &SubscriptionId, relay: &RelayUrl, dispatch: &mut D)
    where
        D: FnMut(&RelayUrl, Command) -> bool,
    {
        let Some(mut guard) = self.entries.get_mut(subscription_id) else {
            return;
        };
        let entry = &mut *guard;

        match plan(entry.state.phase(relay), entry.desired.get(relay)) {
            Plan::Open(filters) => {
                let command = P::open_command(subscription_id, &filters);
                if dispatch(relay, command) {
                    tracing::debug!(
                        kind = P::COMMAND,
                        subscription = %subscription_id,
                        %relay,
                        filters = filters.len(),
                        "opened"
                    );
                    entry.state.on_open(relay, filters);
                } else {
                    tracing::trace!(kind = P::COMMAND, subscription = %subscription_id, %relay, "open not accepted");
                }
            }
            Plan::Close => {
                let command = Command::Close {
                    subscription_id: subscription_id.clone(),
                };
                if dispatch(relay, command) {
                    tracing::debug!(kind = P::COMMAND, subscription = %subscription_id, %relay, "closing");
                    entry.state.on_close_req(relay);
                } else {
                    // No open socket, so the relay already dropped it.
                    entry.state.on_closed(relay);
                }
            }
            Plan::Forget => entry.state.forget(relay),
            Plan::Deferred => {
                tracing::trace!(
                    kind = P::COMMAND,
                    subscription = %subscription_id,
                    %relay,
                    "resend deferred until the relay answers"
                );
            }
            Plan::Unchanged => {}
        }
    }

    /// [`reconcile`](Self::reconcile) every relay in `relays`.
    pub fn reconcile_relays<'a, D, I>(&self, subscription_id: &SubscriptionId, relays: I, dispatch: &mut D)
    where
        D: FnMut(&RelayUrl, Command) -> bool,
        I: IntoIterator<Item = &'a RelayUrl>,
    {
        for relay in relays {
            self.reconcile(subscription_id, relay, dispatch);
        }
    }

    /// Reconcile every subscription that desires or holds state on `relay`.
    ///
    /// Called when a connection comes up.
    pub fn sync_state<D>(&self, relay: &RelayUrl, dispatch: &mut D)
    where
        D: FnMut(&RelayUrl, Command) -> bool,
    {
        for subscription_id in self.subscriptions_touching(relay) {
            self.reconcile(&subscription_id, relay, dispatch);
        }
    }

    /// The socket reported the result of sending `command`.
    pub fn on_sent(&self, relay: &RelayUrl, command: &Command, success: bool) {
        let Some(subscription_id) = command.subscription_id() else {
            return;
        };
        let Some(mut entry) = self.entries.get_mut(subscription_id) else {
            return;
        };

        match command {
            Command::Close { .. } => {
                entry.state.on_close_sent(relay);
                if success {
                    entry.notify(P::Update::close_sent(subscription_id.clone(), relay.clone()));
                }
            }
            Command::Req { filters, .. } | Command::Count { filters, .. } => {
                if command.label() != P::COMMAND {
                    return;
                }
                if success {
                    let filters = entry
                        .state
                        .current_filters(relay)
                        .cloned()
                        .unwrap_or_else(|| Filters::from(filters.clone()));
                    entry.notify(P::Update::started(subscription_id.clone(), relay.clone(), filters));
                } else {
                    tracing::warn!(
                        kind = P::COMMAND,
                        subscription = %subscription_id,
                        %relay,
                        "send failed, will resend on reconnect"
                    );
                    entry.state.on_send_failed(relay);
                }
            }
            Command::Event(_) | Command::Auth(_) => {}
        }
    }

    /// The relay terminated a subscription. It is reopened right away if
    /// still desired.
    pub fn on_closed<D>(
        &self,
        relay: &RelayUrl,
        subscription_id: &SubscriptionId,
        message: &str,
        dispatch: &mut D,
    ) where
        D: FnMut(&RelayUrl, Command) -> bool,
    {
        {
            let Some(mut entry) = self.entries.get_mut(subscription_id) else {
                return;
            };
            entry.state.on_closed(relay);
            entry.notify(P::Update::closed(
                subscription_id.clone(),
                relay.clone(),
                message.to_string(),
            ));
        }
        tracing::debug!(kind = P::COMMAND, subscription = %subscription_id, %relay, reason = message, "closed by relay");
        self.reconcile(subscription_id, relay, dispatch);
    }

    pub fn on_connecting(&self, relay: &RelayUrl) {
        for mut entry in self.entries.iter_mut() {
            entry.state.on_connecting(relay);
        }
    }

    pub fn on_disconnected(&self, relay: &RelayUrl) {
        for mut entry in self.entries.iter_mut() {
            entry.state.on_disconnected(relay);
        }
    }

    /// Tell every listener interested in `relay` that it is unreachable.
    /// Desired state is left alone.
    pub fn on_cannot_connect(&self, relay: &RelayUrl, message: &str) {
        for entry in self.entries.iter() {
            if entry.desired.contains_key(relay) {
                entry.notify(P::Update::cannot_connect(
                    entry.key().clone(),
                    relay.clone(),
                    message.to_string(),
                ));
            }
        }
    }

    /// Live view of every relay some subscription desires.
    pub fn desired_relays(&self) -> watch::Receiver<HashSet<RelayUrl>> {
        self.desired_relays.subscribe()
    }

    /// Filters each subscription is actively being served on `relay`.
    pub fn active_filters_for(&self, relay: &RelayUrl) -> HashMap<SubscriptionId, Filters> {
        self.entries
            .iter()
            .filter_map(|entry| {
                entry
                    .state
                    .serving_filters(relay)
                    .map(|filters| (entry.key().clone(), Arc::clone(filters)))
            })
            .collect()
    }

    /// Desired filters of `subscription_id`, per relay.
    pub fn filters_of(&self, subscription_id: &SubscriptionId) -> Option<HashMap<RelayUrl, Filters>> {
        self.entries
            .get(subscription_id)
            .map(|entry| entry.desired.clone())
    }

    /// Status of `subscription_id` on `relay`, if the subscription exists.
    pub fn status(&self, subscription_id: &SubscriptionId, relay: &RelayUrl) -> Option<P::Status> {
        self.entries
            .get(subscription_id)
            .map(|entry| entry.state.status(relay))
    }

    pub fn is_stale(&self, subscription_id: &SubscriptionId, relay: &RelayUrl) -> bool {
        self.entries
            .get(subscription_id)
            .is_some_and(|entry| entry.state.is_stale(relay))
    }

    pub fn contains(&self, subscription_id: &SubscriptionId) -> bool {
        self.entries.contains_key(subscription_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run `f` against one subscription's per-relay state.
    pub(crate) fn with_entry<R>(
        &self,
        subscription_id: &SubscriptionId,
        f: impl FnOnce(&mut RelaySubscriptionState<P>, Option<&Listener<P>>) -> R,
    ) -> Option<R> {
        let mut guard = self.entries.get_mut(subscription_id)?;
        let entry = &mut *guard;
        Some(f(&mut entry.state, entry.listener.as_ref()))
    }

    fn subscriptions_touching(&self, relay: &RelayUrl) -> Vec<SubscriptionId> {
        self.entries
            .iter()
            .filter(|entry| {
                entry.desired.contains_key(relay) || entry.state.phase(relay).is_some()
            })
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Snapshot inside the watch lock: concurrent publishers are serialized
    /// and the last one always sees every earlier write.
    fn publish_desired_relays(&self) {
        self.desired_relays.send_if_modified(|current| {
            let relays: HashSet<RelayUrl> = self
                .entries
                .iter()
                .flat_map(|entry| entry.desired.keys().cloned().collect::<Vec<_>>())
                .collect();
            if *current == relays {
                false
            } else {
                *current = relays;
                true
            }
        });
    }
}
