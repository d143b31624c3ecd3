//! At-least-once event publication with bounded retries.
//!
//! Every published event stays pending until each target relay is done
//! with it. A relay is done once it accepts the event, once it has answered
//! `max_responses` times, or once the event was sent `max_tries` times.
//! The try ceiling bounds relays that never answer; the response ceiling
//! bounds relays that keep rejecting.

use std::collections::{HashMap, HashSet};

use dashmap::DashMap;
use tokio::sync::{mpsc, watch};

use nostr_mux_core::{now_millis, Command, Event, EventId, RelayMessage, RelayUrl};

/// Retry ceilings for published events.
#[derive(Debug, Clone)]
pub struct OutboxConfig {
    /// Sends per relay before giving up on a silent relay.
    pub max_tries: usize,
    /// Answers per relay before giving up on a rejecting relay.
    pub max_responses: usize,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            max_tries: 3,
            max_responses: 2,
        }
    }
}

/// Delivery record of one event on one relay.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryState {
    /// Send timestamps, milliseconds since the epoch.
    pub tries: Vec<u64>,
    /// `(success, message)` per answer, in arrival order.
    pub responses: Vec<(bool, String)>,
    reported: bool,
}

impl DeliveryState {
    pub fn succeeded(&self) -> bool {
        self.responses.iter().any(|(success, _)| *success)
    }

    pub fn is_done(&self, config: &OutboxConfig) -> bool {
        self.succeeded()
            || self.responses.len() >= config.max_responses
            || self.tries.len() >= config.max_tries
    }

    fn last_message(&self) -> Option<String> {
        self.responses.last().map(|(_, message)| message.clone())
    }
}

/// An event still owed to at least one relay.
#[derive(Debug, Clone)]
pub struct PendingEvent {
    pub event: Event,
    pub relays: HashMap<RelayUrl, DeliveryState>,
}

impl PendingEvent {
    fn all_done(&self, config: &OutboxConfig) -> bool {
        self.relays.values().all(|state| state.is_done(config))
    }
}

/// Notification of delivery progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboxUpdate {
    /// `relay` will not be sent `event_id` again. Reported once per pair.
    RelayDone {
        event_id: EventId,
        relay: RelayUrl,
        success: bool,
        message: Option<String>,
    },
    /// Every target relay is done and the event was dropped.
    Completed { event_id: EventId },
}

/// Pending published events.
pub struct EventOutbox {
    config: OutboxConfig,
    pending: DashMap<EventId, PendingEvent>,
    relays: watch::Sender<HashSet<RelayUrl>>,
    listener: Option<mpsc::UnboundedSender<OutboxUpdate>>,
}

impl Default for EventOutbox {
    fn default() -> Self {
        Self::new(OutboxConfig::default())
    }
}

impl EventOutbox {
    pub fn new(config: OutboxConfig) -> Self {
        let (relays, _) = watch::channel(HashSet::new());
        Self {
            config,
            pending: DashMap::new(),
            relays,
            listener: None,
        }
    }

    /// Report progress on `listener`.
    pub fn with_listener(mut self, listener: mpsc::UnboundedSender<OutboxUpdate>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn config(&self) -> &OutboxConfig {
        &self.config
    }

    /// Track `event` for `relays` and return the relays it still has to go to.
    ///
    /// Calling this again with overlapping relays neither resets nor double
    /// counts existing records.
    pub fn mark_as_sending(&self, event: &Event, relays: &HashSet<RelayUrl>) -> HashSet<RelayUrl> {
        // Nothing would ever complete, and so purge, an event with no targets.
        if relays.is_empty() {
            return HashSet::new();
        }

        let to_send = {
            let mut entry = self
                .pending
                .entry(event.id)
                .or_insert_with(|| PendingEvent {
                    event: event.clone(),
                    relays: HashMap::new(),
                });
            for relay in relays {
                entry.relays.entry(relay.clone()).or_default();
            }
            relays
                .iter()
                .filter(|relay| {
                    entry
                        .relays
                        .get(*relay)
                        .is_some_and(|state| !state.is_done(&self.config))
                })
                .cloned()
                .collect()
        };

        tracing::debug!(event = %event.id, relays = relays.len(), "event queued");
        self.publish_relays();
        to_send
    }

    /// Record a send of `event_id` to `relay`.
    pub fn new_try(&self, event_id: &EventId, relay: &RelayUrl) {
        self.record(event_id, relay, |state| state.tries.push(now_millis()));
    }

    /// Record an answer from `relay` about `event_id`.
    pub fn new_response(&self, event_id: &EventId, relay: &RelayUrl, success: bool, message: &str) {
        if !success {
            tracing::debug!(event = %event_id, %relay, reason = message, "event rejected");
        }
        self.record(event_id, relay, |state| {
            state.responses.push((success, message.to_string()))
        });
    }

    /// Count a connection failure as a rejection of everything owed to `relay`.
    pub fn on_cannot_connect(&self, relay: &RelayUrl, reason: &str) {
        let owed: Vec<EventId> = self
            .pending
            .iter()
            .filter(|entry| {
                entry
                    .relays
                    .get(relay)
                    .is_some_and(|state| !state.is_done(&self.config))
            })
            .map(|entry| *entry.key())
            .collect();

        for event_id in owed {
            self.new_response(&event_id, relay, false, reason);
        }
    }

    /// A successfully sent EVENT counts as a try.
    pub fn on_sent(&self, relay: &RelayUrl, command: &Command, success: bool) {
        if let Command::Event(event) = command {
            if success {
                self.new_try(&event.id, relay);
            }
        }
    }

    pub fn on_incoming_message(&self, relay: &RelayUrl, message: &RelayMessage) {
        if let RelayMessage::Ok {
            event_id,
            success,
            message,
        } = message
        {
            self.new_response(event_id, relay, *success, message);
        }
    }

    /// Dispatch `event_id` to every relay in `relays` that is not done.
    pub fn send_to_relays<'a, D, I>(&self, event_id: &EventId, relays: I, dispatch: &mut D)
    where
        D: FnMut(&RelayUrl, Command) -> bool,
        I: IntoIterator<Item = &'a RelayUrl>,
    {
        let Some((event, owed)) = self.pending.get(event_id).map(|entry| {
            let owed: HashSet<RelayUrl> = entry
                .relays
                .iter()
                .filter(|(_, state)| !state.is_done(&self.config))
                .map(|(relay, _)| relay.clone())
                .collect();
            (entry.event.clone(), owed)
        }) else {
            return;
        };

        for relay in relays.into_iter().filter(|relay| owed.contains(*relay)) {
            dispatch(relay, Command::Event(event.clone()));
        }
    }

    /// Dispatch every event still owed to `relay`. Called when a connection
    /// comes up.
    pub fn sync_state<D>(&self, relay: &RelayUrl, dispatch: &mut D)
    where
        D: FnMut(&RelayUrl, Command) -> bool,
    {
        for event in self.pending_for(relay) {
            dispatch(relay, Command::Event(event));
        }
    }

    /// Events still owed to `relay`.
    pub fn pending_for(&self, relay: &RelayUrl) -> Vec<Event> {
        self.pending
            .iter()
            .filter(|entry| {
                entry
                    .relays
                    .get(relay)
                    .is_some_and(|state| !state.is_done(&self.config))
            })
            .map(|entry| entry.event.clone())
            .collect()
    }

    pub fn is_pending(&self, event_id: &EventId) -> bool {
        self.pending.contains_key(event_id)
    }

    /// Snapshot of one delivery record.
    pub fn delivery(&self, event_id: &EventId, relay: &RelayUrl) -> Option<DeliveryState> {
        self.pending
            .get(event_id)
            .and_then(|entry| entry.relays.get(relay).cloned())
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Live view of every relay still owed some event.
    pub fn relays(&self) -> watch::Receiver<HashSet<RelayUrl>> {
        self.relays.subscribe()
    }

    fn record(&self, event_id: &EventId, relay: &RelayUrl, update: impl FnOnce(&mut DeliveryState)) {
        let (newly_done, all_done) = {
            let Some(mut entry) = self.pending.get_mut(event_id) else {
                return;
            };
            let config = &self.config;
            let Some(state) = entry.relays.get_mut(relay) else {
                return;
            };
            if state.is_done(config) {
                return;
            }

            update(state);
            let newly_done = if state.is_done(config) && !state.reported {
                state.reported = true;
                Some(OutboxUpdate::RelayDone {
                    event_id: *event_id,
                    relay: relay.clone(),
                    success: state.succeeded(),
                    message: state.last_message(),
                })
            } else {
                None
            };
            (newly_done, entry.all_done(config))
        };

        let Some(update) = newly_done else {
            return;
        };
        if let OutboxUpdate::RelayDone { success: false, .. } = &update {
            tracing::warn!(event = %event_id, %relay, "giving up on relay");
        }
        self.notify(update);

        if all_done && self.pending.remove_if(event_id, |_, p| p.all_done(&self.config)).is_some() {
            tracing::debug!(event = %event_id, "event delivery finished");
            self.notify(OutboxUpdate::Completed { event_id: *event_id });
        }
        self.publish_relays();
    }

    fn notify(&self, update: OutboxUpdate) {
        if let Some(listener) = &self.listener {
            let _ = listener.send(update);
        }
    }

    /// Snapshot and publish under the watch lock, so a publisher that read
    /// the map earlier can never overwrite a newer snapshot.
    fn publish_relays(&self) {
        self.relays.send_if_modified(|current| {
            let relays: HashSet<RelayUrl> = self
                .pending
                .iter()
                .flat_map(|entry| {
                    entry
                        .relays
                        .iter()
                        .filter(|(_, state)| !state.is_done(&self.config))
                        .map(|(relay, _)| relay.clone())
                        .collect::<Vec<_>>()
                })
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

#[cfg(test)]
mod tests {
    use super::*;

    fn relay(name: &str) -> RelayUrl {
        RelayUrl::parse(&format!("wss://{}.example.com", name)).unwrap()
    }

    fn event(tag: u8) -> Event {
        Event {
            id: EventId::from_bytes([tag; 32]),
            pubkey: "ab".repeat(32),
            created_at: 1_700_000_000,
            kind: 1,
            tags: vec![],
            content: "hello".into(),
            sig: "cd".repeat(64),
        }
    }

    fn numbered(lane: u8, round: u8, i: u8) -> Event {
        let mut ev = event(lane);
        ev.id.0[0] = lane;
        ev.id.0[1] = round;
        ev.id.0[2] = i;
        ev.id.0[3] = 0;
        ev
    }

    fn outbox() -> (EventOutbox, mpsc::UnboundedReceiver<OutboxUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (EventOutbox::default().with_listener(tx), rx)
    }

    #[test]
    fn test_two_failures_purge() {
        let (outbox, mut rx) = outbox();
        let a = relay("a");
        let ev = event(1);

        outbox.mark_as_sending(&ev, &HashSet::from([a.clone()]));
        outbox.new_response(&ev.id, &a, false, "blocked");
        assert!(outbox.is_pending(&ev.id));
        outbox.new_response(&ev.id, &a, false, "blocked");
        assert!(!outbox.is_pending(&ev.id));

        assert_eq!(
            rx.try_recv().unwrap(),
            OutboxUpdate::RelayDone {
                event_id: ev.id,
                relay: a,
                success: false,
                message: Some("blocked".into()),
            }
        );
        assert_eq!(rx.try_recv().unwrap(), OutboxUpdate::Completed { event_id: ev.id });
    }

    #[test]
    fn test_silent_relay_gets_three_tries() {
        let (outbox, _rx) = outbox();
        let a = relay("a");
        let ev = event(2);
        outbox.mark_as_sending(&ev, &HashSet::from([a.clone()]));

        let mut tries = 0;
        while outbox.is_pending(&ev.id) {
            let mut sent = Vec::new();
            outbox.sync_state(&a, &mut |_: &RelayUrl, cmd: Command| {
                sent.push(cmd);
                true
            });
            assert!(sent.len() <= 1);
            for cmd in sent {
                tries += 1;
                outbox.on_sent(&a, &cmd, true);
            }
            assert!(tries <= 3, "relay retried past the ceiling");
        }
        assert_eq!(tries, 3);
    }

    #[test]
    fn test_success_is_final() {
        let (outbox, mut rx) = outbox();
        let (a, b) = (relay("a"), relay("b"));
        let ev = event(3);

        outbox.mark_as_sending(&ev, &HashSet::from([a.clone(), b.clone()]));
        outbox.new_try(&ev.id, &a);
        outbox.new_response(&ev.id, &a, true, "");
        assert!(outbox.is_pending(&ev.id), "b is still owed the event");
        assert!(outbox.pending_for(&a).is_empty());
        assert_eq!(outbox.pending_for(&b).len(), 1);

        assert!(matches!(
            rx.try_recv().unwrap(),
            OutboxUpdate::RelayDone { success: true, .. }
        ));

        let ok = RelayMessage::Ok {
            event_id: ev.id,
            success: true,
            message: String::new(),
        };
        outbox.on_incoming_message(&b, &ok);
        assert!(outbox.is_empty());
    }

    #[test]
    fn test_mark_as_sending_is_idempotent() {
        let (outbox, _rx) = outbox();
        let (a, b) = (relay("a"), relay("b"));
        let ev = event(4);

        let first = outbox.mark_as_sending(&ev, &HashSet::from([a.clone()]));
        outbox.new_try(&ev.id, &a);
        let second = outbox.mark_as_sending(&ev, &HashSet::from([a.clone(), b.clone()]));

        assert_eq!(first, HashSet::from([a.clone()]));
        assert_eq!(second, HashSet::from([a.clone(), b]));
        assert_eq!(outbox.delivery(&ev.id, &a).unwrap().tries.len(), 1);
    }

    #[test]
    fn test_done_relay_is_not_returned() {
        let (outbox, _rx) = outbox();
        let (a, b) = (relay("a"), relay("b"));
        let ev = event(5);

        outbox.mark_as_sending(&ev, &HashSet::from([a.clone(), b.clone()]));
        outbox.new_response(&ev.id, &a, true, "");
        let again = outbox.mark_as_sending(&ev, &HashSet::from([a.clone(), b.clone()]));
        assert_eq!(again, HashSet::from([b.clone()]));

        let mut sent = Vec::new();
        outbox.send_to_relays(&ev.id, [&a, &b], &mut |relay: &RelayUrl, _: Command| {
            sent.push(relay.clone());
            true
        });
        assert_eq!(sent, vec![b]);
    }

    #[test]
    fn test_cannot_connect_counts_as_failure() {
        let (outbox, _rx) = outbox();
        let a = relay("a");
        let ev = event(6);

        outbox.mark_as_sending(&ev, &HashSet::from([a.clone()]));
        outbox.on_cannot_connect(&a, "connection refused");
        assert_eq!(outbox.delivery(&ev.id, &a).unwrap().responses.len(), 1);
        outbox.on_cannot_connect(&a, "connection refused");
        assert!(!outbox.is_pending(&ev.id));
    }

    #[test]
    fn test_relays_watch_tracks_owed_relays() {
        let (outbox, _rx) = outbox();
        let relays = outbox.relays();
        let a = relay("a");
        let ev = event(7);

        outbox.mark_as_sending(&ev, &HashSet::from([a.clone()]));
        assert!(relays.borrow().contains(&a));

        outbox.new_response(&ev.id, &a, true, "");
        assert!(relays.borrow().is_empty());
    }

    #[test]
    fn test_empty_relay_set_is_not_tracked() {
        let (outbox, _rx) = outbox();
        let ev = event(8);

        assert!(outbox.mark_as_sending(&ev, &HashSet::new()).is_empty());
        assert!(!outbox.is_pending(&ev.id));
        assert!(outbox.is_empty());
    }

    #[test]
    fn test_relays_watch_survives_concurrent_updates() {
        let outbox = std::sync::Arc::new(EventOutbox::default());
        let (a, b) = (relay("a"), relay("b"));

        for round in 0..200u8 {
            let held = event(round);
            let worker_a = {
                let outbox = std::sync::Arc::clone(&outbox);
                let a = a.clone();
                let held = held.clone();
                std::thread::spawn(move || {
                    for i in 0..4u8 {
                        let ev = numbered(0xa0, round, i);
                        outbox.mark_as_sending(&ev, &HashSet::from([a.clone()]));
                        outbox.new_response(&ev.id, &a, true, "");
                    }
                    outbox.mark_as_sending(&held, &HashSet::from([a.clone()]));
                })
            };
            let worker_b = {
                let outbox = std::sync::Arc::clone(&outbox);
                let b = b.clone();
                std::thread::spawn(move || {
                    for i in 0..50u8 {
                        let ev = numbered(0xb0, round, i);
                        outbox.mark_as_sending(&ev, &HashSet::from([b.clone()]));
                        outbox.new_response(&ev.id, &b, true, "");
                    }
                })
            };
            worker_a.join().unwrap();
            worker_b.join().unwrap();

            let owed: HashSet<RelayUrl> = [&a, &b]
                .into_iter()
                .filter(|relay| !outbox.pending_for(relay).is_empty())
                .cloned()
                .collect();
            assert_eq!(*outbox.relays().borrow(), owed, "round {}", round);

            outbox.new_response(&held.id, &a, true, "");
            assert!(outbox.relays().borrow().is_empty(), "round {}", round);
        }
    }
}
