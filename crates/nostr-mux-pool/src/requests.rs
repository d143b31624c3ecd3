//! REQ subscriptions.
//!
//! A queued filter change for a relay that is still replaying stored events
//! is applied at its EOSE, never mid-stream, so one relay's event stream is
//! never split across two filter sets.

use nostr_mux_core::{Command, Event, RelayMessage, RelayUrl, SubscriptionId};

use crate::state::{Filters, ReqPhase, ReqStatus, SubscriptionUpdate};
use crate::subscriptions::{Listener, SubscriptionPool};

/// Registry of REQ subscriptions.
pub type RequestPool = SubscriptionPool<ReqPhase>;

/// Channel receiving one subscription's [`ReqUpdate`]s.
pub type ReqListener = Listener<ReqPhase>;

/// Notification delivered to a subscription's listener.
#[derive(Debug, Clone)]
pub enum ReqUpdate {
    /// The REQ reached the relay's socket.
    StartReq {
        subscription_id: SubscriptionId,
        relay: RelayUrl,
        filters: Filters,
    },
    Event {
        subscription_id: SubscriptionId,
        relay: RelayUrl,
        event: Event,
        /// Arrived after EOSE.
        live: bool,
        /// Filters in effect on the relay when the event arrived.
        filters: Option<Filters>,
    },
    Eose {
        subscription_id: SubscriptionId,
        relay: RelayUrl,
    },
    /// The relay ended the subscription; `message` is passed through verbatim.
    Closed {
        subscription_id: SubscriptionId,
        relay: RelayUrl,
        message: String,
    },
    /// The CLOSE reached the relay's socket.
    CloseReq {
        subscription_id: SubscriptionId,
        relay: RelayUrl,
    },
    CannotConnect {
        subscription_id: SubscriptionId,
        relay: RelayUrl,
        message: String,
    },
}

impl ReqUpdate {
    pub fn subscription_id(&self) -> &SubscriptionId {
        match self {
            ReqUpdate::StartReq { subscription_id, .. }
            | ReqUpdate::Event { subscription_id, .. }
            | ReqUpdate::Eose { subscription_id, .. }
            | ReqUpdate::Closed { subscription_id, .. }
            | ReqUpdate::CloseReq { subscription_id, .. }
            | ReqUpdate::CannotConnect { subscription_id, .. } => subscription_id,
        }
    }

    pub fn relay(&self) -> &RelayUrl {
        match self {
            ReqUpdate::StartReq { relay, .. }
            | ReqUpdate::Event { relay, .. }
            | ReqUpdate::Eose { relay, .. }
            | ReqUpdate::Closed { relay, .. }
            | ReqUpdate::CloseReq { relay, .. }
            | ReqUpdate::CannotConnect { relay, .. } => relay,
        }
    }
}

impl SubscriptionUpdate for ReqUpdate {
    fn started(subscription_id: SubscriptionId, relay: RelayUrl, filters: Filters) -> Self {
        ReqUpdate::StartReq {
            subscription_id,
            relay,
            filters,
        }
    }

    fn close_sent(subscription_id: SubscriptionId, relay: RelayUrl) -> Self {
        ReqUpdate::CloseReq {
            subscription_id,
            relay,
        }
    }

    fn closed(subscription_id: SubscriptionId, relay: RelayUrl, message: String) -> Self {
        ReqUpdate::Closed {
            subscription_id,
            relay,
            message,
        }
    }

    fn cannot_connect(subscription_id: SubscriptionId, relay: RelayUrl, message: String) -> Self {
        ReqUpdate::CannotConnect {
            subscription_id,
            relay,
            message,
        }
    }
}

impl SubscriptionPool<ReqPhase> {
    /// Forward an event to the subscription's listener.
    pub fn on_event(&self, relay: &RelayUrl, subscription_id: &SubscriptionId, event: &Event) {
        let forwarded = self.with_entry(subscription_id, |state, listener| {
            state.on_new_event(relay);
            if let Some(listener) = listener {
                let _ = listener.send(ReqUpdate::Event {
                    subscription_id: subscription_id.clone(),
                    relay: relay.clone(),
                    event: event.clone(),
                    live: state.status(relay) == ReqStatus::Live,
                    filters: state.current_filters(relay).cloned(),
                });
            }
        });
        if forwarded.is_none() {
            tracing::trace!(subscription = %subscription_id, %relay, "event for unknown subscription");
        }
    }

    /// Stored events are exhausted. Any filter change queued meanwhile is
    /// sent now.
    pub fn on_eose<D>(&self, relay: &RelayUrl, subscription_id: &SubscriptionId, dispatch: &mut D)
    where
        D: FnMut(&RelayUrl, Command) -> bool,
    {
        let known = self.with_entry(subscription_id, |state, listener| {
            state.on_eose(relay);
            if let Some(listener) = listener {
                let _ = listener.send(ReqUpdate::Eose {
                    subscription_id: subscription_id.clone(),
                    relay: relay.clone(),
                });
            }
        });
        if known.is_some() {
            self.reconcile(subscription_id, relay, dispatch);
        }
    }

    /// Route an inbound relay message. Messages for other pools are ignored.
    pub fn on_incoming_message<D>(&self, relay: &RelayUrl, message: &RelayMessage, dispatch: &mut D)
    where
        D: FnMut(&RelayUrl, Command) -> bool,
    {
        match message {
            RelayMessage::Event {
                subscription_id,
                event,
            } => self.on_event(relay, subscription_id, event),
            RelayMessage::Eose { subscription_id } => self.on_eose(relay, subscription_id, dispatch),
            RelayMessage::Closed {
                subscription_id,
                message,
            } => self.on_closed(relay, subscription_id, message, dispatch),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr_mux_core::{EventId, Filter};
    use std::collections::{HashMap, HashSet};
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct Recorder {
        sent: Vec<(RelayUrl, Command)>,
        refuse: bool,
    }

    impl Recorder {
        fn dispatch(&mut self) -> impl FnMut(&RelayUrl, Command) -> bool + '_ {
            move |relay: &RelayUrl, command: Command| {
                self.sent.push((relay.clone(), command));
                !self.refuse
            }
        }

        fn take(&mut self) -> Vec<(RelayUrl, Command)> {
            std::mem::take(&mut self.sent)
        }
    }

    fn relay(name: &str) -> RelayUrl {
        RelayUrl::parse(&format!("wss://{}.example.com", name)).unwrap()
    }

    fn sub(id: &str) -> SubscriptionId {
        SubscriptionId::new(id).unwrap()
    }

    fn kind1() -> Vec<Filter> {
        vec![Filter::new().kinds([1])]
    }

    fn event() -> Event {
        Event {
            id: EventId::from_bytes([7; 32]),
            pubkey: "ab".repeat(32),
            created_at: 1,
            kind: 1,
            tags: vec![],
            content: String::new(),
            sig: "cd".repeat(64),
        }
    }

    fn open(
        pool: &RequestPool,
        rec: &mut Recorder,
        id: &SubscriptionId,
        filters: HashMap<RelayUrl, Vec<Filter>>,
    ) {
        let affected = pool.add_or_update(id, filters, None);
        pool.reconcile_relays(id, &affected, &mut rec.dispatch());
    }

    #[test]
    fn test_add_then_extend_then_remove() {
        let pool = RequestPool::new();
        let mut rec = Recorder::default();
        let (a, b, s1) = (relay("a"), relay("b"), sub("s1"));

        open(&pool, &mut rec, &s1, HashMap::from([(a.clone(), kind1())]));
        let sent = rec.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, a);
        assert!(matches!(sent[0].1, Command::Req { .. }));

        open(
            &pool,
            &mut rec,
            &s1,
            HashMap::from([(a.clone(), kind1()), (b.clone(), kind1())]),
        );
        let sent = rec.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, b);

        pool.on_eose(&a, &s1, &mut rec.dispatch());
        assert_eq!(pool.status(&s1, &a), Some(ReqStatus::Live));
        assert!(rec.take().is_empty());

        let closing = pool.remove(&s1);
        assert_eq!(closing, HashSet::from([a, b]));
        assert!(!pool.contains(&s1));
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let pool = RequestPool::new();
        let mut rec = Recorder::default();
        let (a, s1) = (relay("a"), sub("s1"));

        pool.add_or_update(&s1, HashMap::from([(a.clone(), kind1())]), None);
        pool.reconcile(&s1, &a, &mut rec.dispatch());
        pool.reconcile(&s1, &a, &mut rec.dispatch());
        assert_eq!(rec.take().len(), 1);

        pool.on_eose(&a, &s1, &mut rec.dispatch());
        pool.reconcile(&s1, &a, &mut rec.dispatch());
        assert!(rec.take().is_empty());
    }

    #[test]
    fn test_change_while_querying_waits_for_eose() {
        let pool = RequestPool::new();
        let mut rec = Recorder::default();
        let (a, s1) = (relay("a"), sub("s1"));

        open(&pool, &mut rec, &s1, HashMap::from([(a.clone(), kind1())]));
        rec.take();

        let narrowed = vec![Filter::new().kinds([1]).authors(["abc"])];
        open(&pool, &mut rec, &s1, HashMap::from([(a.clone(), narrowed.clone())]));
        assert!(rec.take().is_empty());

        pool.on_eose(&a, &s1, &mut rec.dispatch());
        let sent = rec.take();
        assert_eq!(sent.len(), 1);
        match &sent[0].1 {
            Command::Req { filters, .. } => assert_eq!(filters, &narrowed),
            other => panic!("expected REQ, got {:?}", other),
        }
        assert_eq!(pool.status(&s1, &a), Some(ReqStatus::QueryingPast));
    }

    #[test]
    fn test_live_change_resends() {
        let pool = RequestPool::new();
        let mut rec = Recorder::default();
        let (a, s1) = (relay("a"), sub("s1"));

        open(&pool, &mut rec, &s1, HashMap::from([(a.clone(), kind1())]));
        pool.on_eose(&a, &s1, &mut rec.dispatch());
        rec.take();

        let advanced = vec![Filter::new().kinds([1]).since(1_000)];
        open(&pool, &mut rec, &s1, HashMap::from([(a.clone(), advanced)]));
        assert_eq!(rec.take().len(), 1, "since appearing must resend");

        pool.on_eose(&a, &s1, &mut rec.dispatch());
        let later = vec![Filter::new().kinds([1]).since(2_000)];
        open(&pool, &mut rec, &s1, HashMap::from([(a.clone(), later)]));
        assert!(rec.take().is_empty(), "since advancing must not resend");
    }

    #[test]
    fn test_dropping_relay_closes_it() {
        let pool = RequestPool::new();
        let mut rec = Recorder::default();
        let (a, b, s1) = (relay("a"), relay("b"), sub("s1"));

        open(
            &pool,
            &mut rec,
            &s1,
            HashMap::from([(a.clone(), kind1()), (b.clone(), kind1())]),
        );
        rec.take();

        open(&pool, &mut rec, &s1, HashMap::from([(a.clone(), kind1())]));
        let sent = rec.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, b);
        assert!(matches!(sent[0].1, Command::Close { .. }));
        assert_eq!(pool.status(&s1, &b), Some(ReqStatus::Closing));

        pool.on_sent(&b, &sent[0].1, true);
        assert_eq!(pool.status(&s1, &b), Some(ReqStatus::Closed));
    }

    #[test]
    fn test_refused_command_leaves_state_untouched() {
        let pool = RequestPool::new();
        let mut rec = Recorder {
            refuse: true,
            ..Default::default()
        };
        let (a, s1) = (relay("a"), sub("s1"));

        open(&pool, &mut rec, &s1, HashMap::from([(a.clone(), kind1())]));
        assert_eq!(rec.take().len(), 1);
        assert_eq!(pool.status(&s1, &a), Some(ReqStatus::Idle));

        rec.refuse = false;
        pool.sync_state(&a, &mut rec.dispatch());
        assert_eq!(rec.take().len(), 1);
        assert_eq!(pool.status(&s1, &a), Some(ReqStatus::QueryingPast));
    }

    #[test]
    fn test_disconnect_then_resync() {
        let pool = RequestPool::new();
        let mut rec = Recorder::default();
        let (a, s1) = (relay("a"), sub("s1"));

        open(&pool, &mut rec, &s1, HashMap::from([(a.clone(), kind1())]));
        pool.on_eose(&a, &s1, &mut rec.dispatch());
        rec.take();

        pool.on_disconnected(&a);
        assert!(pool.is_stale(&s1, &a));
        assert!(pool.active_filters_for(&a).is_empty());

        pool.sync_state(&a, &mut rec.dispatch());
        assert_eq!(rec.take().len(), 1);
        assert!(!pool.is_stale(&s1, &a));
        assert_eq!(pool.active_filters_for(&a).len(), 1);
    }

    #[test]
    fn test_stale_relay_no_longer_desired_is_forgotten() {
        let pool = RequestPool::new();
        let mut rec = Recorder::default();
        let (a, s1) = (relay("a"), sub("s1"));

        open(&pool, &mut rec, &s1, HashMap::from([(a.clone(), kind1())]));
        pool.on_connecting(&a);
        rec.take();

        open(&pool, &mut rec, &s1, HashMap::new());
        assert!(rec.take().is_empty(), "no CLOSE to a relay that lost the subscription");
        assert!(!pool.is_stale(&s1, &a));
    }

    #[test]
    fn test_failed_send_marks_stale() {
        let pool = RequestPool::new();
        let mut rec = Recorder::default();
        let (a, s1) = (relay("a"), sub("s1"));

        open(&pool, &mut rec, &s1, HashMap::from([(a.clone(), kind1())]));
        let sent = rec.take();
        pool.on_sent(&a, &sent[0].1, false);
        assert!(pool.is_stale(&s1, &a));
    }

    #[test]
    fn test_closed_by_relay_reopens_when_desired() {
        let pool = RequestPool::new();
        let mut rec = Recorder::default();
        let (a, s1) = (relay("a"), sub("s1"));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let affected = pool.add_or_update(&s1, HashMap::from([(a.clone(), kind1())]), Some(tx));
        pool.reconcile_relays(&s1, &affected, &mut rec.dispatch());
        rec.take();

        let closed = RelayMessage::Closed {
            subscription_id: s1.clone(),
            message: "error: shutting down".into(),
        };
        pool.on_incoming_message(&a, &closed, &mut rec.dispatch());

        match rx.try_recv().unwrap() {
            ReqUpdate::Closed { message, .. } => assert_eq!(message, "error: shutting down"),
            other => panic!("expected Closed, got {:?}", other),
        }
        let sent = rec.take();
        assert_eq!(sent.len(), 1);
        assert!(matches!(sent[0].1, Command::Req { .. }));
    }

    #[test]
    fn test_listener_sees_events_with_live_flag() {
        let pool = RequestPool::new();
        let mut rec = Recorder::default();
        let (a, s1) = (relay("a"), sub("s1"));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let affected = pool.add_or_update(&s1, HashMap::from([(a.clone(), kind1())]), Some(tx));
        pool.reconcile_relays(&s1, &affected, &mut rec.dispatch());
        let sent = rec.take();
        pool.on_sent(&a, &sent[0].1, true);
        assert!(matches!(rx.try_recv().unwrap(), ReqUpdate::StartReq { .. }));

        let msg = RelayMessage::Event {
            subscription_id: s1.clone(),
            event: event(),
        };
        pool.on_incoming_message(&a, &msg, &mut rec.dispatch());
        assert!(matches!(
            rx.try_recv().unwrap(),
            ReqUpdate::Event { live: false, filters: Some(_), .. }
        ));

        pool.on_eose(&a, &s1, &mut rec.dispatch());
        assert!(matches!(rx.try_recv().unwrap(), ReqUpdate::Eose { .. }));

        pool.on_incoming_message(&a, &msg, &mut rec.dispatch());
        assert!(matches!(rx.try_recv().unwrap(), ReqUpdate::Event { live: true, .. }));
    }

    #[test]
    fn test_cannot_connect_keeps_desired_state() {
        let pool = RequestPool::new();
        let (a, s1) = (relay("a"), sub("s1"));
        let (tx, mut rx) = mpsc::unbounded_channel();

        pool.add_or_update(&s1, HashMap::from([(a.clone(), kind1())]), Some(tx));
        pool.on_cannot_connect(&a, "connection refused");

        assert!(matches!(rx.try_recv().unwrap(), ReqUpdate::CannotConnect { .. }));
        assert_eq!(pool.filters_of(&s1).unwrap().len(), 1);
    }

    #[test]
    fn test_desired_relays_watch() {
        let pool = RequestPool::new();
        let rx = pool.desired_relays();
        let (a, b) = (relay("a"), relay("b"));

        pool.add_or_update(&sub("s1"), HashMap::from([(a.clone(), kind1())]), None);
        pool.add_or_update(&sub("s2"), HashMap::from([(b.clone(), kind1())]), None);
        assert_eq!(*rx.borrow(), HashSet::from([a.clone(), b]));

        pool.remove(&sub("s2"));
        assert_eq!(*rx.borrow(), HashSet::from([a]));
    }

    #[test]
    fn test_desired_relays_watch_survives_concurrent_updates() {
        let pool = std::sync::Arc::new(RequestPool::new());
        let (a, b) = (relay("a"), relay("b"));

        for round in 0..200 {
            let kept = sub(&format!("kept{}", round));
            let steady = {
                let pool = std::sync::Arc::clone(&pool);
                let (a, kept) = (a.clone(), kept.clone());
                std::thread::spawn(move || {
                    for i in 0..4 {
                        let id = sub(&format!("a{}-{}", round, i));
                        pool.add_or_update(&id, HashMap::from([(a.clone(), kind1())]), None);
                        pool.remove(&id);
                    }
                    pool.add_or_update(&kept, HashMap::from([(a, kind1())]), None);
                })
            };
            let churn = {
                let pool = std::sync::Arc::clone(&pool);
                let b = b.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        let id = sub(&format!("b{}-{}", round, i));
                        pool.add_or_update(&id, HashMap::from([(b.clone(), kind1())]), None);
                        pool.remove(&id);
                    }
                })
            };
            steady.join().unwrap();
            churn.join().unwrap();

            assert_eq!(*pool.desired_relays().borrow(), HashSet::from([a.clone()]), "round {}", round);
            pool.remove(&kept);
            assert!(pool.desired_relays().borrow().is_empty(), "round {}", round);
        }
    }
}
