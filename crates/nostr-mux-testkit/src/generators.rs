//! Proptest generators for multiplexer types.

use std::collections::HashMap;

use proptest::prelude::*;

use nostr_mux_core::{Event, EventId, Filter, RelayUrl, SubscriptionId};

use crate::fixtures::{relay, sub};

/// Number of relays in the universe [`SubOp`] draws from.
pub const RELAY_UNIVERSE: usize = 3;

/// Number of subscriptions in the universe [`SubOp`] draws from.
pub const SUBSCRIPTION_UNIVERSE: usize = 3;

/// Generate a relay URL.
pub fn relay_url() -> impl Strategy<Value = RelayUrl> {
    ("[a-z]{1,8}", prop::bool::ANY).prop_map(|(host, secure)| {
        let scheme = if secure { "wss" } else { "ws" };
        RelayUrl::parse(&format!("{}://{}.test", scheme, host)).expect("generated relay url")
    })
}

/// Generate a subscription id.
pub fn subscription_id() -> impl Strategy<Value = SubscriptionId> {
    "[a-z0-9]{1,16}".prop_map(|id| SubscriptionId::new(id).expect("generated subscription id"))
}

/// Generate a 64-char hex string, as used for pubkeys and ids.
pub fn hex32() -> impl Strategy<Value = String> {
    any::<[u8; 32]>().prop_map(hex::encode)
}

/// Generate a filter with a few of the common fields set.
pub fn filter() -> impl Strategy<Value = Filter> {
    (
        prop::collection::btree_set(0u16..10, 0..3),
        prop::option::of(hex32()),
        prop::option::of(1_600_000_000u64..1_700_000_000),
        prop::option::of(1u64..500),
        prop::option::of("[a-z]{1,6}"),
    )
        .prop_map(|(kinds, author, since, limit, topic)| {
            let mut filter = Filter::new();
            if !kinds.is_empty() {
                filter = filter.kinds(kinds);
            }
            if let Some(author) = author {
                filter = filter.authors([author]);
            }
            if let Some(since) = since {
                filter = filter.since(since);
            }
            if let Some(limit) = limit {
                filter = filter.limit(limit);
            }
            if let Some(topic) = topic {
                filter = filter.tag('t', [topic]);
            }
            filter
        })
}

/// Generate a non-empty filter list.
pub fn filters() -> impl Strategy<Value = Vec<Filter>> {
    prop::collection::vec(filter(), 1..4)
}

/// Generate an event id.
pub fn event_id() -> impl Strategy<Value = EventId> {
    any::<[u8; 32]>().prop_map(EventId::from_bytes)
}

/// Generate an event. Signatures are random bytes; nothing here checks them.
pub fn event() -> impl Strategy<Value = Event> {
    (
        event_id(),
        hex32(),
        1_600_000_000u64..1_700_000_000,
        0u16..10_000,
        "[ -~]{0,64}",
        any::<[u8; 32]>(),
    )
        .prop_map(|(id, pubkey, created_at, kind, content, sig)| Event {
            id,
            pubkey,
            created_at,
            kind,
            tags: Vec::new(),
            content,
            sig: hex::encode(sig).repeat(2),
        })
}

/// One step applied to a subscription pool, over a small fixed universe of
/// relays and subscriptions so that steps collide often.
#[derive(Debug, Clone)]
pub enum SubOp {
    /// Replace a subscription's desired filters.
    AddOrUpdate {
        subscription: usize,
        relays: Vec<(usize, Vec<Filter>)>,
    },
    /// Drop a subscription.
    Remove { subscription: usize },
    /// A relay reports end of stored events.
    Eose { subscription: usize, relay: usize },
    /// A relay closes a subscription on its own.
    Closed { subscription: usize, relay: usize },
    /// A relay's connection drops and comes back.
    Reconnect { relay: usize },
    /// A later `since` on the same filters.
    AdvanceSince { subscription: usize, by: u64 },
}

impl SubOp {
    /// The subscription id this step touches, if any.
    pub fn subscription_id(&self) -> Option<SubscriptionId> {
        match self {
            SubOp::AddOrUpdate { subscription, .. }
            | SubOp::Remove { subscription }
            | SubOp::Eose { subscription, .. }
            | SubOp::Closed { subscription, .. }
            | SubOp::AdvanceSince { subscription, .. } => Some(universe_sub(*subscription)),
            SubOp::Reconnect { .. } => None,
        }
    }
}

impl Arbitrary for SubOp {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_: Self::Parameters) -> Self::Strategy {
        let subscription = 0..SUBSCRIPTION_UNIVERSE;
        let relay = 0..RELAY_UNIVERSE;
        prop_oneof![
            3 => (
                subscription.clone(),
                prop::collection::vec((relay.clone(), filters()), 0..=RELAY_UNIVERSE),
            )
                .prop_map(|(subscription, relays)| SubOp::AddOrUpdate { subscription, relays }),
            1 => subscription.clone().prop_map(|subscription| SubOp::Remove { subscription }),
            2 => (subscription.clone(), relay.clone())
                .prop_map(|(subscription, relay)| SubOp::Eose { subscription, relay }),
            1 => (subscription.clone(), relay.clone())
                .prop_map(|(subscription, relay)| SubOp::Closed { subscription, relay }),
            1 => relay.prop_map(|relay| SubOp::Reconnect { relay }),
            1 => (subscription, 1u64..10_000)
                .prop_map(|(subscription, by)| SubOp::AdvanceSince { subscription, by }),
        ]
        .boxed()
    }
}

/// Generate a sequence of pool steps.
pub fn sub_ops(max: usize) -> impl Strategy<Value = Vec<SubOp>> {
    prop::collection::vec(any::<SubOp>(), 1..max)
}

/// Relay `index` of the [`SubOp`] universe.
pub fn universe_relay(index: usize) -> RelayUrl {
    relay(&format!("r{}", index))
}

/// Subscription `index` of the [`SubOp`] universe.
pub fn universe_sub(index: usize) -> SubscriptionId {
    sub(&format!("s{}", index))
}

/// Resolve the relay indices of an [`SubOp::AddOrUpdate`] step. Later
/// entries for the same relay win.
pub fn resolve_relays(relays: &[(usize, Vec<Filter>)]) -> HashMap<RelayUrl, Vec<Filter>> {
    relays
        .iter()
        .map(|(index, filters)| (universe_relay(*index), filters.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr_mux_core::{needs_resend, Command};

    proptest! {
        #[test]
        fn test_generated_filters_round_trip_through_req(
            id in subscription_id(),
            filters in filters(),
        ) {
            let command = Command::Req { subscription_id: id, filters };
            let json = command.to_json().unwrap();
            prop_assert_eq!(Command::from_json(&json).unwrap(), command);
        }

        #[test]
        fn test_filters_never_need_resend_against_themselves(filters in filters()) {
            prop_assert!(!needs_resend(&filters, &filters));
        }

        #[test]
        fn test_since_advance_never_needs_resend(filters in filters(), by in 1u64..100_000) {
            let advanced: Vec<Filter> = filters
                .iter()
                .cloned()
                .map(|f| match f.since {
                    Some(since) => f.since(since + by),
                    None => f,
                })
                .collect();
            prop_assert!(!needs_resend(&filters, &advanced));
        }

        #[test]
        fn test_relay_urls_parse_back(url in relay_url()) {
            prop_assert_eq!(RelayUrl::parse(url.as_str()).unwrap(), url);
        }
    }
}
