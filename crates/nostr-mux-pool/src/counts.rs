//! COUNT queries (NIP-45).
//!
//! Same desired-state machinery as REQ. A COUNT reply is terminal for that
//! relay, so there is no live phase and no event forwarding.

use nostr_mux_core::{Command, RelayMessage, RelayUrl, SubscriptionId};

use crate::state::{CountPhase, Filters, SubscriptionUpdate};
use crate::subscriptions::{Listener, SubscriptionPool};

/// Registry of COUNT queries.
pub type CountPool = SubscriptionPool<CountPhase>;

/// Channel receiving one query's [`CountUpdate`]s.
pub type CountListener = Listener<CountPhase>;

/// Notification delivered to a query's listener.
#[derive(Debug, Clone)]
pub enum CountUpdate {
    StartCount {
        subscription_id: SubscriptionId,
        relay: RelayUrl,
        filters: Filters,
    },
    Count {
        subscription_id: SubscriptionId,
        relay: RelayUrl,
        count: u64,
    },
    Closed {
        subscription_id: SubscriptionId,
        relay: RelayUrl,
        message: String,
    },
    CloseCount {
        subscription_id: SubscriptionId,
        relay: RelayUrl,
    },
    CannotConnect {
        subscription_id: SubscriptionId,
        relay: RelayUrl,
        message: String,
    },
}

impl SubscriptionUpdate for CountUpdate {
    fn started(subscription_id: SubscriptionId, relay: RelayUrl, filters: Filters) -> Self {
        CountUpdate::StartCount {
            subscription_id,
            relay,
            filters,
        }
    }

    fn close_sent(subscription_id: SubscriptionId, relay: RelayUrl) -> Self {
        CountUpdate::CloseCount {
            subscription_id,
            relay,
        }
    }

    fn closed(subscription_id: SubscriptionId, relay: RelayUrl, message: String) -> Self {
        CountUpdate::Closed {
            subscription_id,
            relay,
            message,
        }
    }

    fn cannot_connect(subscription_id: SubscriptionId, relay: RelayUrl, message: String) -> Self {
        CountUpdate::CannotConnect {
            subscription_id,
            relay,
            message,
        }
    }
}

impl SubscriptionPool<CountPhase> {
    /// A relay answered a COUNT. Replies that match no outstanding query
    /// are dropped.
    pub fn on_count<D>(
        &self,
        relay: &RelayUrl,
        subscription_id: &SubscriptionId,
        count: u64,
        dispatch: &mut D,
    ) where
        D: FnMut(&RelayUrl, Command) -> bool,
    {
        let matched = self.with_entry(subscription_id, |state, listener| {
            if !state.on_count(relay, count) {
                return false;
            }
            if let Some(listener) = listener {
                let _ = listener.send(CountUpdate::Count {
                    subscription_id: subscription_id.clone(),
                    relay: relay.clone(),
                    count,
                });
            }
            true
        });

        if matched == Some(true) {
            self.reconcile(subscription_id, relay, dispatch);
        } else {
            tracing::trace!(subscription = %subscription_id, %relay, count, "unexpected COUNT reply");
        }
    }

    /// Route an inbound relay message. Messages for other pools are ignored.
    pub fn on_incoming_message<D>(&self, relay: &RelayUrl, message: &RelayMessage, dispatch: &mut D)
    where
        D: FnMut(&RelayUrl, Command) -> bool,
    {
        match message {
            RelayMessage::Count {
                subscription_id,
                count,
            } => self.on_count(relay, subscription_id, *count, dispatch),
            RelayMessage::Closed {
                subscription_id,
                message,
            } if self.contains(subscription_id) => {
                self.on_closed(relay, subscription_id, message, dispatch)
            }
            _ => {}
        }
    }
}
