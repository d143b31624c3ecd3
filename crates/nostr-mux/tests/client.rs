//! End-to-end client tests over the in-memory relay network.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};

use nostr_mux::{
    ClientConfig, ClientError, Command, ConnectionEventKind, CountStatus, CountUpdate, Filter,
    MemoryNetwork, NostrClient, Notification, OutboxUpdate, RelayMessage, ReqStatus, ReqUpdate,
};
use nostr_mux::pool::BackoffConfig;
use nostr_mux_testkit::fixtures::{drain, on_relays, relay, relays, sub, TestFixture};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Let the client's tasks drain their queues.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

fn setup() -> (Arc<MemoryNetwork>, NostrClient) {
    init_tracing();
    let network = MemoryNetwork::new();
    let client = NostrClient::new(network.factory(), ClientConfig::default());
    (network, client)
}

fn notes() -> Vec<Filter> {
    vec![Filter::new().kinds([1]).limit(50)]
}

fn notifications(rx: &mut broadcast::Receiver<Notification>) -> Vec<Notification> {
    let mut all = Vec::new();
    while let Ok(notification) = rx.try_recv() {
        all.push(notification);
    }
    all
}

fn labels(commands: &[Command]) -> Vec<&'static str> {
    commands.iter().map(Command::label).collect()
}

#[tokio::test(start_paused = true)]
async fn test_req_reaches_relay_and_goes_live() {
    let (network, client) = setup();
    let (a, feed) = (relay("a"), sub("feed"));
    let mut fixture = TestFixture::new();
    let (tx, mut rx) = mpsc::unbounded_channel();

    client.connect();
    client.open_req_subscription(&feed, on_relays(&relays(["a"]), notes()), Some(tx));
    settle().await;

    assert_eq!(
        network.received(&a),
        vec![Command::Req {
            subscription_id: feed.clone(),
            filters: notes(),
        }]
    );
    assert_eq!(client.req_status(&feed, &a), Some(ReqStatus::QueryingPast));

    let stored = fixture.make_note("stored");
    network.deliver(
        &a,
        RelayMessage::Event {
            subscription_id: feed.clone(),
            event: stored.clone(),
        },
    );
    network.deliver(&a, RelayMessage::Eose { subscription_id: feed.clone() });
    let fresh = fixture.make_note("fresh");
    network.deliver(
        &a,
        RelayMessage::Event {
            subscription_id: feed.clone(),
            event: fresh.clone(),
        },
    );
    settle().await;

    assert_eq!(client.req_status(&feed, &a), Some(ReqStatus::Live));
    let updates = drain(&mut rx);
    assert!(matches!(updates[0], ReqUpdate::StartReq { .. }));
    match &updates[1] {
        ReqUpdate::Event { event, live, .. } => {
            assert_eq!(event, &stored);
            assert!(!live);
        }
        other => panic!("expected stored event, got {:?}", other),
    }
    assert!(matches!(updates[2], ReqUpdate::Eose { .. }));
    match &updates[3] {
        ReqUpdate::Event { event, live, .. } => {
            assert_eq!(event, &fresh);
            assert!(*live);
        }
        other => panic!("expected live event, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_filter_change_and_close() {
    let (network, client) = setup();
    let (a, feed) = (relay("a"), sub("feed"));

    client.connect();
    client.open_req_subscription(&feed, on_relays(&relays(["a"]), notes()), None);
    settle().await;
    network.deliver(&a, RelayMessage::Eose { subscription_id: feed.clone() });
    settle().await;

    let wider = vec![Filter::new().kinds([1, 6])];
    client.open_req_subscription(&feed, on_relays(&relays(["a"]), wider.clone()), None);
    settle().await;
    assert_eq!(client.req_status(&feed, &a), Some(ReqStatus::QueryingPast));
    assert_eq!(client.active_requests(&a)[&feed].to_vec(), wider);

    client.close(&feed);
    settle().await;

    assert_eq!(labels(&network.received(&a)), vec!["REQ", "REQ", "CLOSE"]);
    assert!(client.req_filters(&feed).is_none());
    assert!(client.active_requests(&a).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_inactive_client_sends_nothing() {
    let (network, client) = setup();
    let (a, feed) = (relay("a"), sub("feed"));

    client.open_req_subscription(&feed, on_relays(&relays(["a"]), notes()), None);
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert!(!client.is_active());
    assert_eq!(network.attempts(&a), 0);
    assert!(network.received(&a).is_empty());
    assert_eq!(client.req_status(&feed, &a), Some(ReqStatus::Idle));

    client.connect();
    settle().await;

    assert_eq!(labels(&network.received(&a)), vec!["REQ"]);
    assert_eq!(*client.connected_relays().borrow(), relays(["a"]));
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_resends_after_drop() {
    let (network, client) = setup();
    let (a, feed) = (relay("a"), sub("feed"));

    client.connect();
    client.open_req_subscription(&feed, on_relays(&relays(["a"]), notes()), None);
    settle().await;
    network.deliver(&a, RelayMessage::Eose { subscription_id: feed.clone() });
    settle().await;

    network.drop_connection(&a);
    settle().await;
    assert!(client.connected_relays().borrow().is_empty());
    assert!(client.active_requests(&a).is_empty());

    client.reconnect(true, true);
    client.reconnect(true, true);
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(network.attempts(&a), 2);
    assert_eq!(labels(&network.received(&a)), vec!["REQ", "REQ"]);
    assert_eq!(client.req_status(&feed, &a), Some(ReqStatus::QueryingPast));
}

#[tokio::test(start_paused = true)]
async fn test_new_subscription_wakes_relay_in_backoff() {
    init_tracing();
    let network = MemoryNetwork::with_backoff(BackoffConfig {
        reconnect_delay: Duration::from_millis(100),
        ..BackoffConfig::default()
    });
    let client = NostrClient::new(network.factory(), ClientConfig::default());
    let (a, feed, mentions) = (relay("a"), sub("feed"), sub("mentions"));

    network.set_online(&a, false);
    client.connect();
    client.open_req_subscription(&feed, on_relays(&relays(["a"]), notes()), None);
    settle().await;
    assert_eq!(network.attempts(&a), 1);

    // Still inside the retry delay, so the open itself cannot connect.
    network.set_online(&a, true);
    client.open_req_subscription(&mentions, on_relays(&relays(["a"]), notes()), None);
    assert_eq!(network.attempts(&a), 1);

    // Well before the periodic reconnect.
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(network.attempts(&a), 2);
    assert_eq!(labels(&network.received(&a)), vec!["REQ", "REQ"]);
    assert_eq!(client.req_status(&feed, &a), Some(ReqStatus::QueryingPast));
    assert_eq!(client.req_status(&mentions, &a), Some(ReqStatus::QueryingPast));
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_keeps_desired_state() {
    let (network, client) = setup();
    let (a, feed) = (relay("a"), sub("feed"));

    client.connect();
    client.open_req_subscription(&feed, on_relays(&relays(["a"]), notes()), None);
    settle().await;

    client.disconnect();
    settle().await;
    assert!(!network.is_connected(&a));
    assert!(client.req_filters(&feed).is_some());

    client.connect();
    settle().await;
    assert_eq!(labels(&network.received(&a)), vec!["REQ", "REQ"]);
}

#[tokio::test(start_paused = true)]
async fn test_closed_by_relay_reopens() {
    let (network, client) = setup();
    let (a, feed) = (relay("a"), sub("feed"));
    let (tx, mut rx) = mpsc::unbounded_channel();

    client.connect();
    client.open_req_subscription(&feed, on_relays(&relays(["a"]), notes()), Some(tx));
    settle().await;

    network.deliver(
        &a,
        RelayMessage::Closed {
            subscription_id: feed.clone(),
            message: "error: shutting down idle subscription".into(),
        },
    );
    settle().await;

    assert_eq!(labels(&network.received(&a)), vec!["REQ", "REQ"]);
    assert!(drain(&mut rx)
        .iter()
        .any(|update| matches!(update, ReqUpdate::Closed { message, .. } if message.starts_with("error:"))));
}

#[tokio::test(start_paused = true)]
async fn test_publish_completes_on_ok() {
    let (network, client) = setup();
    let a = relay("a");
    let mut notifications_rx = client.subscribe();
    let event = TestFixture::new().make_note("hello relays");

    client.connect();
    client.send(&event, &relays(["a"])).unwrap();
    settle().await;

    assert_eq!(network.received(&a), vec![Command::Event(event.clone())]);
    assert!(client.is_pending(&event.id));
    assert_eq!(client.active_outbox(&a), vec![event.clone()]);

    network.deliver(
        &a,
        RelayMessage::Ok {
            event_id: event.id,
            success: true,
            message: String::new(),
        },
    );
    settle().await;

    assert!(!client.is_pending(&event.id));
    let seen = notifications(&mut notifications_rx);
    assert!(seen.iter().any(|n| matches!(
        n,
        Notification::Outbox(OutboxUpdate::RelayDone { success: true, relay, .. }) if *relay == a
    )));
    assert!(seen
        .iter()
        .any(|n| matches!(n, Notification::Outbox(OutboxUpdate::Completed { event_id }) if *event_id == event.id)));
    assert!(seen.iter().any(|n| matches!(
        n,
        Notification::Connection(e) if matches!(e.kind, ConnectionEventKind::Connected { .. })
    )));
}

#[tokio::test(start_paused = true)]
async fn test_send_needs_relays() {
    let (_network, client) = setup();
    let event = TestFixture::new().make_note("nowhere");
    let result = client.send(&event, &HashSet::new());
    assert!(matches!(result, Err(ClientError::NoRelays)));
    assert!(!client.is_pending(&event.id));
}

#[tokio::test(start_paused = true)]
async fn test_offline_relay_gives_up_after_two_failures() {
    let (network, client) = setup();
    let a = relay("a");
    network.set_online(&a, false);
    let mut notifications_rx = client.subscribe();
    let event = TestFixture::new().make_note("into the void");

    client.connect();
    client.send(&event, &relays(["a"])).unwrap();
    settle().await;
    assert!(client.is_pending(&event.id));
    assert_eq!(network.attempts(&a), 1);

    // The periodic reconnect retries once the backoff has passed.
    tokio::time::sleep(Duration::from_secs(61)).await;

    assert_eq!(network.attempts(&a), 2);
    assert!(!client.is_pending(&event.id));
    let seen = notifications(&mut notifications_rx);
    assert!(seen.iter().any(|n| matches!(
        n,
        Notification::Outbox(OutboxUpdate::RelayDone { success: false, message: Some(message), .. })
            if message == "relay offline"
    )));
}

#[tokio::test(start_paused = true)]
async fn test_sampler_drops_unneeded_relays() {
    let (network, client) = setup();
    let (a, b, feed) = (relay("a"), relay("b"), sub("feed"));

    client.connect();
    client.open_req_subscription(&feed, on_relays(&relays(["a", "b"]), notes()), None);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(*client.available_relays().borrow(), relays(["a", "b"]));

    client.open_req_subscription(&feed, HashMap::from([(a.clone(), notes())]), None);
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(*client.available_relays().borrow(), relays(["a"]));
    assert!(!network.is_connected(&b));
    assert!(network.is_connected(&a));
    assert_eq!(labels(&network.received(&b)), vec!["REQ", "CLOSE"]);
}

#[tokio::test(start_paused = true)]
async fn test_count_query() {
    let (network, client) = setup();
    let (a, followers) = (relay("a"), sub("followers"));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let filters = vec![Filter::new().kinds([3]).tag('p', ["ab".repeat(32)])];

    client.connect();
    client.query_count(&followers, on_relays(&relays(["a"]), filters.clone()), Some(tx));
    settle().await;

    assert_eq!(
        network.received(&a),
        vec![Command::Count {
            subscription_id: followers.clone(),
            filters,
        }]
    );
    network.deliver(
        &a,
        RelayMessage::Count {
            subscription_id: followers.clone(),
            count: 42,
        },
    );
    settle().await;

    assert_eq!(client.count_status(&followers, &a), Some(CountStatus::Counted(42)));
    let updates = drain(&mut rx);
    assert!(matches!(updates[0], CountUpdate::StartCount { .. }));
    assert!(matches!(updates[1], CountUpdate::Count { count: 42, .. }));
}
