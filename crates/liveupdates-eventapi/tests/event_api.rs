use std::sync::{Arc, Mutex};
use std::time::Duration;

use liveupdates_eventapi::transport::close_code;
use liveupdates_eventapi::{
    BackoffConfig, EmoteAddDispatch, EventApi, EventApiConfig, MemoryConnector, MemoryTransport,
    Subscription, SubscriptionType, UserConnectionUpdateDispatch,
};
use serde_json::json;

const EMOTE_SET_A: &str = "EMOTE_SET_A";
const EMOTE_ID: &str = "621d13967cc2d4e1953838ed";

fn config() -> EventApiConfig {
    EventApiConfig {
        host: "mem://events".into(),
        ..Default::default()
    }
}

fn emote_set(id: &str) -> Subscription {
    Subscription::object(SubscriptionType::UpdateEmoteSet, id)
}

fn emote_added_frame(op: i64) -> String {
    json!({
        "op": op,
        "d": {
            "type": "emote_set.update",
            "body": {
                "id": EMOTE_SET_A,
                "actor": { "display_name": "nerixyz" },
                "pushed": [{
                    "key": "emotes",
                    "index": 0,
                    "value": {
                        "id": EMOTE_ID,
                        "name": "Chatterino",
                        "data": {
                            "name": "Chatterino",
                            "host": { "url": "//cdn.7tv.app/emote/621d13967cc2d4e1953838ed" },
                            "owner": { "id": "60ae2e3db2ecb01505c6f69d" },
                        },
                    },
                }],
            },
        },
    })
    .to_string()
}

fn collect_added(api: &EventApi) -> Arc<Mutex<Vec<EmoteAddDispatch>>> {
    let added = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&added);
    api.signals()
        .emote_added
        .connect(move |e: &EmoteAddDispatch| sink.lock().unwrap().push(e.clone()));
    added
}

fn first_transport(connector: &MemoryConnector) -> Arc<MemoryTransport> {
    connector.transport(0).expect("a connection was dialed")
}

#[test]
fn test_emote_added_end_to_end() {
    let connector = Arc::new(MemoryConnector::auto_open());
    let api = EventApi::new(config(), connector.clone());
    let added = collect_added(&api);

    api.subscribe_user("USER_A", EMOTE_SET_A);
    api.process_pending();
    first_transport(&connector).inject(emote_added_frame(0));
    api.process_pending();

    let added = added.lock().unwrap();
    assert_eq!(added.len(), 1);
    assert_eq!(added[0].emote_set_id, EMOTE_SET_A);
    assert_eq!(added[0].actor_name, "nerixyz");
    assert_eq!(added[0].emote_id, EMOTE_ID);
    assert_eq!(added[0].emote_json["name"], "Chatterino");
    assert_eq!(api.diagnostics().dispatches_delivered, 1);
}

#[test]
fn test_unknown_opcode_is_ignored() {
    let connector = Arc::new(MemoryConnector::auto_open());
    let api = EventApi::new(config(), connector.clone());
    let added = collect_added(&api);

    api.subscribe(emote_set(EMOTE_SET_A));
    api.process_pending();
    let transport = first_transport(&connector);
    transport.inject(emote_added_frame(999));
    transport.inject("not json at all");
    transport.inject("[1, 2, 3]");
    api.process_pending();

    assert!(added.lock().unwrap().is_empty());
    assert_eq!(api.connection_count(), 1);
    assert_eq!(api.diagnostics().dispatches_delivered, 0);
}

#[test]
fn test_invalid_dispatch_is_dropped() {
    let connector = Arc::new(MemoryConnector::auto_open());
    let api = EventApi::new(config(), connector.clone());
    let added = collect_added(&api);
    api.subscribe(emote_set(EMOTE_SET_A));
    api.process_pending();

    let frame = json!({
        "op": 0,
        "d": {
            "type": "emote_set.update",
            "body": {
                "id": EMOTE_SET_A,
                "pushed": [{ "key": "emotes", "value": { "id": EMOTE_ID, "name": "NoData" } }],
            },
        },
    });
    first_transport(&connector).inject(frame.to_string());
    api.process_pending();

    assert!(added.lock().unwrap().is_empty());
    assert_eq!(api.diagnostics().dispatches_dropped, 1);
}

#[test]
fn test_user_update_dispatch() {
    let connector = Arc::new(MemoryConnector::auto_open());
    let api = EventApi::new(config(), connector.clone());
    let updates = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&updates);
    api.signals()
        .user_updated
        .connect(move |e: &UserConnectionUpdateDispatch| sink.lock().unwrap().push(e.clone()));

    api.subscribe_user("USER_A", "");
    api.process_pending();
    let frame = json!({
        "op": 0,
        "d": {
            "type": "user.update",
            "body": {
                "id": "USER_A",
                "actor": { "display_name": "pajlada" },
                "updated": [{
                    "key": "connections",
                    "index": 1,
                    "value": [{
                        "key": "emote_set",
                        "old_value": { "id": "OLD_SET" },
                        "value": { "id": "NEW_SET" },
                    }],
                }],
            },
        },
    });
    first_transport(&connector).inject(frame.to_string());
    api.process_pending();

    let updates = updates.lock().unwrap();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].user_id, "USER_A");
    assert_eq!(updates[0].old_emote_set_id, "OLD_SET");
    assert_eq!(updates[0].emote_set_id, "NEW_SET");
    assert_eq!(updates[0].connection_index, 1);
}

#[test]
fn test_overflow_opens_second_connection() {
    let connector = Arc::new(MemoryConnector::auto_open());
    let api = EventApi::new(config(), connector.clone());

    for i in 0..101 {
        api.subscribe(emote_set(&format!("set-{i}")));
    }
    api.process_pending();

    let diag = api.diagnostics();
    assert_eq!(diag.connections_opened, 2);
    assert_eq!(api.connection_count(), 2);
    assert_eq!(api.backlog_len(), 0);
    assert_eq!(api.subscription_count(), 101);

    let sizes: Vec<usize> = api.connections().iter().map(|c| c.len()).collect();
    assert_eq!(sizes, vec![100, 1]);
}

#[test]
fn test_resubscribe_keeps_single_owner() {
    let connector = Arc::new(MemoryConnector::auto_open());
    let api = EventApi::new(config(), connector.clone());
    for i in 0..101 {
        api.subscribe(emote_set(&format!("set-{i}")));
    }
    api.process_pending();
    let first = first_transport(&connector);
    let second = connector.transport(1).unwrap();

    // Frees a slot on the first connection while set-100 sits on the second.
    api.unsubscribe(&emote_set("set-0"));
    api.subscribe(emote_set("set-100"));

    let owners = api
        .connections()
        .iter()
        .filter(|c| c.is_joined(&emote_set("set-100")))
        .count();
    assert_eq!(owners, 1);
    assert_eq!(api.subscription_count(), 100);
    assert!(!first.sent().contains(&emote_set("set-100").encode_subscribe()));
    assert_eq!(second.sent(), vec![emote_set("set-100").encode_subscribe()]);

    // A new topic takes the free slot on the first connection.
    api.subscribe(emote_set("set-101"));
    assert!(api.connections()[0].is_joined(&emote_set("set-101")));
    assert_eq!(connector.dial_count(), 2);

    // Unsubscribing parts the only owner, which empties and evicts it.
    api.unsubscribe(&emote_set("set-100"));
    api.process_pending();
    assert!(!api.is_subscribed(&emote_set("set-100")));
    assert_eq!(
        second.sent().last(),
        Some(&emote_set("set-100").encode_unsubscribe())
    );
    assert!(second.is_closed());
    assert_eq!(api.connection_count(), 1);
    assert_eq!(api.subscription_count(), 100);
}

#[test]
fn test_listener_can_subscribe_from_callback() {
    let connector = Arc::new(MemoryConnector::auto_open());
    let api = EventApi::new(config(), connector.clone());
    api.subscribe(emote_set(EMOTE_SET_A));
    api.process_pending();

    let owner = Subscription::object(SubscriptionType::UpdateUser, "60ae2e3db2ecb01505c6f69d");
    let weak = Arc::downgrade(&api);
    let followed = owner.clone();
    api.signals().emote_added.connect(move |_: &EmoteAddDispatch| {
        if let Some(api) = weak.upgrade() {
            api.subscribe(followed.clone());
            api.unsubscribe(&emote_set(EMOTE_SET_A));
        }
    });

    let transport = first_transport(&connector);
    transport.inject(emote_added_frame(0));
    api.process_pending();

    assert!(api.is_subscribed(&owner));
    assert!(!api.is_subscribed(&emote_set(EMOTE_SET_A)));
    let sent = transport.sent();
    assert!(sent.contains(&owner.encode_subscribe()));
    assert_eq!(sent.last(), Some(&emote_set(EMOTE_SET_A).encode_unsubscribe()));
    assert_eq!(connector.dial_count(), 1);
}

#[test]
fn test_reconnect_opcode_migrates_subscriptions() {
    let connector = Arc::new(MemoryConnector::auto_open());
    let api = EventApi::new(config(), connector.clone());
    api.subscribe(emote_set("a"));
    api.subscribe(emote_set("b"));
    api.process_pending();

    let first = first_transport(&connector);
    first.inject(r#"{"op":4,"d":{}}"#);
    api.process_pending();

    assert!(first.is_closed());
    assert_eq!(first.close_frame().map(|(code, _)| code), Some(close_code::GOING_AWAY));

    let second = connector.transport(1).unwrap();
    let mut resent = second.sent();
    resent.sort();
    let mut expected = vec![emote_set("a").encode_subscribe(), emote_set("b").encode_subscribe()];
    expected.sort();
    assert_eq!(resent, expected);

    let diag = api.diagnostics();
    assert_eq!(diag.connections_opened, 2);
    assert_eq!(diag.connections_closed, 1);
    assert_eq!(diag.connections_failed, 0);
    assert_eq!(api.connection_count(), 1);
}

#[test]
fn test_transport_error_counts_failure_and_migrates() {
    let connector = Arc::new(MemoryConnector::auto_open());
    let api = EventApi::new(config(), connector.clone());
    api.subscribe(emote_set("a"));
    api.process_pending();

    first_transport(&connector).fail("connection reset by peer");
    api.process_pending();

    let diag = api.diagnostics();
    assert_eq!(diag.connections_failed, 1);
    assert_eq!(diag.connections_closed, 0);
    assert_eq!(diag.connections_opened, 2);
    assert!(api.is_subscribed(&emote_set("a")));
    assert_eq!(
        connector.transport(1).unwrap().sent(),
        vec![emote_set("a").encode_subscribe()]
    );
}

#[test]
fn test_server_close_counts_once() {
    let connector = Arc::new(MemoryConnector::auto_open());
    let api = EventApi::new(config(), connector.clone());
    api.subscribe(emote_set("a"));
    api.process_pending();

    first_transport(&connector).remote_close(close_code::GOING_AWAY, "maintenance");
    api.process_pending();

    let diag = api.diagnostics();
    assert_eq!(diag.connections_closed, 1);
    assert_eq!(diag.connections_failed, 0);
    assert_eq!(connector.dial_count(), 2);
}

#[test]
fn test_unsubscribe_evicts_empty_connection() {
    let connector = Arc::new(MemoryConnector::auto_open());
    let api = EventApi::new(config(), connector.clone());
    api.subscribe(emote_set("a"));
    api.subscribe(emote_set("b"));
    api.process_pending();
    let transport = first_transport(&connector);

    api.unsubscribe(&emote_set("a"));
    assert_eq!(api.connection_count(), 1);
    assert!(!transport.is_closed());

    api.unsubscribe(&emote_set("b"));
    api.process_pending();
    assert_eq!(api.connection_count(), 0);
    assert_eq!(
        transport.close_frame(),
        Some((close_code::NORMAL, "No subscriptions left".to_string()))
    );
    assert_eq!(api.diagnostics().connections_closed, 1);
    // The eviction does not trigger a redial.
    assert_eq!(connector.dial_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_timeout_reconnects() {
    let connector = Arc::new(MemoryConnector::auto_open());
    let api = EventApi::new(
        EventApiConfig {
            heartbeat_timeout: Duration::from_millis(1000),
            ..config()
        },
        connector.clone(),
    );
    let _event_loop = api.start().unwrap();
    api.subscribe(emote_set("a"));

    tokio::time::sleep(Duration::from_millis(1300)).await;

    let diag = api.diagnostics();
    assert_eq!(diag.connections_failed, 1);
    assert_eq!(diag.connections_closed, 0);
    assert_eq!(diag.connections_opened, 2);
    assert_eq!(
        first_transport(&connector).close_frame().map(|(code, _)| code),
        Some(close_code::HEARTBEAT_TIMEOUT)
    );
    assert!(api.is_subscribed(&emote_set("a")));
    api.stop();
}

#[tokio::test(start_paused = true)]
async fn test_hello_extends_heartbeat_timeout() {
    let connector = Arc::new(MemoryConnector::auto_open());
    let api = EventApi::new(
        EventApiConfig {
            heartbeat_timeout: Duration::from_millis(1000),
            ..config()
        },
        connector.clone(),
    );
    let _event_loop = api.start().unwrap();
    api.subscribe(emote_set("a"));
    tokio::time::sleep(Duration::from_millis(10)).await;

    first_transport(&connector)
        .inject(r#"{"op":1,"d":{"heartbeat_interval":1000,"session_id":"abc"}}"#);
    tokio::time::sleep(Duration::from_millis(2500)).await;

    assert_eq!(api.diagnostics().connections_failed, 0);
    assert_eq!(
        api.connections()[0].heartbeat_timeout(),
        Duration::from_millis(3000)
    );
    api.stop();
}

#[tokio::test(start_paused = true)]
async fn test_connect_failure_retries_with_backoff() {
    let connector = Arc::new(MemoryConnector::auto_open());
    connector.refuse_next(1);
    let api = EventApi::new(
        EventApiConfig {
            backoff: BackoffConfig {
                jitter: 0.0,
                ..Default::default()
            },
            ..config()
        },
        connector.clone(),
    );
    let _event_loop = api.start().unwrap();
    api.subscribe(emote_set("a"));

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(api.diagnostics().connections_failed, 1);
    assert_eq!(connector.dial_count(), 1);
    assert_eq!(api.backlog_len(), 1);

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(connector.dial_count(), 2);
    assert_eq!(api.diagnostics().connections_opened, 1);
    assert_eq!(api.backlog_len(), 0);
    assert_eq!(
        connector.transport(1).unwrap().sent(),
        vec![emote_set("a").encode_subscribe()]
    );
    api.stop();
}

#[tokio::test(start_paused = true)]
async fn test_rejected_dial_retries() {
    let connector = Arc::new(MemoryConnector::auto_open());
    connector.reject_next(2);
    let api = EventApi::new(
        EventApiConfig {
            backoff: BackoffConfig {
                jitter: 0.0,
                ..Default::default()
            },
            ..config()
        },
        connector.clone(),
    );
    let _event_loop = api.start().unwrap();
    api.subscribe(emote_set("a"));

    // 1 s, then 2 s.
    tokio::time::sleep(Duration::from_millis(3100)).await;
    let diag = api.diagnostics();
    assert_eq!(diag.connections_failed, 2);
    assert_eq!(diag.connections_opened, 1);
    assert_eq!(connector.dial_count(), 1);
    api.stop();
}

#[tokio::test]
async fn test_stop_ends_event_loop() {
    let connector = Arc::new(MemoryConnector::auto_open());
    let api = EventApi::new(config(), connector.clone());
    let event_loop = api.start().unwrap();
    assert!(api.start().is_none(), "event loop already running");

    api.subscribe(emote_set("a"));
    api.stop();
    event_loop.await.unwrap();

    assert_eq!(api.connection_count(), 0);
    assert_eq!(api.process_pending(), 0);
}
