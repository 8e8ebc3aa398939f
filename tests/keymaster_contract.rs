//! End-to-end behavior of the keymaster: discovery, prefix fanout, the
//! heartbeat, late joiners, deferred puts and RPC-over-keys.

mod support;

use lattice::{endpoint, Keymaster};
use serde_yaml::Value;
use std::sync::Arc;
use std::time::Duration;
use support::{
    client, expect_silence, init_logging, next_event, seed_doc, start_inproc_keymaster, Recorder,
};

const EVENT_WAIT: Duration = Duration::from_secs(5);

#[tokio::test(flavor = "multi_thread")]
async fn bind_and_discover_rewrites_and_advertises_endpoints() {
    init_logging();
    let mut server = lattice::KeymasterServer::new(seed_doc(
        &["tcp://*:42000", "inproc://km.discover"],
        "",
    ))
    .unwrap();
    server.run().await.unwrap();

    let km = client("inproc://km.discover");
    let host = endpoint::canonical_hostname();

    let state: Vec<String> = km.get_as("Keymaster.URLS.AsConfigured.State").await.unwrap();
    assert_eq!(
        state,
        vec![format!("tcp://{host}:42000"), "inproc://km.discover".to_string()]
    );

    let publish: Vec<String> = km.get_as("Keymaster.URLS.AsConfigured.Pub").await.unwrap();
    assert_eq!(
        publish,
        vec![
            format!("tcp://{host}:42001"),
            "inproc://km.discover.publisher".to_string()
        ]
    );

    drop(km);
    server.terminate().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn put_under_a_prefix_fans_out_to_ancestor_subscribers() {
    init_logging();
    let (mut server, url) = start_inproc_keymaster("km.fanout", "").await;
    let km = client(&url);

    let (recorder, mut events) = Recorder::new();
    km.subscribe("a", recorder).await.unwrap();

    km.put("a.b.c", "hello", true).await.unwrap();

    let (first_topic, first_node) = next_event(&mut events, EVENT_WAIT).await.unwrap();
    assert_eq!(first_topic, "a");
    let via_tree = lattice::tree::get_node(&first_node, "b.c").unwrap();
    assert_eq!(via_tree, Value::String("hello".into()));

    let (second_topic, _) = next_event(&mut events, EVENT_WAIT).await.unwrap();
    assert_eq!(second_topic, "a.b");

    let (third_topic, third_node) = next_event(&mut events, EVENT_WAIT).await.unwrap();
    assert_eq!(third_topic, "a.b.c");
    assert_eq!(third_node, Value::String("hello".into()));

    drop(km);
    server.terminate().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn heartbeat_is_strictly_monotonic_and_timely() {
    init_logging();
    let (mut server, url) = start_inproc_keymaster("km.heartbeat", "").await;
    let km = client(&url);

    let (recorder, mut events) = Recorder::new();
    km.subscribe("Keymaster.heartbeat", recorder).await.unwrap();

    let mut stamps: Vec<u64> = Vec::new();
    while stamps.len() < 3 {
        let (topic, node) = next_event(&mut events, EVENT_WAIT)
            .await
            .expect("a heartbeat should arrive every second");
        if topic == "Keymaster.heartbeat" {
            stamps.push(serde_yaml::from_value(node).expect("heartbeat payload is a number"));
        }
    }

    for pair in stamps.windows(2) {
        assert!(pair[1] > pair[0], "heartbeat must increase: {stamps:?}");
        assert!(
            pair[1] - pair[0] <= 1_500_000_000,
            "heartbeat gaps must stay under 1.5s: {stamps:?}"
        );
    }

    drop(km);
    server.terminate().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn late_joiners_reconcile_with_a_get_not_a_replay() {
    init_logging();
    let (mut server, url) = start_inproc_keymaster("km.latejoin", "").await;
    let km = client(&url);

    // Let the publisher's post-bind grace pass so this put is really gone
    // before anyone subscribes.
    tokio::time::sleep(Duration::from_millis(2500)).await;
    km.put("x", 1u32, true).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let (recorder, mut events) = Recorder::new();
    km.subscribe("x", recorder).await.unwrap();
    expect_silence(&mut events, Duration::from_millis(500)).await;

    let current: u32 = km.get_as("x").await.unwrap();
    assert_eq!(current, 1);

    km.put("x", 2u32, false).await.unwrap();
    let (topic, node) = next_event(&mut events, EVENT_WAIT).await.unwrap();
    assert_eq!(topic, "x");
    assert_eq!(serde_yaml::from_value::<u32>(node).unwrap(), 2);

    drop(km);
    server.terminate().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn unsubscribing_before_any_publication_deregisters_cleanly() {
    init_logging();
    let (mut server, url) = start_inproc_keymaster("km.unsub", "").await;
    let km = client(&url);

    let (recorder, mut events) = Recorder::new();
    km.subscribe("z", recorder).await.unwrap();
    km.unsubscribe("z").await.unwrap();

    km.put("z", "never seen", true).await.unwrap();
    expect_silence(&mut events, Duration::from_millis(2500)).await;

    drop(km);
    server.terminate().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn subscribing_to_the_empty_key_aliases_root() {
    init_logging();
    let (mut server, url) = start_inproc_keymaster("km.rootsub", "").await;
    let km = client(&url);

    let (recorder, mut events) = Recorder::new();
    km.subscribe("", recorder).await.unwrap();

    // Startup publishes the whole tree under the literal Root topic once
    // the publisher's reconnect grace has passed.
    let (topic, node) = next_event(&mut events, EVENT_WAIT).await.unwrap();
    assert_eq!(topic, "Root");
    assert!(lattice::tree::get_node(&node, "Keymaster.URLS.Initial").is_ok());

    // Ordinary puts fan out under their prefixes only, never under Root.
    km.put("quiet.corner", 1u8, true).await.unwrap();
    expect_silence(&mut events, Duration::from_millis(800)).await;

    drop(km);
    server.terminate().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn the_request_surface_honours_its_contract() {
    init_logging();
    let (mut server, url) = start_inproc_keymaster("km.contract", "count: 3\n").await;
    let km = client(&url);

    assert!(!km.ping().await.unwrap().is_empty());

    // The whole document is addressable as the empty keychain and as Root.
    let whole = km.get("").await.unwrap();
    assert!(lattice::tree::get_node(&whole, "Keymaster.URLS.Initial").is_ok());
    assert_eq!(km.get("Root").await.unwrap(), whole);

    // put/get round trip, and put is idempotent.
    km.put("observatory.az", 42.5f64, true).await.unwrap();
    assert_eq!(km.get_as::<f64>("observatory.az").await.unwrap(), 42.5);
    km.put("observatory.az", 42.5f64, true).await.unwrap();
    assert_eq!(km.get_as::<f64>("observatory.az").await.unwrap(), 42.5);

    // Lookup failures come back in the envelope, not as dead sockets.
    assert!(km.get("no.such.key").await.is_err());
    assert!(!km.last_result().result);

    // A PUT below a missing path without create must not mutate anything.
    assert!(km.put("ghost.branch.leaf", 1u8, false).await.is_err());
    assert!(km.get("ghost").await.is_err());

    // Type mismatches surface on decode.
    assert!(km.get_as::<u64>("observatory").await.is_err());

    // delete, then the lookup fails; deleting again fails too.
    km.del("count").await.unwrap();
    assert!(km.get("count").await.is_err());
    assert!(km.del("count").await.is_err());

    drop(km);
    server.terminate().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn deferred_puts_deduplicate_consecutive_identical_values() {
    init_logging();
    let (mut server, url) = start_inproc_keymaster("km.deferred", "").await;
    let km = client(&url);

    let (recorder, mut events) = Recorder::new();
    km.subscribe("status.packets", recorder).await.unwrap();

    km.put_nb("status.packets", "7", true);
    km.put_nb("status.packets", "7", true);
    km.put_nb("status.packets", "8", true);

    let (_, first) = next_event(&mut events, EVENT_WAIT).await.unwrap();
    assert_eq!(serde_yaml::from_value::<u32>(first).unwrap(), 7);
    let (_, second) = next_event(&mut events, EVENT_WAIT).await.unwrap();
    assert_eq!(serde_yaml::from_value::<u32>(second).unwrap(), 8);
    // The duplicate write must have been swallowed by the worker.
    expect_silence(&mut events, Duration::from_millis(1000)).await;

    drop(km);
    server.terminate().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn rpc_over_keys_round_trips_through_a_service() {
    init_logging();
    let (mut server, url) = start_inproc_keymaster("km.rpc", "").await;

    // A service that answers <key>.request with value + 1 on <key>.reply.
    struct Increment {
        km: Arc<Keymaster>,
    }
    impl lattice::KeyCallback for Increment {
        fn on_update(&self, _key: &str, node: &Value) {
            if let Ok(n) = serde_yaml::from_value::<i64>(node.clone()) {
                self.km.put_nb("calibrate.reply", (n + 1).to_string(), true);
            }
        }
    }

    let service_km = Arc::new(client(&url));
    service_km
        .subscribe(
            "calibrate.request",
            Arc::new(Increment {
                km: service_km.clone(),
            }),
        )
        .await
        .unwrap();

    let km = client(&url);
    let reply = km
        .rpc("calibrate", Value::from(41i64), Duration::from_secs(5))
        .await
        .unwrap();
    assert!(reply.result, "rpc failed: {}", reply.err);
    assert_eq!(
        serde_yaml::from_value::<i64>(reply.node.unwrap()).unwrap(),
        42
    );

    // Nothing answers under this key, so the call must time out cleanly.
    let silence = km
        .rpc("nobody.home", Value::from(0i64), Duration::from_millis(300))
        .await
        .unwrap();
    assert!(!silence.result);

    drop(km);
    drop(service_km);
    server.terminate().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn the_state_surface_works_over_unix_sockets() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("km.sock");
    let url = format!("ipc://{}", path.display());

    let mut server = lattice::KeymasterServer::new(seed_doc(&[url.as_str()], "")).unwrap();
    server.run().await.unwrap();

    let km = client(&url);
    km.put("over.ipc", "works", true).await.unwrap();
    assert_eq!(km.get_as::<String>("over.ipc").await.unwrap(), "works");

    let (recorder, mut events) = Recorder::new();
    km.subscribe("over", recorder).await.unwrap();
    km.put("over.ipc", "again", false).await.unwrap();
    let (topic, _) = next_event(&mut events, EVENT_WAIT).await.unwrap();
    assert_eq!(topic, "over");

    drop(km);
    server.terminate().await;
}
