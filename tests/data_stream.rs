//! End-to-end behavior of the data plane: sources and sinks over the
//! socket and real-time transport families, shared clients, sink policies
//! and generic buffers.

mod support;

use lattice::{
    read_value, write_value, BufferSink, BufferSource, DataDescription, DataSink, DataSource,
    GenericBuffer, SinkPolicy,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use support::{init_logging, start_inproc_keymaster};

const GET_WAIT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
struct Reading {
    seq: u32,
    level: f64,
}

// The transport-server directory is keyed on (component, transport) across
// the whole process, so every test gets its own component name.
fn component_stanza(component: &str, transport_urls: &str) -> String {
    format!(
        "components:\n  {component}:\n    Transports:\n      A:\n        Specified: {transport_urls}\n    Sources:\n      Data: A\n"
    )
}

#[tokio::test(flavor = "multi_thread")]
async fn two_sinks_on_one_url_each_see_every_record_in_order() {
    init_logging();
    let (mut server, url) = start_inproc_keymaster(
        "km.fanin",
        &component_stanza("fanin_task", "[\"inproc://fanin.data.XXXXX\"]"),
    )
    .await;

    let source = DataSource::<Reading>::new(&url, "fanin_task", "Data").await.unwrap();
    let mut sink_a = DataSink::<Reading>::connect_with(&url, "fanin_task", "Data", SinkPolicy::Queue(32))
        .await
        .unwrap();
    let mut sink_b = DataSink::<Reading>::connect_with(&url, "fanin_task", "Data", SinkPolicy::Queue(32))
        .await
        .unwrap();

    // Both sinks resolved the same published URL, so they ride one shared
    // transport client underneath.
    assert_eq!(sink_a.url(), sink_b.url());

    for seq in 0..10u32 {
        source
            .publish(&Reading {
                seq,
                level: f64::from(seq) * 0.5,
            })
            .await
            .unwrap();
    }

    for seq in 0..10u32 {
        let a = sink_a.get(GET_WAIT).await.unwrap();
        let b = sink_b.get(GET_WAIT).await.unwrap();
        assert_eq!(a.seq, seq);
        assert_eq!(b, a);
    }

    sink_a.release().await;
    sink_b.release().await;
    source.release().await;
    server.terminate().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn records_cross_a_real_tcp_stream() {
    init_logging();
    let (mut server, url) = start_inproc_keymaster(
        "km.tcpstream",
        &component_stanza("tcp_task", "[\"tcp://127.0.0.1:XXXXX\"]"),
    )
    .await;

    let source = DataSource::<Reading>::new(&url, "tcp_task", "Data").await.unwrap();
    let mut sink = DataSink::<Reading>::connect(&url, "tcp_task", "Data").await.unwrap();
    assert!(sink.url().starts_with("tcp://127.0.0.1:"));

    // The subscription control frame has to cross the wire before the
    // first publication leaves.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let sent = Reading { seq: 7, level: 2.25 };
    source.publish(&sent).await.unwrap();
    assert_eq!(sink.get(GET_WAIT).await.unwrap(), sent);

    sink.release().await;
    source.release().await;
    server.terminate().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn the_real_time_family_delivers_without_a_scheduler_gap() {
    init_logging();
    let stanza = "components:\n  rttask:\n    Transports:\n      RT:\n        Specified: [\"rtinproc://rt.samples.XXXXX\"]\n    Sources:\n      Fast: RT\n";
    let (mut server, url) = start_inproc_keymaster("km.rt", stanza).await;

    let source = DataSource::<Reading>::new(&url, "rttask", "Fast").await.unwrap();
    let mut sink = DataSink::<Reading>::connect(&url, "rttask", "Fast").await.unwrap();
    assert!(sink.url().starts_with("rtinproc://"));

    for seq in 0..5u32 {
        source.publish(&Reading { seq, level: 1.0 }).await.unwrap();
    }
    for seq in 0..5u32 {
        assert_eq!(sink.get(GET_WAIT).await.unwrap().seq, seq);
    }

    sink.release().await;
    source.release().await;
    server.terminate().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn a_latest_only_sink_drops_everything_but_the_newest() {
    init_logging();
    let (mut server, url) = start_inproc_keymaster(
        "km.latest",
        &component_stanza("latest_task", "[\"inproc://latest.data.XXXXX\"]"),
    )
    .await;

    let source = DataSource::<Reading>::new(&url, "latest_task", "Data").await.unwrap();
    let mut sink =
        DataSink::<Reading>::connect_with(&url, "latest_task", "Data", SinkPolicy::Latest)
            .await
            .unwrap();

    for seq in 0..5u32 {
        source.publish(&Reading { seq, level: 0.0 }).await.unwrap();
    }
    // Let the dispatch worker drain everything into the slot first.
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(sink.get(GET_WAIT).await.unwrap().seq, 4);
    // Nothing new has been published, so the slot stays quiet.
    assert!(matches!(
        sink.get(Duration::from_millis(200)).await,
        Err(lattice::Error::Timeout)
    ));

    sink.release().await;
    source.release().await;
    server.terminate().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn generic_buffers_cross_the_wire_byte_for_byte() {
    init_logging();
    let (mut server, url) = start_inproc_keymaster(
        "km.buffer",
        &component_stanza("buffer_task", "[\"inproc://buffer.data.XXXXX\"]"),
    )
    .await;

    let mut description = DataDescription::new();
    description.add_field(&["flag", "int8", "1"]).unwrap();
    description.add_field(&["stamp", "int64", "1"]).unwrap();
    description.add_field(&["level", "double", "1"]).unwrap();
    let total = description.size();

    let mut outgoing = GenericBuffer::new();
    outgoing.resize(total);
    write_value(&mut outgoing, description.field("flag").unwrap().offset, 1i8).unwrap();
    write_value(
        &mut outgoing,
        description.field("stamp").unwrap().offset,
        987_654_321i64,
    )
    .unwrap();
    write_value(
        &mut outgoing,
        description.field("level").unwrap().offset,
        -12.5f64,
    )
    .unwrap();

    let source = BufferSource::new(&url, "buffer_task", "Data").await.unwrap();
    let mut sink = BufferSink::connect(&url, "buffer_task", "Data").await.unwrap();

    source.publish(&outgoing).await.unwrap();

    let mut incoming = GenericBuffer::new();
    sink.get(&mut incoming, GET_WAIT).await.unwrap();
    assert_eq!(incoming, outgoing);
    assert_eq!(
        read_value::<i64>(&incoming, description.field("stamp").unwrap().offset).unwrap(),
        987_654_321
    );
    assert_eq!(
        read_value::<f64>(&incoming, description.field("level").unwrap().offset).unwrap(),
        -12.5
    );

    sink.release().await;
    source.release().await;
    server.terminate().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn a_source_on_an_unknown_stream_fails_to_build() {
    init_logging();
    let (mut server, url) = start_inproc_keymaster("km.unknown", "components: {}\n").await;

    assert!(DataSource::<Reading>::new(&url, "ghost_task", "Data").await.is_err());
    assert!(DataSink::<Reading>::connect(&url, "ghost_task", "Data").await.is_err());

    server.terminate().await;
}
