//! Shared scaffolding for the end-to-end tests.

#![allow(dead_code)]

use lattice::{KeyCallback, Keymaster, KeymasterServer};
use serde_yaml::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

static NEXT_ID: AtomicUsize = AtomicUsize::new(0);

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A process-unique in-process endpoint name.
pub fn unique_inproc(stem: &str) -> String {
    format!("inproc://{stem}.{}", NEXT_ID.fetch_add(1, Ordering::Relaxed))
}

/// A seed document with the given initial endpoints and an optional extra
/// stanza merged at the root.
pub fn seed_doc(initial: &[&str], extra: &str) -> Value {
    let urls: Vec<String> = initial.iter().map(|s| s.to_string()).collect();
    let mut text = String::from("Keymaster:\n  URLS:\n    Initial:\n");
    for url in &urls {
        text.push_str(&format!("      - \"{url}\"\n"));
    }
    text.push_str("  clone_interval: 1000\n");
    text.push_str(extra);
    lattice::load_config_str(&text).expect("seed document must parse")
}

/// Starts a keymaster on one in-process endpoint and returns the server
/// plus the state URL clients should use.
pub async fn start_inproc_keymaster(stem: &str, extra: &str) -> (KeymasterServer, String) {
    let url = unique_inproc(stem);
    let mut server =
        KeymasterServer::new(seed_doc(&[url.as_str()], extra)).expect("seed must validate");
    server.run().await.expect("server must start");
    (server, url)
}

/// Records every key event it sees and forwards it for awaiting.
pub struct Recorder {
    tx: mpsc::UnboundedSender<(String, Value)>,
}

impl Recorder {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<(String, Value)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Recorder { tx }), rx)
    }
}

impl KeyCallback for Recorder {
    fn on_update(&self, key: &str, node: &Value) {
        let _ = self.tx.send((key.to_string(), node.clone()));
    }
}

/// Waits up to `wait` for the next recorded event.
pub async fn next_event(
    rx: &mut mpsc::UnboundedReceiver<(String, Value)>,
    wait: Duration,
) -> Option<(String, Value)> {
    tokio::time::timeout(wait, rx.recv()).await.ok().flatten()
}

/// Asserts that nothing arrives within `quiet`.
pub async fn expect_silence(rx: &mut mpsc::UnboundedReceiver<(String, Value)>, quiet: Duration) {
    if let Ok(Some((topic, _))) = tokio::time::timeout(quiet, rx.recv()).await {
        panic!("expected silence, but received an event under '{topic}'");
    }
}

/// A client wired to the given state URL.
pub fn client(url: &str) -> Keymaster {
    Keymaster::new(url).expect("client must construct")
}
