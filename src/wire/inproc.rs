//! Process-wide registries backing the `inproc://` transport flavour.
//!
//! An in-process endpoint is a name in one of two registries: request/reply
//! endpoints hand out a queue the binder drains, publish endpoints hand out
//! a hub that fans (topic, payload) pairs to attached subscribers. Binding a
//! name twice fails, and the binding guard removes the name again on drop,
//! so a restarted server can reuse its addresses.

use crate::error::{Error, Result};
use bytes::Bytes;
use lazy_static::lazy_static;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// One request as it travels from an endpoint to its owner: the raw frames
/// plus the slot the single reply frame must land in.
pub(crate) struct IncomingRequest {
    pub frames: Vec<Bytes>,
    pub reply: oneshot::Sender<Bytes>,
}

lazy_static! {
    static ref REP_HUBS: Mutex<HashMap<String, mpsc::Sender<IncomingRequest>>> =
        Mutex::new(HashMap::new());
    static ref PUB_HUBS: Mutex<HashMap<String, Arc<PubHub>>> = Mutex::new(HashMap::new());
}

/// Claims a request/reply name. The returned guard unbinds on drop.
pub(crate) fn bind_rep(url: &str, tx: mpsc::Sender<IncomingRequest>) -> Result<RepBinding> {
    let mut hubs = REP_HUBS.lock().expect("inproc registry poisoned");
    if hubs.contains_key(url) {
        return Err(Error::Creation(format!("'{url}' is already bound")));
    }
    hubs.insert(url.to_string(), tx);
    Ok(RepBinding {
        url: url.to_string(),
    })
}

pub(crate) fn lookup_rep(url: &str) -> Option<mpsc::Sender<IncomingRequest>> {
    REP_HUBS
        .lock()
        .expect("inproc registry poisoned")
        .get(url)
        .cloned()
}

pub(crate) struct RepBinding {
    url: String,
}

impl Drop for RepBinding {
    fn drop(&mut self) {
        REP_HUBS
            .lock()
            .expect("inproc registry poisoned")
            .remove(&self.url);
    }
}

/// Claims a publish name and creates its hub. The guard unbinds on drop.
pub(crate) fn bind_pub(url: &str) -> Result<PubBinding> {
    let mut hubs = PUB_HUBS.lock().expect("inproc registry poisoned");
    if hubs.contains_key(url) {
        return Err(Error::Creation(format!("'{url}' is already bound")));
    }
    let hub = Arc::new(PubHub::default());
    hubs.insert(url.to_string(), hub.clone());
    Ok(PubBinding {
        url: url.to_string(),
        hub,
    })
}

pub(crate) fn lookup_pub(url: &str) -> Option<Arc<PubHub>> {
    PUB_HUBS
        .lock()
        .expect("inproc registry poisoned")
        .get(url)
        .cloned()
}

pub(crate) struct PubBinding {
    url: String,
    pub hub: Arc<PubHub>,
}

impl Drop for PubBinding {
    fn drop(&mut self) {
        PUB_HUBS
            .lock()
            .expect("inproc registry poisoned")
            .remove(&self.url);
    }
}

struct HubSubscriber {
    filters: HashSet<String>,
    tx: mpsc::Sender<(String, Bytes)>,
}

/// The fanout point of one in-process publish endpoint. Delivery is a
/// non-blocking enqueue into each matching subscriber's queue; a subscriber
/// that cannot keep up loses messages rather than stalling the publisher.
#[derive(Default)]
pub(crate) struct PubHub {
    subscribers: Mutex<HashMap<u64, HubSubscriber>>,
    next_id: AtomicU64,
}

impl PubHub {
    pub fn attach(&self, tx: mpsc::Sender<(String, Bytes)>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .expect("hub poisoned")
            .insert(
                id,
                HubSubscriber {
                    filters: HashSet::new(),
                    tx,
                },
            );
        id
    }

    pub fn detach(&self, id: u64) {
        self.subscribers.lock().expect("hub poisoned").remove(&id);
    }

    pub fn set_filter(&self, id: u64, topic: &str, on: bool) {
        let mut subs = self.subscribers.lock().expect("hub poisoned");
        if let Some(sub) = subs.get_mut(&id) {
            if on {
                sub.filters.insert(topic.to_string());
            } else {
                sub.filters.remove(topic);
            }
        }
    }

    pub fn publish(&self, topic: &str, payload: &Bytes) {
        let subs = self.subscribers.lock().expect("hub poisoned");
        for sub in subs.values() {
            if sub.filters.iter().any(|f| topic.starts_with(f.as_str())) {
                // A full queue drops the sample for that subscriber only.
                let _ = sub.tx.try_send((topic.to_string(), payload.clone()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{bind_pub, bind_rep, lookup_pub, lookup_rep};
    use bytes::Bytes;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn rep_names_are_exclusive_until_dropped() {
        let (tx, _rx) = mpsc::channel(1);
        let binding = bind_rep("inproc://rep.exclusive", tx.clone()).unwrap();
        assert!(bind_rep("inproc://rep.exclusive", tx.clone()).is_err());
        assert!(lookup_rep("inproc://rep.exclusive").is_some());

        drop(binding);
        assert!(lookup_rep("inproc://rep.exclusive").is_none());
        assert!(bind_rep("inproc://rep.exclusive", tx).is_ok());
    }

    #[tokio::test]
    async fn hub_delivers_by_byte_prefix() {
        let binding = bind_pub("inproc://pub.prefix").unwrap();
        let hub = lookup_pub("inproc://pub.prefix").unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let id = hub.attach(tx);
        hub.set_filter(id, "a", true);

        hub.publish("a.b", &Bytes::from_static(b"one"));
        hub.publish("zzz", &Bytes::from_static(b"two"));

        let (topic, payload) = rx.recv().await.unwrap();
        assert_eq!(topic, "a.b");
        assert_eq!(payload, Bytes::from_static(b"one"));
        assert!(rx.try_recv().is_err());

        hub.detach(id);
        hub.publish("a.b", &Bytes::from_static(b"three"));
        assert!(rx.try_recv().is_err());
        drop(binding);
    }
}
