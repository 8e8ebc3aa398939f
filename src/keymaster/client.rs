/********************************************************************************
 * Copyright (c) 2025 Contributors to the Eclipse Foundation
 *
 * See the NOTICE file(s) distributed with this work for additional
 * information regarding copyright ownership.
 *
 * This program and the accompanying materials are made available under the
 * terms of the Apache License Version 2.0 which is available at
 * https://www.apache.org/licenses/LICENSE-2.0
 *
 * SPDX-License-Identifier: Apache-2.0
 ********************************************************************************/

//! The keymaster client: synchronous-feeling GET/PUT/DEL, fire-and-forget
//! deferred PUT, key subscriptions and RPC-over-keys, all against one state
//! URL.
//!
//! A single client object is safe under concurrent use: request round-trips
//! are serialized by a per-client lock, and the lazily started subscriber
//! and deferred-put workers own their channels exclusively. Callbacks are
//! passed as `Arc` handles; the client shares them but the caller keeps
//! them alive.

use crate::endpoint::{EndpointUrl, TransportScheme};
use crate::error::{Error, Result};
use crate::keychain::{self, ROOT_TOPIC};
use crate::keymaster::envelope::{Envelope, CREATE_FLAG, VERB_DEL, VERB_GET, VERB_PING, VERB_PUT};
use crate::tree;
use crate::wire::frames::{frame_text, text_frame};
use crate::wire::pubsub::SubLink;
use crate::wire::reqrep::ReqEndpoint;
use bytes::Bytes;
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_yaml::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::timeout;

const PUB_URLS_KEY: &str = "Keymaster.URLS.AsConfigured.Pub";

/// Queue depths for the two worker channels.
const DEFERRED_PUT_DEPTH: usize = 1000;
const SUBSCRIBER_DATA_DEPTH: usize = 1000;

/// How long and how often to retry fetching the publisher URLs while the
/// server is still coming up.
const STARTUP_RETRIES: usize = 10;
const STARTUP_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Invoked on the subscriber worker for every publication matching a
/// subscribed key. Callbacks run sequentially, in arrival order; anything
/// slow in here delays every other subscription on this client.
pub trait KeyCallback: Send + Sync {
    fn on_update(&self, key: &str, node: &Value);
}

enum SubCtrl {
    Subscribe {
        key: String,
        callback: Arc<dyn KeyCallback>,
        ack: oneshot::Sender<bool>,
    },
    Unsubscribe {
        key: String,
        ack: oneshot::Sender<bool>,
    },
    Quit,
}

struct DeferredPut {
    key: String,
    value: String,
    create: bool,
}

/// A client to one keymaster service.
pub struct Keymaster {
    url: EndpointUrl,
    url_text: String,
    socket: Mutex<ReqEndpoint>,
    last: StdMutex<Envelope>,
    sub_ctrl: StdMutex<Option<mpsc::Sender<SubCtrl>>>,
    put_tx: StdMutex<Option<mpsc::Sender<DeferredPut>>>,
}

impl Keymaster {
    /// Creates a client for the keymaster at `url`. The connection itself is
    /// made lazily on the first call.
    pub fn new(url: &str) -> Result<Self> {
        let parsed = EndpointUrl::parse(url)?;
        if parsed.scheme == TransportScheme::RtInproc {
            return Err(Error::Creation(
                "the real-time transport cannot reach a keymaster".into(),
            ));
        }
        Ok(Keymaster {
            socket: Mutex::new(ReqEndpoint::new(parsed.clone())),
            url: parsed,
            url_text: url.to_string(),
            last: StdMutex::new(Envelope::default()),
            sub_ctrl: StdMutex::new(None),
            put_tx: StdMutex::new(None),
        })
    }

    pub fn url(&self) -> &str {
        &self.url_text
    }

    /// Checks the server is alive at all.
    pub async fn ping(&self) -> Result<String> {
        let mut socket = self.socket.lock().await;
        let reply = socket.request(vec![text_frame(VERB_PING)]).await?;
        Ok(String::from_utf8_lossy(&reply).into_owned())
    }

    /// Returns the node at `keychain`. `Root` or the empty keychain return
    /// the whole tree.
    pub async fn get(&self, keychain: &str) -> Result<Value> {
        let envelope = self.call(VERB_GET, keychain, None, None).await?;
        if envelope.result {
            Ok(envelope.node.unwrap_or(Value::Null))
        } else {
            Err(Error::Lookup(envelope.err))
        }
    }

    /// [`get`](Keymaster::get) composed with typed decoding.
    pub async fn get_as<T: DeserializeOwned>(&self, keychain: &str) -> Result<T> {
        let node = self.get(keychain).await?;
        serde_yaml::from_value(node)
            .map_err(|e| Error::Lookup(format!("cannot decode '{keychain}': {e}")))
    }

    /// Places `value` at `keychain`, optionally materialising missing
    /// ancestors.
    pub async fn put<T: Serialize>(&self, keychain: &str, value: T, create: bool) -> Result<()> {
        let text = serde_yaml::to_string(&value)?;
        let flag = if create { Some(CREATE_FLAG) } else { None };
        let envelope = self.call(VERB_PUT, keychain, Some(text), flag).await?;
        if envelope.result {
            Ok(())
        } else {
            Err(Error::Lookup(envelope.err))
        }
    }

    /// Deletes the node at `keychain`.
    pub async fn del(&self, keychain: &str) -> Result<()> {
        let envelope = self.call(VERB_DEL, keychain, None, None).await?;
        if envelope.result {
            Ok(())
        } else {
            Err(Error::Lookup(envelope.err))
        }
    }

    /// The envelope from the most recent request, successful or not.
    pub fn last_result(&self) -> Envelope {
        self.last.lock().expect("result slot poisoned").clone()
    }

    /// Queues a PUT for the deferred worker and returns immediately. The
    /// worker drops consecutive identical values per key, so hammering the
    /// same reading costs the server nothing. Delivery is best-effort; a
    /// full queue drops the update with a warning. Must be called from
    /// within a runtime, since the worker starts lazily on first use.
    pub fn put_nb(&self, keychain: &str, value: impl Into<String>, create: bool) {
        let tx = {
            let mut slot = self.put_tx.lock().expect("put worker slot poisoned");
            if slot.is_none() {
                let (tx, rx) = mpsc::channel(DEFERRED_PUT_DEPTH);
                tokio::spawn(deferred_put_loop(self.url.clone(), rx));
                *slot = Some(tx);
            }
            slot.as_ref().expect("just filled").clone()
        };
        let item = DeferredPut {
            key: keychain.to_string(),
            value: value.into(),
            create,
        };
        if tx.try_send(item).is_err() {
            warn!("deferred put queue full, dropping update for '{keychain}'");
        }
    }

    /// Subscribes `callback` to every publication at or below `key`. The
    /// empty key aliases `Root`. The subscriber worker starts lazily on the
    /// first subscription, which requires the server to be reachable.
    pub async fn subscribe(&self, key: &str, callback: Arc<dyn KeyCallback>) -> Result<()> {
        let key = if key.is_empty() { ROOT_TOPIC } else { key };
        let ctrl = self.ensure_subscriber().await?;
        let (ack_tx, ack_rx) = oneshot::channel();
        ctrl.send(SubCtrl::Subscribe {
            key: key.to_string(),
            callback,
            ack: ack_tx,
        })
        .await
        .map_err(|_| Error::Transport("subscriber worker has gone away".into()))?;
        match timeout(Duration::from_secs(5), ack_rx).await {
            Ok(Ok(true)) => Ok(()),
            _ => Err(Error::Transport(format!("could not subscribe to '{key}'"))),
        }
    }

    /// Removes the subscription at `key`. Unsubscribing a key that was never
    /// subscribed is a quiet no-op.
    pub async fn unsubscribe(&self, key: &str) -> Result<()> {
        let key = if key.is_empty() { ROOT_TOPIC } else { key };
        let ctrl = match self.sub_ctrl.lock().expect("subscriber slot poisoned").clone() {
            Some(ctrl) => ctrl,
            None => return Ok(()),
        };
        let (ack_tx, ack_rx) = oneshot::channel();
        ctrl.send(SubCtrl::Unsubscribe {
            key: key.to_string(),
            ack: ack_tx,
        })
        .await
        .map_err(|_| Error::Transport("subscriber worker has gone away".into()))?;
        match timeout(Duration::from_secs(5), ack_rx).await {
            Ok(Ok(_)) => Ok(()),
            _ => Err(Error::Transport(format!("could not unsubscribe from '{key}'"))),
        }
    }

    /// Request/response over the tree: PUTs `params` at `<key>.request` and
    /// waits for a service to answer under `<key>.reply`. Returns a failed
    /// envelope when nothing answers within `wait`.
    pub async fn rpc(&self, key: &str, params: Value, wait: Duration) -> Result<Envelope> {
        let reply_key = format!("{key}.reply");
        let request_key = format!("{key}.request");

        let (tx, rx) = oneshot::channel();
        let callback = Arc::new(RpcReply {
            slot: StdMutex::new(Some(tx)),
        });
        self.subscribe(&reply_key, callback).await?;

        let outcome = match self.put(&request_key, params, true).await {
            Ok(()) => match timeout(wait, rx).await {
                Ok(Ok(node)) => Envelope::ok_with(node),
                _ => Envelope::fail(format!("no reply under '{reply_key}' within {wait:?}")),
            },
            Err(e) => Envelope::fail(e.to_string()),
        };

        if let Err(e) = self.unsubscribe(&reply_key).await {
            warn!("unable to unsubscribe from '{reply_key}': {e}");
        }
        Ok(outcome)
    }

    /// One serialized round-trip. A transport or framing failure propagates
    /// as an error (the socket has already been discarded for rebuild by
    /// then); a server-side refusal comes back inside the envelope.
    async fn call(
        &self,
        verb: &str,
        keychain: &str,
        value: Option<String>,
        flag: Option<&str>,
    ) -> Result<Envelope> {
        let mut frames = vec![text_frame(verb), text_frame(keychain)];
        if let Some(value) = value {
            frames.push(Bytes::from(value));
        }
        if let Some(flag) = flag {
            frames.push(text_frame(flag));
        }

        let outcome = {
            let mut socket = self.socket.lock().await;
            match socket.request(frames).await {
                Ok(reply) => frame_text(&reply).and_then(Envelope::from_yaml),
                Err(e) => Err(e),
            }
        };
        match outcome {
            Ok(envelope) => {
                *self.last.lock().expect("result slot poisoned") = envelope.clone();
                Ok(envelope)
            }
            Err(e) => {
                let failure = Envelope::fail(format!(
                    "failed to {verb} '{keychain}' at {}: {e}",
                    self.url_text
                ));
                *self.last.lock().expect("result slot poisoned") = failure;
                Err(e)
            }
        }
    }

    /// Starts the subscriber worker if it is not already running: fetch the
    /// publisher URL set, pick the one matching our transport, connect, and
    /// hand the connection to its own task.
    async fn ensure_subscriber(&self) -> Result<mpsc::Sender<SubCtrl>> {
        if let Some(ctrl) = self.sub_ctrl.lock().expect("subscriber slot poisoned").clone() {
            return Ok(ctrl);
        }

        let mut pub_urls: Vec<String> = Vec::new();
        for attempt in 0..STARTUP_RETRIES {
            match self.get_as(PUB_URLS_KEY).await {
                Ok(urls) => {
                    pub_urls = urls;
                    break;
                }
                Err(e) if attempt + 1 == STARTUP_RETRIES => return Err(e),
                // The server may still be coming up; give it a moment.
                Err(_) => tokio::time::sleep(STARTUP_RETRY_DELAY).await,
            }
        }

        let target = pub_urls
            .iter()
            .filter_map(|u| EndpointUrl::parse(u).ok())
            .find(|u| u.scheme == self.url.scheme)
            .ok_or_else(|| {
                Error::Creation(format!(
                    "no publisher endpoint matches the transport of {}",
                    self.url_text
                ))
            })?;
        let link = SubLink::connect(&target, SUBSCRIBER_DATA_DEPTH).await?;
        let (ctrl_tx, ctrl_rx) = mpsc::channel(16);
        tokio::spawn(subscriber_loop(link, ctrl_rx));

        // Check again under the lock; another task may have raced us here.
        // The spare worker dies with its unused control channel.
        let mut slot = self.sub_ctrl.lock().expect("subscriber slot poisoned");
        if let Some(existing) = slot.clone() {
            return Ok(existing);
        }
        *slot = Some(ctrl_tx.clone());
        Ok(ctrl_tx)
    }
}

impl Drop for Keymaster {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.sub_ctrl.lock() {
            if let Some(ctrl) = slot.take() {
                let _ = ctrl.try_send(SubCtrl::Quit);
            }
        }
        if let Ok(mut slot) = self.put_tx.lock() {
            slot.take();
        }
    }
}

struct RpcReply {
    slot: StdMutex<Option<oneshot::Sender<Value>>>,
}

impl KeyCallback for RpcReply {
    fn on_update(&self, _key: &str, node: &Value) {
        if let Some(tx) = self.slot.lock().expect("rpc slot poisoned").take() {
            let _ = tx.send(node.clone());
        }
    }
}

/// The subscriber worker: sole owner of the subscribe link and the
/// key→callback table. Control and data are raced here so both stay on one
/// thread of execution, and callbacks run strictly in arrival order.
async fn subscriber_loop(mut link: SubLink, mut ctrl: mpsc::Receiver<SubCtrl>) {
    let mut callbacks: HashMap<String, Arc<dyn KeyCallback>> = HashMap::new();
    loop {
        tokio::select! {
            cmd = ctrl.recv() => match cmd {
                Some(SubCtrl::Subscribe { key, callback, ack }) => {
                    let ok = link.set_subscribed(&key, true).await.is_ok();
                    if ok {
                        callbacks.insert(key, callback);
                    }
                    let _ = ack.send(ok);
                }
                Some(SubCtrl::Unsubscribe { key, ack }) => {
                    if let Err(e) = link.set_subscribed(&key, false).await {
                        debug!("filter removal for '{key}' failed: {e}");
                    }
                    callbacks.remove(&key);
                    let _ = ack.send(true);
                }
                Some(SubCtrl::Quit) | None => break,
            },
            message = link.next() => match message {
                Some((topic, payload)) => dispatch(&callbacks, &topic, &payload),
                None => {
                    warn!("keymaster publisher link lost; no further key events");
                    break;
                }
            },
        }
    }
    debug!("subscriber loop exited");
}

fn dispatch(callbacks: &HashMap<String, Arc<dyn KeyCallback>>, topic: &str, payload: &Bytes) {
    let Ok(text) = std::str::from_utf8(payload) else {
        debug!("discarding a non-text publication under '{topic}'");
        return;
    };
    let node = match tree::from_yaml(text) {
        Ok(node) => node,
        Err(e) => {
            debug!("discarding an unparseable publication under '{topic}': {e}");
            return;
        }
    };
    for (key, callback) in callbacks {
        if keychain::covers(key, topic) {
            callback.on_update(topic, &node);
        }
    }
}

/// The deferred-put worker: drains the queue onto its own request socket,
/// memoising the last value sent per key so repeated identical writes cost
/// the server exactly one PUT.
async fn deferred_put_loop(url: EndpointUrl, mut rx: mpsc::Receiver<DeferredPut>) {
    let mut socket = ReqEndpoint::new(url);
    let mut memo: HashMap<String, String> = HashMap::new();

    while let Some(item) = rx.recv().await {
        let mut create = false;
        match memo.get(&item.key) {
            Some(previous) if *previous == item.value => continue,
            Some(_) => {}
            // A key the worker has never sent may need creating, but only
            // when the caller asked for it.
            None => create = item.create,
        }
        memo.insert(item.key.clone(), item.value.clone());

        let mut frames = vec![
            text_frame(VERB_PUT),
            text_frame(&item.key),
            Bytes::from(item.value),
        ];
        if create {
            frames.push(text_frame(CREATE_FLAG));
        }
        match socket.request(frames).await {
            Ok(reply) => {
                if let Ok(envelope) = frame_text(&reply).and_then(Envelope::from_yaml) {
                    if !envelope.result {
                        debug!("deferred put of '{}' refused: {}", item.key, envelope.err);
                    }
                }
            }
            Err(e) => warn!("deferred put of '{}' failed: {e}", item.key),
        }
    }
    debug!("deferred put loop exited");
}
