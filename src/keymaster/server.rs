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

//! The keymaster server: the single authoritative owner of the
//! configuration/state tree.
//!
//! Three dedicated threads cooperate, each owning its endpoints outright:
//!
//! * the **request** thread drains a merged queue of one-shot GET/PUT/DEL
//!   requests from every bound state endpoint and is the only code that
//!   touches the tree;
//! * the **publish** thread drains a bounded queue of (topic, payload)
//!   pairs onto the publish endpoints;
//! * the **heartbeat** thread PUTs a strictly increasing timestamp to
//!   `Keymaster.heartbeat` once a second through the most local endpoint.
//!
//! The resolved endpoint URLs are written into the tree under
//! `Keymaster.URLS.AsConfigured` *before* the request loop starts serving,
//! which is what breaks the cycle between the server owning the directory
//! and needing to appear in it.

use crate::config::{load_config_file, ServerSettings};
use crate::endpoint::{most_local, EndpointUrl};
use crate::error::{Error, Result};
use crate::keychain::{self, ROOT_TOPIC};
use crate::keymaster::envelope::{
    Envelope, CREATE_FLAG, LIVENESS_REPLY, VERB_DEL, VERB_GET, VERB_PING, VERB_PUT,
};
use crate::tree;
use crate::wire::frames::{frame_text, text_frame};
use crate::wire::inproc::IncomingRequest;
use crate::wire::pubsub::PubEndpoint;
use crate::wire::reqrep::{RepEndpoint, ReqEndpoint};
use bytes::Bytes;
use log::{debug, info, warn};
use serde_yaml::Value;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::runtime::Builder;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;

const AS_CONFIGURED_STATE_KEY: &str = "Keymaster.URLS.AsConfigured.State";
const AS_CONFIGURED_PUB_KEY: &str = "Keymaster.URLS.AsConfigured.Pub";
const HEARTBEAT_KEY: &str = "Keymaster.heartbeat";

/// How long the publish thread waits after binding before servicing its
/// queue, so subscribers that survived a server restart can reconnect and
/// miss nothing that matters.
const PUBLISH_GRACE: Duration = Duration::from_secs(2);

/// Depth of the publication queue between the request and publish threads.
const PUBLISH_QUEUE_DEPTH: usize = 1000;

/// Depth of the merged request queue.
const REQUEST_QUEUE_DEPTH: usize = 64;

/// The server lifecycle. Client traffic is only served in `Running`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ServerState {
    Init,
    Bound,
    Running,
    Terminating,
    Stopped,
}

struct PubCommand {
    topic: String,
    payload: String,
}

enum RequestCtrl {
    Quit(oneshot::Sender<()>),
}

/// The keymaster service. Construct from a seed document, [`run`] to bind
/// and serve, [`terminate`] for an orderly stop.
///
/// [`run`]: KeymasterServer::run
/// [`terminate`]: KeymasterServer::terminate
pub struct KeymasterServer {
    settings: ServerSettings,
    seed: Option<Value>,
    state: ServerState,
    publish_tx: Option<mpsc::Sender<PubCommand>>,
    request_ctrl: Option<mpsc::Sender<RequestCtrl>>,
    hb_stop: Option<watch::Sender<bool>>,
    done: Vec<oneshot::Receiver<()>>,
    state_urls: Vec<String>,
    pub_urls: Vec<String>,
}

impl KeymasterServer {
    /// Builds a server around a parsed seed document. The document becomes
    /// the initial state of the tree wholesale.
    pub fn new(seed: Value) -> Result<Self> {
        let settings = ServerSettings::from_tree(&seed)?;
        Ok(KeymasterServer {
            settings,
            seed: Some(seed),
            state: ServerState::Init,
            publish_tx: None,
            request_ctrl: None,
            hb_stop: None,
            done: Vec::new(),
            state_urls: Vec::new(),
            pub_urls: Vec::new(),
        })
    }

    /// Builds a server from a seed document on disk.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::new(load_config_file(path)?)
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    /// The resolved state endpoints, available once running.
    pub fn state_urls(&self) -> &[String] {
        &self.state_urls
    }

    /// The resolved publish endpoints, available once running.
    pub fn pub_urls(&self) -> &[String] {
        &self.pub_urls
    }

    /// Binds every endpoint and starts the three service threads. Inability
    /// to bind any initial endpoint is fatal and leaves nothing running.
    pub async fn run(&mut self) -> Result<()> {
        match self.state {
            ServerState::Init => {}
            ServerState::Bound | ServerState::Running => return Ok(()),
            _ => {
                return Err(Error::Creation(format!(
                    "cannot run a server in state {:?}",
                    self.state
                )))
            }
        }
        let seed = self
            .seed
            .take()
            .ok_or_else(|| Error::Creation("seed document already consumed".into()))?;

        // Publish thread first: the request thread records its resolved URLs.
        let (pub_tx, pub_rx) = mpsc::channel::<PubCommand>(PUBLISH_QUEUE_DEPTH);
        let (pub_ready_tx, pub_ready_rx) = oneshot::channel();
        let (pub_done_tx, pub_done_rx) = oneshot::channel();
        spawn_runtime_thread("km-publisher", pub_done_tx, {
            let urls = self.settings.pub_urls.clone();
            move || publish_loop(urls, pub_rx, pub_ready_tx)
        })?;
        let pub_resolved = pub_ready_rx
            .await
            .map_err(|_| Error::Creation("publish thread died during startup".into()))??;

        let (req_ctrl_tx, req_ctrl_rx) = mpsc::channel::<RequestCtrl>(1);
        let (req_ready_tx, req_ready_rx) = oneshot::channel();
        let (req_done_tx, req_done_rx) = oneshot::channel();
        spawn_runtime_thread("km-request", req_done_tx, {
            let urls = self.settings.state_urls.clone();
            let clone_interval = self.settings.clone_interval;
            let publish = pub_tx.clone();
            let pub_resolved = pub_resolved.clone();
            move || {
                request_loop(
                    urls,
                    seed,
                    clone_interval,
                    publish,
                    pub_resolved,
                    req_ctrl_rx,
                    req_ready_tx,
                )
            }
        })?;
        let state_resolved = req_ready_rx
            .await
            .map_err(|_| Error::Creation("request thread died during startup".into()))??;

        self.state = ServerState::Bound;
        info!("keymaster bound; state {state_resolved:?}, publish {pub_resolved:?}");

        let (hb_stop_tx, hb_stop_rx) = watch::channel(false);
        let (hb_done_tx, hb_done_rx) = oneshot::channel();
        let heartbeat_target = most_local(&state_resolved)
            .ok_or_else(|| Error::Creation("no usable endpoint for the heartbeat".into()))?;
        let heartbeat_url = EndpointUrl::parse(&heartbeat_target)?;
        spawn_runtime_thread("km-heartbeat", hb_done_tx, move || {
            heartbeat_loop(heartbeat_url, hb_stop_rx)
        })?;

        self.publish_tx = Some(pub_tx);
        self.request_ctrl = Some(req_ctrl_tx);
        self.hb_stop = Some(hb_stop_tx);
        self.done = vec![pub_done_rx, req_done_rx, hb_done_rx];
        self.state_urls = state_resolved;
        self.pub_urls = pub_resolved;
        self.state = ServerState::Running;
        info!("keymaster running");
        Ok(())
    }

    /// Orderly shutdown: stop the request loop over its control channel,
    /// release the publish queue, stop the heartbeat, and wait for each
    /// thread to wind down on its own.
    pub async fn terminate(&mut self) {
        if !matches!(self.state, ServerState::Bound | ServerState::Running) {
            return;
        }
        self.state = ServerState::Terminating;
        info!("keymaster terminating");

        if let Some(ctrl) = self.request_ctrl.take() {
            let (ack_tx, ack_rx) = oneshot::channel();
            if ctrl.send(RequestCtrl::Quit(ack_tx)).await.is_ok() {
                let _ = timeout(Duration::from_secs(5), ack_rx).await;
            }
        }
        self.publish_tx.take();
        if let Some(stop) = self.hb_stop.take() {
            let _ = stop.send(true);
        }
        for done in self.done.drain(..) {
            let _ = timeout(Duration::from_secs(10), done).await;
        }
        self.state = ServerState::Stopped;
        info!("keymaster stopped");
    }
}

impl Drop for KeymasterServer {
    fn drop(&mut self) {
        if matches!(self.state, ServerState::Bound | ServerState::Running) {
            // Best effort only; terminate() is the clean path.
            if let Some(ctrl) = self.request_ctrl.take() {
                let (ack_tx, _) = oneshot::channel();
                let _ = ctrl.try_send(RequestCtrl::Quit(ack_tx));
            }
            self.publish_tx.take();
            if let Some(stop) = self.hb_stop.take() {
                let _ = stop.send(true);
            }
        }
    }
}

/// Spawns a named thread running a current-thread runtime around one service
/// loop, signalling `done` when the loop has fully unwound.
fn spawn_runtime_thread<F, Fut>(
    name: &str,
    done: oneshot::Sender<()>,
    make_loop: F,
) -> Result<()>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()>,
{
    let thread_name = name.to_string();
    std::thread::Builder::new()
        .name(thread_name.clone())
        .spawn(move || {
            let runtime = match Builder::new_current_thread().enable_all().build() {
                Ok(rt) => rt,
                Err(e) => {
                    warn!("{thread_name}: cannot build runtime: {e}");
                    let _ = done.send(());
                    return;
                }
            };
            runtime.block_on(make_loop());
            let _ = done.send(());
        })
        .map_err(|e| Error::Creation(format!("cannot spawn {name} thread: {e}")))?;
    Ok(())
}

async fn publish_loop(
    urls: Vec<EndpointUrl>,
    mut rx: mpsc::Receiver<PubCommand>,
    ready: oneshot::Sender<Result<Vec<String>>>,
) {
    let mut endpoint = match PubEndpoint::bind(&urls).await {
        Ok(endpoint) => endpoint,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    let _ = ready.send(Ok(endpoint.resolved.clone()));

    // Give subscribers from before a restart time to find us again.
    tokio::time::sleep(PUBLISH_GRACE).await;

    while let Some(cmd) = rx.recv().await {
        if !endpoint.publish(&cmd.topic, cmd.payload.as_bytes()) {
            debug!("a subscriber lagged on '{}'", cmd.topic);
        }
    }
    endpoint.close();
}

#[allow(clippy::too_many_arguments)]
async fn request_loop(
    urls: Vec<EndpointUrl>,
    seed: Value,
    clone_interval: u64,
    publish: mpsc::Sender<PubCommand>,
    pub_resolved: Vec<String>,
    mut ctrl: mpsc::Receiver<RequestCtrl>,
    ready: oneshot::Sender<Result<Vec<String>>>,
) {
    let mut endpoint = match RepEndpoint::bind(&urls, REQUEST_QUEUE_DEPTH).await {
        Ok(endpoint) => endpoint,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    let resolved = endpoint.resolved.clone();

    let mut service = RequestService {
        tree: seed,
        publish,
        clone_interval,
        put_counter: 0,
    };
    if let Err(e) = service.record_endpoints(&resolved, &pub_resolved).await {
        let _ = ready.send(Err(e));
        return;
    }
    let _ = ready.send(Ok(resolved));

    // Everything, once, so clients subscribed before a restart resync.
    service.publish_root().await;

    loop {
        tokio::select! {
            cmd = ctrl.recv() => match cmd {
                Some(RequestCtrl::Quit(ack)) => {
                    let _ = ack.send(());
                    break;
                }
                None => break,
            },
            request = endpoint.rx.recv() => match request {
                Some(request) => service.serve(request).await,
                None => break,
            },
        }
    }
    debug!("request loop exited");
}

/// Exclusive owner of the tree. All reads and writes funnel through here.
struct RequestService {
    tree: Value,
    publish: mpsc::Sender<PubCommand>,
    clone_interval: u64,
    put_counter: u64,
}

impl RequestService {
    async fn record_endpoints(
        &mut self,
        state_urls: &[String],
        pub_urls: &[String],
    ) -> Result<()> {
        for (key, urls) in [
            (AS_CONFIGURED_STATE_KEY, state_urls),
            (AS_CONFIGURED_PUB_KEY, pub_urls),
        ] {
            let node = serde_yaml::to_value(urls)?;
            tree::put_node(&mut self.tree, key, node, true)
                .map_err(|e| Error::Config(format!("cannot record {key}: {e}")))?;
            self.publish_key(key, true).await;
        }
        Ok(())
    }

    async fn serve(&mut self, request: IncomingRequest) {
        let reply = self.reply_for(&request.frames).await;
        // A peer that hung up mid-exchange is its own problem.
        let _ = request.reply.send(reply);
    }

    async fn reply_for(&mut self, frames: &[Bytes]) -> Bytes {
        let Some(verb_frame) = frames.first() else {
            return envelope_frame(Envelope::fail("empty request"));
        };
        let verb = match frame_text(verb_frame) {
            Ok(verb) => verb,
            Err(_) => return envelope_frame(Envelope::fail("request verb is not text")),
        };
        match verb {
            VERB_PING => text_frame(LIVENESS_REPLY),
            VERB_GET => envelope_frame(self.handle_get(frames)),
            VERB_PUT => {
                let (envelope, mutated) = self.handle_put(frames);
                if let Some(keychain) = mutated {
                    self.publish_key(&keychain, false).await;
                    self.reroot_if_due();
                }
                envelope_frame(envelope)
            }
            VERB_DEL => {
                let (envelope, mutated) = self.handle_del(frames);
                if let Some(keychain) = mutated {
                    self.publish_key(&keychain, true).await;
                }
                envelope_frame(envelope)
            }
            other => {
                debug!("unknown request '{other}'");
                envelope_frame(Envelope::fail(format!("unknown request '{other}'")))
            }
        }
    }

    fn handle_get(&self, frames: &[Bytes]) -> Envelope {
        let Some(keychain) = text_arg(frames, 1) else {
            return Envelope::fail("keychain expected, but not received");
        };
        match tree::get_node(&self.tree, keychain::normalize(keychain)) {
            Ok(node) => Envelope::ok_with(node),
            Err(e) => Envelope::fail(e.to_string()),
        }
    }

    /// Applies a PUT; on success also names the keychain to publish under.
    fn handle_put(&mut self, frames: &[Bytes]) -> (Envelope, Option<String>) {
        let (Some(keychain), Some(value_text)) = (text_arg(frames, 1), text_arg(frames, 2)) else {
            return (
                Envelope::fail("keychain and value expected, but not received"),
                None,
            );
        };
        let create = text_arg(frames, 3) == Some(CREATE_FLAG);
        let node = match tree::from_yaml(value_text) {
            Ok(node) => node,
            Err(e) => return (Envelope::fail(format!("unparseable value: {e}")), None),
        };
        match tree::put_node(&mut self.tree, keychain, node, create) {
            Ok(()) => {
                self.put_counter += 1;
                (Envelope::ok(), Some(keychain.to_string()))
            }
            Err(e) => (Envelope::fail(e.to_string()), None),
        }
    }

    fn handle_del(&mut self, frames: &[Bytes]) -> (Envelope, Option<String>) {
        let Some(keychain) = text_arg(frames, 1) else {
            return (Envelope::fail("keychain expected, but not received"), None);
        };
        match tree::delete_node(&mut self.tree, keychain) {
            Ok(()) => (Envelope::ok(), Some(keychain.to_string())),
            Err(e) => (Envelope::fail(e.to_string()), None),
        }
    }

    /// Queues the changed subtree under every prefix of the keychain,
    /// shortest to longest, skipping prefixes that no longer resolve (a
    /// deletion removes its own terminal). The root travels under the
    /// literal `Root` topic.
    async fn publish_key(&self, keychain: &str, block: bool) {
        let keychain = keychain::normalize(keychain);
        if keychain.is_empty() {
            if let Ok(payload) = tree::to_yaml(&self.tree) {
                self.enqueue(ROOT_TOPIC, payload, block).await;
            }
            return;
        }
        for prefix in keychain::prefixes(keychain) {
            let Ok(node) = tree::get_node(&self.tree, &prefix) else {
                continue;
            };
            if let Ok(payload) = tree::to_yaml(&node) {
                self.enqueue(&prefix, payload, block).await;
            }
        }
    }

    async fn publish_root(&self) {
        self.publish_key("", true).await;
    }

    async fn enqueue(&self, topic: &str, payload: String, block: bool) {
        let cmd = PubCommand {
            topic: topic.to_string(),
            payload,
        };
        if block {
            let _ = self.publish.send(cmd).await;
        } else if self.publish.try_send(cmd).is_err() {
            debug!("publication under '{topic}' dropped, queue full");
        }
    }

    /// Replaces the root with a compact deep copy every `clone_interval`
    /// PUTs. With an owned value tree this is bounded-memory hygiene rather
    /// than a correctness requirement; the knob survives for compatibility
    /// with seed documents that set it.
    fn reroot_if_due(&mut self) {
        if self.clone_interval > 0 && self.put_counter % self.clone_interval == 0 {
            let fresh = self.tree.clone();
            self.tree = fresh;
            debug!("re-rooted the tree after {} puts", self.put_counter);
        }
    }
}

fn text_arg<'f>(frames: &'f [Bytes], index: usize) -> Option<&'f str> {
    frames.get(index).and_then(|f| frame_text(f).ok())
}

fn envelope_frame(envelope: Envelope) -> Bytes {
    match envelope.to_yaml() {
        Ok(text) => Bytes::from(text),
        Err(e) => {
            warn!("cannot serialize a reply envelope: {e}");
            Bytes::from_static(b"result: false\nerr: reply serialization failed\n")
        }
    }
}

async fn heartbeat_loop(url: EndpointUrl, mut stop: watch::Receiver<bool>) {
    let mut socket = ReqEndpoint::new(url);
    let epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let mut beats: u64 = 0;
    let mut wake = tokio::time::Instant::now() + Duration::from_secs(1);

    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(wake) => {}
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
                continue;
            }
        }
        beats += 1;
        wake += Duration::from_secs(1);

        // The planned wake times stamp the beats, so the sequence is
        // strictly increasing even when the loop itself gets delayed.
        let stamp = epoch.as_nanos() as u64 + beats * 1_000_000_000;
        let frames = vec![
            text_frame(VERB_PUT),
            text_frame(HEARTBEAT_KEY),
            text_frame(&stamp.to_string()),
            text_frame(CREATE_FLAG),
        ];
        if let Err(e) = socket.request(frames).await {
            warn!("heartbeat put failed: {e}");
        }
    }
    debug!("heartbeat loop exited");
}
