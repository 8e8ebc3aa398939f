/********************************************************************************
 * Copyright (c) 2026 Contributors to the Eclipse Foundation
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

//! The socket transport family: `tcp`, `ipc` and `inproc` data streams over
//! the same framed pub/sub fabric the keymaster publishes on.

use crate::endpoint::{EndpointUrl, TransportScheme};
use crate::error::{Error, Result};
use crate::keymaster::Keymaster;
use crate::transport::{
    ClientFactory, DataCallback, ServerFactory, TransportClient, TransportServer,
};
use crate::wire::pubsub::{PubEndpoint, SubLink};
use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

const CLIENT_QUEUE_DEPTH: usize = 1000;

pub(crate) struct SocketServerFactory;

#[async_trait]
impl ServerFactory for SocketServerFactory {
    async fn create_server(
        &self,
        km_url: &str,
        transport_key: &str,
        specified: &[EndpointUrl],
    ) -> Result<Arc<dyn TransportServer>> {
        for url in specified {
            if url.scheme == TransportScheme::RtInproc {
                return Err(Error::Creation(format!(
                    "'{url}' belongs to the real-time family"
                )));
            }
        }
        let endpoint = PubEndpoint::bind(specified).await?;
        let resolved = endpoint.resolved.clone();

        let km = Keymaster::new(km_url)?;
        km.put(&format!("{transport_key}.AsConfigured"), &resolved, true)
            .await?;

        Ok(Arc::new(SocketTransportServer {
            km_url: km_url.to_string(),
            transport_key: transport_key.to_string(),
            resolved,
            endpoint: StdMutex::new(Some(endpoint)),
        }))
    }
}

/// A bound socket publisher for one component transport.
pub struct SocketTransportServer {
    km_url: String,
    transport_key: String,
    resolved: Vec<String>,
    endpoint: StdMutex<Option<PubEndpoint>>,
}

#[async_trait]
impl TransportServer for SocketTransportServer {
    fn as_configured(&self) -> Vec<String> {
        self.resolved.clone()
    }

    async fn publish(&self, topic: &str, data: &[u8]) -> Result<()> {
        let endpoint = self.endpoint.lock().expect("endpoint slot poisoned");
        match endpoint.as_ref() {
            Some(endpoint) => {
                // Buffering is the fabric's default; a lagging subscriber
                // loses samples rather than exerting backpressure here.
                if !endpoint.publish(topic, data) {
                    debug!("a subscriber lagged on '{topic}'");
                }
                Ok(())
            }
            None => Err(Error::Transport(format!(
                "transport for {} is closed",
                self.transport_key
            ))),
        }
    }

    async fn close(&self) {
        let endpoint = self
            .endpoint
            .lock()
            .expect("endpoint slot poisoned")
            .take();
        if let Some(mut endpoint) = endpoint {
            endpoint.close();
        }
        match Keymaster::new(&self.km_url) {
            Ok(km) => {
                let key = format!("{}.AsConfigured", self.transport_key);
                if let Err(e) = km.del(&key).await {
                    // The keymaster may already be gone during teardown.
                    debug!("could not deregister {key}: {e}");
                }
            }
            Err(e) => debug!("could not reach the keymaster during close: {e}"),
        }
    }
}

pub(crate) struct SocketClientFactory;

#[async_trait]
impl ClientFactory for SocketClientFactory {
    async fn create_client(&self, url: &EndpointUrl) -> Result<Arc<dyn TransportClient>> {
        let link = SubLink::connect(url, CLIENT_QUEUE_DEPTH).await?;
        let (ctrl_tx, ctrl_rx) = mpsc::channel(16);
        tokio::spawn(client_loop(link, ctrl_rx));
        Ok(Arc::new(SocketTransportClient {
            url: url.to_string(),
            ctrl: ctrl_tx,
        }))
    }
}

enum ClientCtrl {
    Subscribe {
        topic: String,
        callback: Arc<dyn DataCallback>,
        ack: oneshot::Sender<bool>,
    },
    Unsubscribe {
        topic: String,
        callback: Arc<dyn DataCallback>,
        ack: oneshot::Sender<bool>,
    },
    Quit,
}

/// A subscriber connection to one resolved URL, shared by every sink that
/// targets the same publisher.
pub struct SocketTransportClient {
    url: String,
    ctrl: mpsc::Sender<ClientCtrl>,
}

impl SocketTransportClient {
    async fn send_ctrl(&self, cmd: ClientCtrl, ack: oneshot::Receiver<bool>) -> Result<()> {
        self.ctrl
            .send(cmd)
            .await
            .map_err(|_| Error::Transport(format!("subscriber worker for {} is gone", self.url)))?;
        match timeout(Duration::from_secs(5), ack).await {
            Ok(Ok(true)) => Ok(()),
            _ => Err(Error::Transport(format!(
                "subscription change on {} failed",
                self.url
            ))),
        }
    }
}

#[async_trait]
impl TransportClient for SocketTransportClient {
    fn url(&self) -> &str {
        &self.url
    }

    async fn subscribe(&self, topic: &str, callback: Arc<dyn DataCallback>) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.send_ctrl(
            ClientCtrl::Subscribe {
                topic: topic.to_string(),
                callback,
                ack: ack_tx,
            },
            ack_rx,
        )
        .await
    }

    async fn unsubscribe(&self, topic: &str, callback: &Arc<dyn DataCallback>) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.send_ctrl(
            ClientCtrl::Unsubscribe {
                topic: topic.to_string(),
                callback: callback.clone(),
                ack: ack_tx,
            },
            ack_rx,
        )
        .await
    }

    async fn close(&self) {
        let _ = self.ctrl.send(ClientCtrl::Quit).await;
    }
}

/// One reader per connection: control commands and inbound data are raced
/// on a single worker, so callbacks fire in receive order, one at a time.
async fn client_loop(mut link: SubLink, mut ctrl: mpsc::Receiver<ClientCtrl>) {
    let mut callbacks: HashMap<String, Vec<Arc<dyn DataCallback>>> = HashMap::new();
    loop {
        tokio::select! {
            cmd = ctrl.recv() => match cmd {
                Some(ClientCtrl::Subscribe { topic, callback, ack }) => {
                    let list = callbacks.entry(topic.clone()).or_default();
                    let ok = if list.is_empty() {
                        link.set_subscribed(&topic, true).await.is_ok()
                    } else {
                        true
                    };
                    if ok {
                        list.push(callback);
                    }
                    let _ = ack.send(ok);
                }
                Some(ClientCtrl::Unsubscribe { topic, callback, ack }) => {
                    if let Some(list) = callbacks.get_mut(&topic) {
                        list.retain(|cb| !Arc::ptr_eq(cb, &callback));
                        if list.is_empty() {
                            callbacks.remove(&topic);
                            if let Err(e) = link.set_subscribed(&topic, false).await {
                                debug!("filter removal for '{topic}' failed: {e}");
                            }
                        }
                    }
                    let _ = ack.send(true);
                }
                Some(ClientCtrl::Quit) | None => break,
            },
            message = link.next() => match message {
                Some((topic, payload)) => deliver(&callbacks, &topic, &payload),
                None => {
                    warn!("data link lost; stream subscriptions are dead");
                    break;
                }
            },
        }
    }
    debug!("transport client loop exited");
}

fn deliver(callbacks: &HashMap<String, Vec<Arc<dyn DataCallback>>>, topic: &str, payload: &Bytes) {
    if let Some(list) = callbacks.get(topic) {
        for callback in list {
            callback.on_data(topic, payload);
        }
    }
}
