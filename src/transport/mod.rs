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

//! The pluggable data transport fabric.
//!
//! A [`TransportServer`] is the publishing side a component binds once per
//! declared transport; a [`TransportClient`] is the subscribing side, keyed
//! on the fully resolved URL so every sink aiming at the same publisher
//! shares one connection. Both sides are created through factories
//! registered per URL scheme, so a new transport family plugs in without the
//! rest of the system knowing; discovery of concrete endpoints goes through
//! the keymaster's `Specified`/`AsConfigured` key pair.
//!
//! Directory entries are use-counted: every acquire bumps the count, the
//! matching release drops it, and the last release removes the entry and
//! closes the underlying sockets.

mod rt;
mod socket;

pub use rt::{RtTransportClient, RtTransportServer};
pub use socket::{SocketTransportClient, SocketTransportServer};

use crate::endpoint::{EndpointUrl, TransportScheme};
use crate::error::{Error, Result};
use crate::keymaster::Keymaster;
use async_trait::async_trait;
use lazy_static::lazy_static;
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;

/// Receives raw payloads on the subscriber worker. The transport shares the
/// handle; the subscriber keeps it alive. Implementations should only
/// enqueue: they run on the dispatch path of every other subscription on
/// the same connection.
pub trait DataCallback: Send + Sync {
    fn on_data(&self, topic: &str, data: &[u8]);
}

/// The publishing side of one transport on one component.
#[async_trait]
pub trait TransportServer: Send + Sync {
    /// The resolved URLs, as written back under `AsConfigured`.
    fn as_configured(&self) -> Vec<String>;

    /// Sends one (topic, payload) pair. Failure is reported but must leave
    /// the server usable.
    async fn publish(&self, topic: &str, data: &[u8]) -> Result<()>;

    /// Releases the sockets without lingering and removes `AsConfigured`
    /// from the tree.
    async fn close(&self);
}

/// The subscribing side of one resolved URL.
#[async_trait]
pub trait TransportClient: Send + Sync {
    fn url(&self) -> &str;

    async fn subscribe(&self, topic: &str, callback: Arc<dyn DataCallback>) -> Result<()>;

    /// Detaches one callback, identified by handle, from a topic.
    async fn unsubscribe(&self, topic: &str, callback: &Arc<dyn DataCallback>) -> Result<()>;

    async fn close(&self);
}

/// Builds transport servers for one or more schemes.
#[async_trait]
pub trait ServerFactory: Send + Sync {
    /// Reads `<transport_key>.Specified`, binds, and writes
    /// `<transport_key>.AsConfigured` back through the keymaster.
    async fn create_server(
        &self,
        km_url: &str,
        transport_key: &str,
        specified: &[EndpointUrl],
    ) -> Result<Arc<dyn TransportServer>>;
}

/// Builds transport clients for one or more schemes.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn create_client(&self, url: &EndpointUrl) -> Result<Arc<dyn TransportClient>>;
}

struct CountedServer {
    active: usize,
    server: Arc<dyn TransportServer>,
}

struct CountedClient {
    active: usize,
    client: Arc<dyn TransportClient>,
}

lazy_static! {
    static ref SERVER_FACTORIES: StdMutex<HashMap<TransportScheme, Arc<dyn ServerFactory>>> =
        StdMutex::new(builtin_server_factories());
    static ref CLIENT_FACTORIES: StdMutex<HashMap<TransportScheme, Arc<dyn ClientFactory>>> =
        StdMutex::new(builtin_client_factories());
    static ref SERVER_DIRECTORY: Mutex<HashMap<(String, String), CountedServer>> =
        Mutex::new(HashMap::new());
    static ref CLIENT_DIRECTORY: Mutex<HashMap<String, CountedClient>> =
        Mutex::new(HashMap::new());
}

// The socket family and the real-time family come registered out of the
// box; custom families join through add_server_factory/add_client_factory.
fn builtin_server_factories() -> HashMap<TransportScheme, Arc<dyn ServerFactory>> {
    let socket: Arc<dyn ServerFactory> = Arc::new(socket::SocketServerFactory);
    let rt: Arc<dyn ServerFactory> = Arc::new(rt::RtServerFactory);
    HashMap::from([
        (TransportScheme::Tcp, socket.clone()),
        (TransportScheme::Ipc, socket.clone()),
        (TransportScheme::Inproc, socket),
        (TransportScheme::RtInproc, rt),
    ])
}

fn builtin_client_factories() -> HashMap<TransportScheme, Arc<dyn ClientFactory>> {
    let socket: Arc<dyn ClientFactory> = Arc::new(socket::SocketClientFactory);
    let rt: Arc<dyn ClientFactory> = Arc::new(rt::RtClientFactory);
    HashMap::from([
        (TransportScheme::Tcp, socket.clone()),
        (TransportScheme::Ipc, socket.clone()),
        (TransportScheme::Inproc, socket),
        (TransportScheme::RtInproc, rt),
    ])
}

/// Registers a server factory for the given schemes, making them available
/// process-wide. Re-registering a scheme replaces the earlier factory.
pub fn add_server_factory(schemes: &[TransportScheme], factory: Arc<dyn ServerFactory>) {
    let mut factories = SERVER_FACTORIES.lock().expect("factory registry poisoned");
    for scheme in schemes {
        factories.insert(*scheme, factory.clone());
    }
}

/// Registers a client factory for the given schemes.
pub fn add_client_factory(schemes: &[TransportScheme], factory: Arc<dyn ClientFactory>) {
    let mut factories = CLIENT_FACTORIES.lock().expect("factory registry poisoned");
    for scheme in schemes {
        factories.insert(*scheme, factory.clone());
    }
}

/// Returns the shared transport server for `(component, transport_name)`,
/// creating it on first use from the component's `Specified` list.
pub async fn acquire_server(
    km_url: &str,
    component: &str,
    transport_name: &str,
) -> Result<Arc<dyn TransportServer>> {
    let key = (component.to_string(), transport_name.to_string());
    let mut directory = SERVER_DIRECTORY.lock().await;
    if let Some(entry) = directory.get_mut(&key) {
        entry.active += 1;
        return Ok(entry.server.clone());
    }

    let transport_key = format!("components.{component}.Transports.{transport_name}");
    let server = create_server(km_url, &transport_key).await?;
    directory.insert(
        key,
        CountedServer {
            active: 1,
            server: server.clone(),
        },
    );
    debug!("created transport server for {component}/{transport_name}");
    Ok(server)
}

/// Releases one use of a shared transport server. The last release removes
/// the directory entry and closes the server.
pub async fn release_server(component: &str, transport_name: &str) {
    let key = (component.to_string(), transport_name.to_string());
    let mut directory = SERVER_DIRECTORY.lock().await;
    let Some(entry) = directory.get_mut(&key) else {
        warn!("release of unknown transport server {component}/{transport_name}");
        return;
    };
    entry.active -= 1;
    if entry.active == 0 {
        let entry = directory.remove(&key).expect("entry just seen");
        drop(directory);
        entry.server.close().await;
        debug!("closed transport server for {component}/{transport_name}");
    }
}

/// Returns the shared transport client for a fully resolved URL, creating
/// it on first use.
pub async fn acquire_client(url: &str) -> Result<Arc<dyn TransportClient>> {
    let mut directory = CLIENT_DIRECTORY.lock().await;
    if let Some(entry) = directory.get_mut(url) {
        entry.active += 1;
        return Ok(entry.client.clone());
    }

    let parsed = EndpointUrl::parse(url)?;
    let factory = {
        let factories = CLIENT_FACTORIES.lock().expect("factory registry poisoned");
        factories
            .get(&parsed.scheme)
            .cloned()
            .ok_or_else(|| {
                Error::Creation(format!(
                    "no client factory for '{}'",
                    parsed.scheme.as_str()
                ))
            })?
    };
    let client = factory.create_client(&parsed).await?;
    directory.insert(
        url.to_string(),
        CountedClient {
            active: 1,
            client: client.clone(),
        },
    );
    debug!("created transport client for {url}");
    Ok(client)
}

/// Releases one use of a shared transport client. The last release removes
/// the directory entry and closes the connection.
pub async fn release_client(url: &str) {
    let mut directory = CLIENT_DIRECTORY.lock().await;
    let Some(entry) = directory.get_mut(url) else {
        warn!("release of unknown transport client {url}");
        return;
    };
    entry.active -= 1;
    if entry.active == 0 {
        let entry = directory.remove(url).expect("entry just seen");
        drop(directory);
        entry.client.close().await;
        debug!("closed transport client for {url}");
    }
}

/// Resolves the `Specified` list for a transport and hands it to the one
/// factory every listed scheme agrees on. Mixing schemes served by
/// different factories is a configuration mistake, not a request to bridge
/// them.
async fn create_server(km_url: &str, transport_key: &str) -> Result<Arc<dyn TransportServer>> {
    let km = Keymaster::new(km_url)?;
    let specified: Vec<String> = km.get_as(&format!("{transport_key}.Specified")).await?;
    if specified.is_empty() {
        return Err(Error::Creation(format!(
            "{transport_key}.Specified lists no transports"
        )));
    }

    let mut urls = Vec::new();
    for text in &specified {
        urls.push(EndpointUrl::parse(text)?);
    }

    let factories: Vec<Arc<dyn ServerFactory>> = {
        let registry = SERVER_FACTORIES.lock().expect("factory registry poisoned");
        let mut found = Vec::new();
        for url in &urls {
            let factory = registry.get(&url.scheme).cloned().ok_or_else(|| {
                Error::Creation(format!(
                    "transport '{}' is not supported",
                    url.scheme.as_str()
                ))
            })?;
            found.push(factory);
        }
        found
    };
    let first = factories[0].clone();
    if !factories.iter().all(|f| Arc::ptr_eq(f, &first)) {
        return Err(Error::Creation(format!(
            "{transport_key}.Specified mixes incompatible transport families"
        )));
    }

    first.create_server(km_url, transport_key, &urls).await
}
