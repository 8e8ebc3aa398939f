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

//! The real-time in-process transport family (`rtinproc`).
//!
//! For producers and consumers inside one process where the framed wire
//! path would be waste: the server keeps a registry keyed on URL, the
//! client looks the server up directly, and delivery is a plain function
//! call on the producer's thread into each consumer's callback. There are
//! no frames to build and no scheduling gap a sample could fall into, so
//! this is the family to pick when a sink must not miss a publication
//! because the OS looked away.

use crate::endpoint::{EndpointUrl, TransportScheme};
use crate::error::{Error, Result};
use crate::keymaster::Keymaster;
use crate::transport::{
    ClientFactory, DataCallback, ServerFactory, TransportClient, TransportServer,
};
use async_trait::async_trait;
use lazy_static::lazy_static;
use log::debug;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

lazy_static! {
    static ref RT_FABRICS: Mutex<HashMap<String, Arc<RtFabric>>> = Mutex::new(HashMap::new());
}

/// Subscriber table for one real-time server. Callback lists are cloned
/// out before invocation so a callback may subscribe or unsubscribe
/// without deadlocking the fabric.
#[derive(Default)]
struct RtFabric {
    subscribers: Mutex<HashMap<String, Vec<Arc<dyn DataCallback>>>>,
}

impl RtFabric {
    fn attach(&self, topic: &str, callback: Arc<dyn DataCallback>) {
        self.subscribers
            .lock()
            .expect("fabric poisoned")
            .entry(topic.to_string())
            .or_default()
            .push(callback);
    }

    fn detach(&self, topic: &str, callback: &Arc<dyn DataCallback>) {
        let mut subs = self.subscribers.lock().expect("fabric poisoned");
        if let Some(list) = subs.get_mut(topic) {
            list.retain(|cb| !Arc::ptr_eq(cb, callback));
            if list.is_empty() {
                subs.remove(topic);
            }
        }
    }

    fn publish(&self, topic: &str, data: &[u8]) {
        let list = {
            let subs = self.subscribers.lock().expect("fabric poisoned");
            subs.get(topic).cloned()
        };
        if let Some(list) = list {
            for callback in &list {
                callback.on_data(topic, data);
            }
        }
    }
}

pub(crate) struct RtServerFactory;

#[async_trait]
impl ServerFactory for RtServerFactory {
    async fn create_server(
        &self,
        km_url: &str,
        transport_key: &str,
        specified: &[EndpointUrl],
    ) -> Result<Arc<dyn TransportServer>> {
        let fabric = Arc::new(RtFabric::default());
        let mut urls = Vec::new();
        {
            let mut registry = RT_FABRICS.lock().expect("registry poisoned");
            for url in specified {
                if url.scheme != TransportScheme::RtInproc {
                    return Err(Error::Creation(format!(
                        "'{url}' does not belong to the real-time family"
                    )));
                }
                let resolved = url.expand_placeholders().to_string();
                if registry.contains_key(&resolved) {
                    for earlier in &urls {
                        registry.remove(earlier);
                    }
                    return Err(Error::Creation(format!("'{resolved}' is already bound")));
                }
                registry.insert(resolved.clone(), fabric.clone());
                urls.push(resolved);
            }
        }

        let km = Keymaster::new(km_url)?;
        if let Err(e) = km
            .put(&format!("{transport_key}.AsConfigured"), &urls, true)
            .await
        {
            let mut registry = RT_FABRICS.lock().expect("registry poisoned");
            for url in &urls {
                registry.remove(url);
            }
            return Err(e);
        }

        Ok(Arc::new(RtTransportServer {
            km_url: km_url.to_string(),
            transport_key: transport_key.to_string(),
            urls,
            fabric,
        }))
    }
}

/// The publishing side of a real-time stream.
pub struct RtTransportServer {
    km_url: String,
    transport_key: String,
    urls: Vec<String>,
    fabric: Arc<RtFabric>,
}

#[async_trait]
impl TransportServer for RtTransportServer {
    fn as_configured(&self) -> Vec<String> {
        self.urls.clone()
    }

    async fn publish(&self, topic: &str, data: &[u8]) -> Result<()> {
        // Delivery happens right here, on the producer's thread.
        self.fabric.publish(topic, data);
        Ok(())
    }

    async fn close(&self) {
        {
            let mut registry = RT_FABRICS.lock().expect("registry poisoned");
            for url in &self.urls {
                registry.remove(url);
            }
        }
        match Keymaster::new(&self.km_url) {
            Ok(km) => {
                let key = format!("{}.AsConfigured", self.transport_key);
                if let Err(e) = km.del(&key).await {
                    debug!("could not deregister {key}: {e}");
                }
            }
            Err(e) => debug!("could not reach the keymaster during close: {e}"),
        }
    }
}

pub(crate) struct RtClientFactory;

#[async_trait]
impl ClientFactory for RtClientFactory {
    async fn create_client(&self, url: &EndpointUrl) -> Result<Arc<dyn TransportClient>> {
        let full = url.to_string();
        let fabric = RT_FABRICS
            .lock()
            .expect("registry poisoned")
            .get(&full)
            .cloned()
            .ok_or_else(|| Error::Creation(format!("no real-time server at {full}")))?;
        Ok(Arc::new(RtTransportClient {
            url: full,
            fabric,
            attached: Mutex::new(Vec::new()),
        }))
    }
}

/// The subscribing side of a real-time stream: a direct line to the
/// server's fabric.
pub struct RtTransportClient {
    url: String,
    fabric: Arc<RtFabric>,
    attached: Mutex<Vec<(String, Arc<dyn DataCallback>)>>,
}

#[async_trait]
impl TransportClient for RtTransportClient {
    fn url(&self) -> &str {
        &self.url
    }

    async fn subscribe(&self, topic: &str, callback: Arc<dyn DataCallback>) -> Result<()> {
        self.fabric.attach(topic, callback.clone());
        self.attached
            .lock()
            .expect("attachment list poisoned")
            .push((topic.to_string(), callback));
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str, callback: &Arc<dyn DataCallback>) -> Result<()> {
        self.fabric.detach(topic, callback);
        self.attached
            .lock()
            .expect("attachment list poisoned")
            .retain(|(t, cb)| !(t == topic && Arc::ptr_eq(cb, callback)));
        Ok(())
    }

    async fn close(&self) {
        let attached = std::mem::take(
            &mut *self.attached.lock().expect("attachment list poisoned"),
        );
        for (topic, callback) in &attached {
            self.fabric.detach(topic, callback);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::RtFabric;
    use crate::transport::DataCallback;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<Vec<u8>>>,
        count: AtomicUsize,
    }

    impl DataCallback for Recorder {
        fn on_data(&self, _topic: &str, data: &[u8]) {
            self.seen.lock().unwrap().push(data.to_vec());
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn delivery_is_synchronous_on_the_publishing_thread() {
        let fabric = RtFabric::default();
        let recorder = Arc::new(Recorder::default());
        let callback: Arc<dyn DataCallback> = recorder.clone();
        fabric.attach("samples", callback.clone());

        fabric.publish("samples", &[1, 2, 3]);
        // No task or thread in between: the sample is already there.
        assert_eq!(recorder.count.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.seen.lock().unwrap()[0], vec![1, 2, 3]);

        fabric.publish("other", &[9]);
        assert_eq!(recorder.count.load(Ordering::SeqCst), 1);

        fabric.detach("samples", &callback);
        fabric.publish("samples", &[4]);
        assert_eq!(recorder.count.load(Ordering::SeqCst), 1);
    }
}
