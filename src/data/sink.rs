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

//! The receiving facades: a typed [`DataSink`] and the raw [`BufferSink`].
//!
//! A sink resolves the publishing component's `AsConfigured` URL list
//! through the tree, picks the most local URL it can use, and attaches a
//! callback to the shared transport client for that URL. The callback only
//! enqueues; consuming happens on the caller's schedule through
//! [`DataSink::get`], either from a fixed-capacity queue or from a
//! newest-value-only slot.

use crate::data::buffer::GenericBuffer;
use crate::endpoint::{EndpointUrl, TransportScheme};
use crate::error::{Error, Result};
use crate::keymaster::Keymaster;
use crate::transport::{self, DataCallback, TransportClient};
use bytes::Bytes;
use log::debug;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

/// What a sink does with samples the caller has not consumed yet.
#[derive(Clone, Copy, Debug)]
pub enum SinkPolicy {
    /// Keep up to this many samples; when full, the newest arrival is
    /// dropped.
    Queue(usize),
    /// Keep only the newest sample, silently replacing the previous one.
    Latest,
}

impl Default for SinkPolicy {
    fn default() -> Self {
        SinkPolicy::Queue(10)
    }
}

struct QueueCallback {
    tx: mpsc::Sender<Bytes>,
}

impl DataCallback for QueueCallback {
    fn on_data(&self, topic: &str, data: &[u8]) {
        if self.tx.try_send(Bytes::copy_from_slice(data)).is_err() {
            debug!("sink queue for '{topic}' full, sample dropped");
        }
    }
}

struct LatestCallback {
    tx: watch::Sender<Option<Bytes>>,
}

impl DataCallback for LatestCallback {
    fn on_data(&self, _topic: &str, data: &[u8]) {
        let _ = self.tx.send(Some(Bytes::copy_from_slice(data)));
    }
}

enum Incoming {
    Queue(mpsc::Receiver<Bytes>),
    Latest(watch::Receiver<Option<Bytes>>),
}

struct SinkInner {
    url: String,
    topic: String,
    client: Arc<dyn TransportClient>,
    callback: Arc<dyn DataCallback>,
    incoming: Incoming,
}

async fn connect_sink(
    km_url: &str,
    component: &str,
    stream: &str,
    policy: SinkPolicy,
) -> Result<SinkInner> {
    let km = Keymaster::new(km_url)?;
    let transport_name: String = km
        .get_as(&format!("components.{component}.Sources.{stream}"))
        .await?;
    let urls: Vec<String> = km
        .get_as(&format!(
            "components.{component}.Transports.{transport_name}.AsConfigured"
        ))
        .await?;
    let url = pick_most_local(&urls)?;
    debug!("sink '{stream}' on {component} attaches to {url}");

    let client = transport::acquire_client(&url).await?;
    let (callback, incoming): (Arc<dyn DataCallback>, Incoming) = match policy {
        SinkPolicy::Queue(depth) => {
            let (tx, rx) = mpsc::channel(depth.max(1));
            (Arc::new(QueueCallback { tx }), Incoming::Queue(rx))
        }
        SinkPolicy::Latest => {
            let (tx, rx) = watch::channel(None);
            (Arc::new(LatestCallback { tx }), Incoming::Latest(rx))
        }
    };
    if let Err(e) = client.subscribe(stream, callback.clone()).await {
        transport::release_client(&url).await;
        return Err(e);
    }
    Ok(SinkInner {
        url,
        topic: stream.to_string(),
        client,
        callback,
        incoming,
    })
}

fn pick_most_local(urls: &[String]) -> Result<String> {
    fn rank(scheme: TransportScheme) -> u8 {
        match scheme {
            TransportScheme::RtInproc => 0,
            TransportScheme::Inproc => 1,
            TransportScheme::Ipc => 2,
            TransportScheme::Tcp => 3,
        }
    }
    urls.iter()
        .filter_map(|u| EndpointUrl::parse(u).ok().map(|e| (rank(e.scheme), u)))
        .min_by_key(|(rank, _)| *rank)
        .map(|(_, u)| u.clone())
        .ok_or_else(|| Error::Creation("no usable URL in the AsConfigured list".into()))
}

impl SinkInner {
    async fn next_bytes(&mut self, wait: Duration) -> Result<Bytes> {
        match &mut self.incoming {
            Incoming::Queue(rx) => match timeout(wait, rx.recv()).await {
                Ok(Some(bytes)) => Ok(bytes),
                Ok(None) => Err(Error::Transport(format!("{} has gone away", self.url))),
                Err(_) => Err(Error::Timeout),
            },
            Incoming::Latest(rx) => {
                match timeout(wait, rx.changed()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => {
                        return Err(Error::Transport(format!("{} has gone away", self.url)))
                    }
                    Err(_) => return Err(Error::Timeout),
                }
                rx.borrow_and_update()
                    .clone()
                    .ok_or_else(|| Error::Transport("empty sample slot".into()))
            }
        }
    }

    fn try_next_bytes(&mut self) -> Option<Bytes> {
        match &mut self.incoming {
            Incoming::Queue(rx) => rx.try_recv().ok(),
            Incoming::Latest(rx) => {
                if rx.has_changed().unwrap_or(false) {
                    rx.borrow_and_update().clone()
                } else {
                    None
                }
            }
        }
    }

    async fn release(self) {
        if let Err(e) = self.client.unsubscribe(&self.topic, &self.callback).await {
            debug!("detach from '{}' failed: {e}", self.topic);
        }
        transport::release_client(&self.url).await;
    }
}

/// A typed stream consumer.
pub struct DataSink<T> {
    inner: SinkInner,
    _record: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> DataSink<T> {
    /// Connects to the stream named `stream` on `component` with the
    /// default bounded queue.
    pub async fn connect(km_url: &str, component: &str, stream: &str) -> Result<DataSink<T>> {
        Self::connect_with(km_url, component, stream, SinkPolicy::default()).await
    }

    pub async fn connect_with(
        km_url: &str,
        component: &str,
        stream: &str,
        policy: SinkPolicy,
    ) -> Result<DataSink<T>> {
        Ok(DataSink {
            inner: connect_sink(km_url, component, stream, policy).await?,
            _record: PhantomData,
        })
    }

    /// The URL this sink actually attached to.
    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// The next record, waiting up to `wait` for one to arrive.
    pub async fn get(&mut self, wait: Duration) -> Result<T> {
        let bytes = self.inner.next_bytes(wait).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// A record if one is already waiting; never blocks.
    pub fn try_get(&mut self) -> Result<Option<T>> {
        match self.inner.try_next_bytes() {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Detaches the callback and hands the shared client back; the last
    /// sink on the URL closes the connection.
    pub async fn release(self) {
        self.inner.release().await;
    }
}

/// A consumer for dynamically described records: the received byte range
/// lands in a [`GenericBuffer`] unchanged, to be read through the
/// description's offsets.
pub struct BufferSink {
    inner: SinkInner,
}

impl BufferSink {
    pub async fn connect(km_url: &str, component: &str, stream: &str) -> Result<BufferSink> {
        Self::connect_with(km_url, component, stream, SinkPolicy::default()).await
    }

    pub async fn connect_with(
        km_url: &str,
        component: &str,
        stream: &str,
        policy: SinkPolicy,
    ) -> Result<BufferSink> {
        Ok(BufferSink {
            inner: connect_sink(km_url, component, stream, policy).await?,
        })
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// Fills `buffer` with the next record, resizing it to fit.
    pub async fn get(&mut self, buffer: &mut GenericBuffer, wait: Duration) -> Result<()> {
        let bytes = self.inner.next_bytes(wait).await?;
        buffer.resize(bytes.len());
        buffer.data_mut().copy_from_slice(&bytes);
        Ok(())
    }

    pub async fn release(self) {
        self.inner.release().await;
    }
}
