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

//! The publishing facades: a typed [`DataSource`] for records with a
//! compile-time shape, and a [`BufferSource`] for records described at run
//! time.
//!
//! A source resolves its transport through the tree: the component's
//! `Sources.<stream>` entry names the transport, the shared transport
//! server comes out of the process-wide directory, and values go out under
//! the stream name as their topic.

use crate::data::buffer::GenericBuffer;
use crate::error::Result;
use crate::keymaster::Keymaster;
use crate::transport::{self, TransportServer};
use log::debug;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::Arc;

struct SourceInner {
    component: String,
    transport_name: String,
    topic: String,
    server: Arc<dyn TransportServer>,
}

async fn bind_source(km_url: &str, component: &str, stream: &str) -> Result<SourceInner> {
    let km = Keymaster::new(km_url)?;
    let transport_name: String = km
        .get_as(&format!("components.{component}.Sources.{stream}"))
        .await?;
    let server = transport::acquire_server(km_url, component, &transport_name).await?;
    debug!("source '{stream}' on {component} uses transport '{transport_name}'");
    Ok(SourceInner {
        component: component.to_string(),
        transport_name,
        topic: stream.to_string(),
        server,
    })
}

impl SourceInner {
    async fn release(self) {
        transport::release_server(&self.component, &self.transport_name).await;
    }
}

/// A typed stream publisher. Values of `T` are serialized and sent under
/// the stream's topic; every sink of the same stream decodes them back.
pub struct DataSource<T> {
    inner: SourceInner,
    _record: PhantomData<fn(&T)>,
}

impl<T: Serialize> DataSource<T> {
    /// Binds the source named `stream` on `component`, creating (or
    /// sharing) the transport server its configuration names.
    pub async fn new(km_url: &str, component: &str, stream: &str) -> Result<DataSource<T>> {
        Ok(DataSource {
            inner: bind_source(km_url, component, stream).await?,
            _record: PhantomData,
        })
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    pub async fn publish(&self, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.inner.server.publish(&self.inner.topic, &bytes).await
    }

    /// Hands the shared transport server back; the last source or sink to
    /// let go closes it.
    pub async fn release(self) {
        self.inner.release().await;
    }
}

/// A publisher for dynamically described records: what travels is the
/// buffer's byte range, exactly as laid out, with no re-encoding.
pub struct BufferSource {
    inner: SourceInner,
}

impl BufferSource {
    pub async fn new(km_url: &str, component: &str, stream: &str) -> Result<BufferSource> {
        Ok(BufferSource {
            inner: bind_source(km_url, component, stream).await?,
        })
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    pub async fn publish(&self, buffer: &GenericBuffer) -> Result<()> {
        self.inner
            .server
            .publish(&self.inner.topic, buffer.data())
            .await
    }

    pub async fn release(self) {
        self.inner.release().await;
    }
}
