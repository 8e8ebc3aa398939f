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

//! # lattice
//!
//! `lattice` is a distributed component framework for real-time instrument
//! control and data acquisition. Components are long-lived units of work
//! that expose typed data streams and consume them; a central coordination
//! service, the **keymaster**, owns a hierarchical configuration/state
//! tree that every participant queries, mutates and subscribes to, and acts
//! as the directory through which data transports find each other.
//!
//! Two subsystems make up the crate:
//!
//! * the keymaster: a tree of maps, sequences and scalars served over a
//!   GET/PUT/DEL request/reply protocol, with change notifications fanned
//!   out over publish/subscribe under every prefix of the mutated keychain,
//!   and a once-a-second heartbeat clients watch for liveness;
//! * the transport fabric: pluggable pub/sub families (`tcp`, `ipc`,
//!   `inproc`, and the real-time `rtinproc`) behind factory registries and
//!   use-counted directories, with thin typed [`DataSource`]/[`DataSink`]
//!   facades on top.
//!
//! ## Quick start
//!
//! ```
//! use lattice::{Keymaster, KeymasterServer};
//!
//! let seed = lattice::load_config_str(r#"
//! Keymaster:
//!   URLS:
//!     Initial: ["inproc://km.quickstart"]
//!   clone_interval: 1000
//! components: {}
//! "#).unwrap();
//!
//! tokio::runtime::Runtime::new().unwrap().block_on(async {
//!     let mut server = KeymasterServer::new(seed).unwrap();
//!     server.run().await.unwrap();
//!
//!     let km = Keymaster::new("inproc://km.quickstart").unwrap();
//!     km.put("observatory.scan_id", 42u32, true).await.unwrap();
//!     let scan: u32 = km.get_as("observatory.scan_id").await.unwrap();
//!     assert_eq!(scan, 42);
//!
//!     server.terminate().await;
//! });
//! ```
//!
//! ## Internal architecture map
//!
//! - Coordination: [`keymaster`]: the server owning the tree, the client,
//!   the reply envelope
//! - Tree model: [`tree`] and [`keychain`]: pure operations and dotted
//!   path handling
//! - Wire fabric: framing, in-process registries, request/reply and
//!   publish/subscribe endpoints (internal)
//! - Transport layer: [`transport`]: object traits, scheme factories,
//!   use-counted directories, the socket and real-time families
//! - Data facades: [`data`]: typed sources and sinks, generic buffers and
//!   their layout descriptions
//!
//! ## Observability model
//!
//! The crate logs through the `log` facade and never installs a global
//! logger; binaries and tests pick their own backend (the tests here use
//! `env_logger`).

pub mod config;
pub mod data;
pub mod endpoint;
mod error;
pub mod keychain;
pub mod keymaster;
pub mod transport;
pub mod tree;
mod wire;

pub use config::{load_config_file, load_config_str};
pub use data::{
    read_value, write_value, BufferSink, BufferSource, DataDescription, DataSink, DataSource,
    FieldType, GenericBuffer, SinkPolicy,
};
pub use endpoint::{EndpointUrl, TransportScheme};
pub use error::{Error, Result};
pub use keymaster::{Envelope, KeyCallback, Keymaster, KeymasterServer, ServerState};
pub use transport::{DataCallback, TransportClient, TransportServer};
