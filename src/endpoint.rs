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

//! Endpoint URL handling: scheme parsing, placeholder expansion, publisher
//! derivation and locality ordering.
//!
//! Endpoints take the form `scheme://host:port` (TCP) or `scheme://name`
//! (IPC paths and in-process names), with two placeholder conventions:
//!
//! * `tcp://*:XXXXX` or `tcp://*:*` binds an ephemeral port on every
//!   interface; the advertised URL gets the canonical host name and the port
//!   the OS handed out.
//! * a trailing run of `X` characters on an IPC or in-process name is
//!   replaced with random glyphs of the same length, so several components
//!   can share one configuration stanza without colliding.

use crate::error::{Error, Result};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::fmt;

/// The transport families the fabric knows out of the box.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum TransportScheme {
    Tcp,
    Ipc,
    Inproc,
    RtInproc,
}

impl TransportScheme {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "tcp" => Some(TransportScheme::Tcp),
            "ipc" => Some(TransportScheme::Ipc),
            "inproc" => Some(TransportScheme::Inproc),
            "rtinproc" => Some(TransportScheme::RtInproc),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportScheme::Tcp => "tcp",
            TransportScheme::Ipc => "ipc",
            TransportScheme::Inproc => "inproc",
            TransportScheme::RtInproc => "rtinproc",
        }
    }

    /// Lower ranks are closer to the caller: in-process beats IPC beats TCP.
    fn locality_rank(&self) -> u8 {
        match self {
            TransportScheme::Inproc | TransportScheme::RtInproc => 0,
            TransportScheme::Ipc => 1,
            TransportScheme::Tcp => 2,
        }
    }
}

/// A parsed endpoint URL. `rest` is everything after `scheme://`.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct EndpointUrl {
    pub scheme: TransportScheme,
    pub rest: String,
}

impl EndpointUrl {
    pub fn parse(url: &str) -> Result<Self> {
        let (scheme_part, rest) = url
            .split_once("://")
            .ok_or_else(|| Error::Creation(format!("'{url}' is not an endpoint URL")))?;
        let scheme = TransportScheme::parse(&scheme_part.to_ascii_lowercase())
            .ok_or_else(|| Error::Creation(format!("unrecognized transport in '{url}'")))?;
        if rest.is_empty() {
            return Err(Error::Creation(format!("'{url}' has no address part")));
        }
        Ok(EndpointUrl {
            scheme,
            rest: rest.to_string(),
        })
    }

    /// Splits a TCP `rest` into host and port text.
    pub fn host_port(&self) -> Result<(&str, &str)> {
        self.rest
            .rsplit_once(':')
            .ok_or_else(|| Error::Creation(format!("'{self}' has no port")))
    }

    /// True for `tcp://*:...` forms that must bind on every interface and be
    /// advertised under the canonical host name.
    pub fn wildcard_host(&self) -> bool {
        self.scheme == TransportScheme::Tcp
            && self.host_port().map(|(h, _)| h == "*").unwrap_or(false)
    }

    /// True when the TCP port is a placeholder (`*` or a run of `X`s) and the
    /// OS should pick one.
    pub fn ephemeral_port(&self) -> bool {
        self.scheme == TransportScheme::Tcp
            && self
                .host_port()
                .map(|(_, p)| p == "*" || (!p.is_empty() && p.bytes().all(|b| b == b'X')))
                .unwrap_or(false)
    }

    /// The numeric TCP port, when one was given explicitly.
    pub fn port(&self) -> Result<u16> {
        let (_, port) = self.host_port()?;
        port.parse()
            .map_err(|_| Error::Creation(format!("'{self}' has no usable port")))
    }

    /// Derives the publish-side endpoint for a state endpoint: TCP moves to
    /// state-port + 1, everything else appends `.publisher`.
    pub fn derive_publisher(&self) -> Result<EndpointUrl> {
        match self.scheme {
            TransportScheme::Tcp => {
                let (host, _) = self.host_port()?;
                let port = self.port()?;
                Ok(EndpointUrl {
                    scheme: TransportScheme::Tcp,
                    rest: format!("{host}:{}", port + 1),
                })
            }
            _ => Ok(EndpointUrl {
                scheme: self.scheme,
                rest: format!("{}.publisher", self.rest),
            }),
        }
    }

    /// Replaces a trailing run of `X` glyphs on an IPC or in-process name
    /// with random characters of the same length. TCP placeholders are
    /// resolved at bind time instead, so they pass through untouched.
    pub fn expand_placeholders(&self) -> EndpointUrl {
        if self.scheme == TransportScheme::Tcp {
            return self.clone();
        }
        let trailing = self.rest.bytes().rev().take_while(|&b| b == b'X').count();
        if trailing == 0 {
            return self.clone();
        }
        let stem = &self.rest[..self.rest.len() - trailing];
        EndpointUrl {
            scheme: self.scheme,
            rest: format!("{stem}{}", random_glyphs(trailing)),
        }
    }
}

impl fmt::Display for EndpointUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme.as_str(), self.rest)
    }
}

/// Picks the most local URL out of a resolved endpoint list: in-process over
/// IPC over TCP. Used by the heartbeat, which wants the cheapest possible
/// path to its own server.
pub fn most_local(urls: &[String]) -> Option<String> {
    urls.iter()
        .filter_map(|u| EndpointUrl::parse(u).ok().map(|e| (e.scheme.locality_rank(), u)))
        .min_by_key(|(rank, _)| *rank)
        .map(|(_, u)| u.clone())
}

/// The canonical host name advertised in rewritten TCP URLs. Falls back to
/// `localhost` when the OS will not say.
pub fn canonical_hostname() -> String {
    match hostname::get() {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(e) => {
            log::warn!("unable to obtain canonical hostname ({e}), using 'localhost'");
            "localhost".to_string()
        }
    }
}

/// A run of random alphanumeric glyphs for placeholder expansion.
pub(crate) fn random_glyphs(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
