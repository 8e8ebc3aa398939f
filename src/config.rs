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

//! Seed-document loading and the keymaster's own configuration stanza.
//!
//! The configuration document is a YAML tree. It seeds the keymaster's state
//! store wholesale; the server itself only interprets the `Keymaster` entry:
//!
//! ```yaml
//! Keymaster:
//!   URLS:
//!     Initial:
//!       - tcp://*:42000
//!       - inproc://km
//!   clone_interval: 1000
//! components:
//!   nettask:
//!     Transports:
//!       A:
//!         Specified: [inproc://nettask.data, tcp://*:XXXXX]
//!     Sources:
//!       Data: A
//! ```

use crate::endpoint::{EndpointUrl, TransportScheme};
use crate::error::{Error, Result};
use crate::tree;
use serde_yaml::Value;
use std::collections::HashSet;
use std::path::Path;

const INITIAL_URLS_KEY: &str = "Keymaster.URLS.Initial";
const CLONE_INTERVAL_KEY: &str = "Keymaster.clone_interval";

/// Fallback re-root cadence when the document gives `clone_interval: 0`.
const DEFAULT_CLONE_INTERVAL: u64 = 1000;

/// Parses a configuration document from a file.
pub fn load_config_file(path: impl AsRef<Path>) -> Result<Value> {
    let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
        Error::Config(format!(
            "could not open config file {}: {e}",
            path.as_ref().display()
        ))
    })?;
    load_config_str(&text)
}

/// Parses a configuration document from text.
pub fn load_config_str(text: &str) -> Result<Value> {
    serde_yaml::from_str(text).map_err(|e| Error::Config(format!("bad config document: {e}")))
}

/// The keymaster server's own settings, extracted and validated from the
/// seed document.
#[derive(Clone, Debug)]
pub(crate) struct ServerSettings {
    /// State endpoints, in document order, plus a synthesized in-process
    /// endpoint when the document specified none (the heartbeat needs one
    /// low-latency channel).
    pub state_urls: Vec<EndpointUrl>,
    /// Publish endpoints derived one-for-one from the *specified* state
    /// endpoints. The synthesized in-process endpoint has no publisher.
    pub pub_urls: Vec<EndpointUrl>,
    pub clone_interval: u64,
}

impl ServerSettings {
    pub fn from_tree(root: &Value) -> Result<Self> {
        let initial = tree::get_node(root, INITIAL_URLS_KEY)
            .map_err(|_| Error::Config(format!("seed document is missing {INITIAL_URLS_KEY}")))?;
        let initial: Vec<String> = serde_yaml::from_value(initial)
            .map_err(|_| Error::Config(format!("{INITIAL_URLS_KEY} must be a list of URLs")))?;
        if initial.is_empty() {
            return Err(Error::Config(format!("{INITIAL_URLS_KEY} is empty")));
        }

        let clone_interval = tree::get_node(root, CLONE_INTERVAL_KEY)
            .ok()
            .map(|node| {
                serde_yaml::from_value::<u64>(node)
                    .map_err(|_| Error::Config(format!("{CLONE_INTERVAL_KEY} must be an integer")))
            })
            .transpose()?
            .ok_or_else(|| Error::Config(format!("seed document is missing {CLONE_INTERVAL_KEY}")))?;
        let clone_interval = if clone_interval == 0 {
            DEFAULT_CLONE_INTERVAL
        } else {
            clone_interval
        };

        let mut state_urls = Vec::new();
        let mut pub_urls = Vec::new();
        for url in &initial {
            let endpoint = EndpointUrl::parse(url).map_err(|e| Error::Config(e.to_string()))?;
            if endpoint.scheme == TransportScheme::RtInproc {
                return Err(Error::Config(format!(
                    "'{url}': the real-time transport cannot carry keymaster state"
                )));
            }
            pub_urls.push(endpoint.derive_publisher().map_err(|e| Error::Config(e.to_string()))?);
            state_urls.push(endpoint);
        }

        check_distinct_ports(&state_urls, &pub_urls)?;

        if !state_urls
            .iter()
            .any(|u| u.scheme == TransportScheme::Inproc)
        {
            state_urls.push(EndpointUrl {
                scheme: TransportScheme::Inproc,
                rest: crate::endpoint::random_glyphs(20),
            });
        }

        Ok(ServerSettings {
            state_urls,
            pub_urls,
            clone_interval,
        })
    }
}

fn check_distinct_ports(state: &[EndpointUrl], publish: &[EndpointUrl]) -> Result<()> {
    let mut seen = HashSet::new();
    for url in state.iter().chain(publish) {
        if url.scheme != TransportScheme::Tcp || url.ephemeral_port() {
            continue;
        }
        let port = url.port().map_err(|e| Error::Config(e.to_string()))?;
        if !seen.insert(port) {
            return Err(Error::Config(format!(
                "port {port} is assigned to more than one endpoint"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{load_config_str, ServerSettings};
    use crate::endpoint::TransportScheme;

    #[test]
    fn extracts_urls_and_clone_interval() {
        let root = load_config_str(
            r#"
Keymaster:
  URLS:
    Initial: ["tcp://*:42000", "inproc://km"]
  clone_interval: 250
"#,
        )
        .unwrap();
        let settings = ServerSettings::from_tree(&root).unwrap();
        assert_eq!(settings.clone_interval, 250);
        assert_eq!(
            settings.state_urls.iter().map(ToString::to_string).collect::<Vec<_>>(),
            vec!["tcp://*:42000", "inproc://km"]
        );
        assert_eq!(
            settings.pub_urls.iter().map(ToString::to_string).collect::<Vec<_>>(),
            vec!["tcp://*:42001", "inproc://km.publisher"]
        );
    }

    #[test]
    fn synthesizes_an_inproc_state_endpoint() {
        let root = load_config_str(
            r#"
Keymaster:
  URLS:
    Initial: ["tcp://*:42000"]
  clone_interval: 1000
"#,
        )
        .unwrap();
        let settings = ServerSettings::from_tree(&root).unwrap();
        assert_eq!(settings.state_urls.len(), 2);
        assert_eq!(settings.state_urls[1].scheme, TransportScheme::Inproc);
        // The synthesized endpoint serves the heartbeat only; no publisher.
        assert_eq!(settings.pub_urls.len(), 1);
    }

    #[test]
    fn missing_required_keys_are_fatal() {
        let no_urls = load_config_str("Keymaster:\n  clone_interval: 10\n").unwrap();
        assert!(ServerSettings::from_tree(&no_urls).is_err());

        let no_interval = load_config_str(
            "Keymaster:\n  URLS:\n    Initial: [\"inproc://km\"]\n",
        )
        .unwrap();
        assert!(ServerSettings::from_tree(&no_interval).is_err());
    }

    #[test]
    fn colliding_ports_are_fatal() {
        let root = load_config_str(
            r#"
Keymaster:
  URLS:
    Initial: ["tcp://*:42000", "tcp://*:42001"]
  clone_interval: 1000
"#,
        )
        .unwrap();
        // 42000's publisher lands on 42001, which is also a state port.
        assert!(ServerSettings::from_tree(&root).is_err());
    }

    #[test]
    fn rtinproc_state_endpoints_are_rejected() {
        let root = load_config_str(
            r#"
Keymaster:
  URLS:
    Initial: ["rtinproc://km"]
  clone_interval: 1000
"#,
        )
        .unwrap();
        assert!(ServerSettings::from_tree(&root).is_err());
    }
}
