//! The reply envelope carried by every request/reply exchange, and the verb
//! frames that open a request.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;

pub(crate) const VERB_PING: &str = "ping";
pub(crate) const VERB_GET: &str = "GET";
pub(crate) const VERB_PUT: &str = "PUT";
pub(crate) const VERB_DEL: &str = "DEL";
pub(crate) const CREATE_FLAG: &str = "create";

/// What the server answers to `ping`. Any string will do; clients only test
/// that something came back.
pub(crate) const LIVENESS_REPLY: &str = "still ticking";

/// The `{result, err, node}` record every GET/PUT/DEL reply carries. `node`
/// is only present for successful GETs.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Envelope {
    pub result: bool,
    #[serde(default)]
    pub err: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<Value>,
}

impl Envelope {
    pub fn ok() -> Self {
        Envelope {
            result: true,
            err: String::new(),
            node: None,
        }
    }

    pub fn ok_with(node: Value) -> Self {
        Envelope {
            result: true,
            err: String::new(),
            node: Some(node),
        }
    }

    pub fn fail(err: impl Into<String>) -> Self {
        Envelope {
            result: false,
            err: err.into(),
            node: None,
        }
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).map_err(|e| Error::Protocol(format!("bad reply envelope: {e}")))
    }
}
