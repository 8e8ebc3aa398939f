//! Error kinds surfaced by the coordination and transport layers.

use thiserror::Error;

/// Errors produced by the keymaster, the transport fabric and the data
/// facades.
///
/// The split mirrors how failures propagate: per-request problems travel back
/// to the caller inside a reply envelope and surface here as [`Error::Protocol`]
/// or [`Error::Lookup`]; socket-level problems are reported as
/// [`Error::Transport`] after the offending socket has been discarded; fatal
/// construction problems surface as [`Error::Creation`] or [`Error::Config`].
#[derive(Debug, Error)]
pub enum Error {
    /// A malformed request, unknown verb, or missing argument frame.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A keychain that does not resolve, or a node that does not decode to
    /// the requested type.
    #[error("lookup error: {0}")]
    Lookup(String),

    /// A send/receive failure, a vanished peer, or a closed endpoint. The
    /// socket involved has been torn down and will be rebuilt on next use.
    #[error("transport error: {0}")]
    Transport(String),

    /// A transport could not be created: no factory for the scheme, mixed
    /// incompatible schemes, or a bind failure.
    #[error("creation error: {0}")]
    Creation(String),

    /// The seed document is missing required keys or is internally
    /// inconsistent (e.g. duplicate ports).
    #[error("configuration error: {0}")]
    Config(String),

    /// A bounded wait expired.
    #[error("timed out")]
    Timeout,

    /// A value failed to serialize or deserialize.
    #[error("serialization error: {0}")]
    Serde(String),
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Serde(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serde(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
