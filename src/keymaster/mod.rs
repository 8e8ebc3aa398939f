//! The coordination service: the server that owns the tree, the client
//! everything else talks through, and the envelope they exchange.

mod client;
mod envelope;
mod server;

pub use client::{KeyCallback, Keymaster};
pub use envelope::Envelope;
pub use server::{KeymasterServer, ServerState};
