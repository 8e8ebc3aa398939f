//! The socket fabric underneath both the keymaster and the wire transports:
//! multi-frame codec, in-process endpoint registries, request/reply and
//! publish/subscribe endpoints over TCP, Unix sockets and in-process queues.

pub(crate) mod frames;
pub(crate) mod inproc;
pub(crate) mod pubsub;
pub(crate) mod reqrep;
