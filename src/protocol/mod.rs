//! # Protocol Components
//!
//! Session-level machinery on top of the packet codec: the handshake that
//! registers the client with the daemon, the request registry that pairs
//! callers with replies, the subscription table, and the inbound dispatcher
//! that demultiplexes the packet stream.

pub(crate) mod dispatcher;
pub(crate) mod handshake;
pub(crate) mod requests;
pub(crate) mod subscriptions;
