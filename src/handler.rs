//! # Handler Capabilities
//!
//! The capability traits an application implements to receive inbound traffic.
//!
//! A [`ConnectionHandler`] covers the app-addressed surface (broadcasts,
//! requests, inbound tunnels, drop notification); a [`TopicHandler`] covers a
//! single subscription. Handlers run on library-owned tasks spawned by the
//! inbound dispatcher — they must not assume any thread affinity, and a slow
//! handler never stalls packet dispatch.

use crate::error::RelayError;
use crate::tunnel::Tunnel;
use async_trait::async_trait;

/// Inbound capability set for a connection.
///
/// Registering a handler at [`Connection::connect`](crate::Connection::connect)
/// advertises to the relay that this client accepts inbound broadcasts,
/// requests and tunnels. Connecting without one tells the relay to route no
/// inbound traffic here.
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    /// A broadcast addressed to this application arrived.
    async fn handle_broadcast(&self, message: Vec<u8>);

    /// A request addressed to this application arrived; the returned bytes
    /// are sent back to the requester as the reply.
    async fn handle_request(&self, request: Vec<u8>) -> Vec<u8>;

    /// A peer opened a tunnel to this application. The handler owns the
    /// tunnel's lifetime; returning without closing leaves it open.
    async fn handle_tunnel(&self, tunnel: Tunnel);

    /// The connection was torn down by a failure (never by a local close).
    /// Invoked exactly once per connection.
    async fn handle_drop(&self, reason: RelayError);
}

/// Per-subscription event capability.
#[async_trait]
pub trait TopicHandler: Send + Sync + 'static {
    /// A publish on the subscribed topic arrived.
    async fn handle_event(&self, event: Vec<u8>);
}
