//! # Inbound Dispatcher
//!
//! The single reader task of a connection: deserializes the packet stream and
//! hands each packet to the component that owns it.
//!
//! Routing rules:
//! - replies complete pending request slots,
//! - broadcasts, requests, publishes and inbound tunnels spawn fresh tasks
//!   for the user handler, so the reader never blocks on user code,
//! - tunnel data and control packets go to the tunnel engine,
//! - a peer close, read error or protocol violation initiates teardown.
//!
//! Packets referencing identifiers that no longer exist (a request that timed
//! out, a tunnel that closed) are discarded: identifiers are monotonic, so a
//! late packet can never alias a newer object.

use crate::connection::ConnectionInner;
use crate::core::codec::PacketCodec;
use crate::core::packet::Packet;
use crate::error::{constants, RelayError, Result};
use crate::tunnel::{CloseCause, TunnelShared};
use futures::stream::SplitStream;
use futures::StreamExt;
use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

/// Read loop body; spawned once per connection.
pub(crate) async fn run(
    inner: Arc<ConnectionInner>,
    mut stream: SplitStream<Framed<TcpStream, PacketCodec>>,
) {
    loop {
        match stream.next().await {
            Some(Ok(Packet::Close)) => {
                debug!(app = %inner.app, "relay sent close");
                finish(&inner, RelayError::Closed);
                return;
            }
            Some(Ok(packet)) => {
                if let Err(err) = dispatch(&inner, packet).await {
                    warn!(app = %inner.app, error = %err, "dropping connection");
                    finish(&inner, err);
                    return;
                }
            }
            Some(Err(err)) => {
                finish(&inner, err);
                return;
            }
            None => {
                finish(
                    &inner,
                    RelayError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        constants::ERR_RELAY_HUNG_UP,
                    )),
                );
                return;
            }
        }
    }
}

/// Tear down with `cause`, unless a local close already started — then the
/// reader is merely catching up and no drop notification is owed.
fn finish(inner: &Arc<ConnectionInner>, cause: RelayError) {
    if inner.closed.load(Ordering::Acquire) {
        inner.shutdown(None);
    } else {
        inner.shutdown(Some(cause));
    }
}

async fn dispatch(inner: &Arc<ConnectionInner>, packet: Packet) -> Result<()> {
    match packet {
        Packet::Reply { id, result } => {
            inner
                .requests
                .complete(id, result.map_err(RelayError::Remote));
            Ok(())
        }

        Packet::Broadcast { message, .. } => {
            match &inner.handler {
                Some(handler) => {
                    let handler = Arc::clone(handler);
                    tokio::spawn(async move { handler.handle_broadcast(message).await });
                }
                None => {
                    warn!(app = %inner.app, "broadcast for a connection without a handler dropped")
                }
            }
            Ok(())
        }

        Packet::Request { id, request, .. } => {
            match &inner.handler {
                Some(handler) => {
                    let handler = Arc::clone(handler);
                    let conn = Arc::clone(inner);
                    tokio::spawn(async move {
                        let reply = handler.handle_request(request).await;
                        let _ = conn
                            .send_packet(Packet::Reply {
                                id,
                                result: Ok(reply),
                            })
                            .await;
                    });
                }
                None => {
                    // The requester gets a remote error instead of a timeout.
                    let _ = inner
                        .send_packet(Packet::Reply {
                            id,
                            result: Err("no request handler registered".to_string()),
                        })
                        .await;
                }
            }
            Ok(())
        }

        Packet::Publish { topic, message } => {
            match inner.subscriptions.lookup(&topic) {
                Some(handler) => {
                    tokio::spawn(async move { handler.handle_event(message).await });
                }
                // Permitted race: the relay may deliver in-flight publishes
                // after a local unsubscribe.
                None => debug!(topic = %topic, "publish for an unsubscribed topic dropped"),
            }
            Ok(())
        }

        Packet::TunnelInit { id: remote_id, .. } => {
            let Some(handler) = &inner.handler else {
                warn!(app = %inner.app, "tunnel init for a connection without a handler dropped");
                return Ok(());
            };
            let local_id = inner.tunnels.allocate_id();
            let shared = TunnelShared::accepted(
                local_id,
                remote_id,
                inner.config.tunnel_window as u64,
                Arc::downgrade(inner),
            );
            inner.tunnels.register(Arc::clone(&shared));
            inner
                .send_packet(Packet::TunnelConfirm {
                    init_id: remote_id,
                    tun_id: local_id,
                })
                .await?;
            let handler = Arc::clone(handler);
            let tunnel = shared.handle();
            tokio::spawn(async move { handler.handle_tunnel(tunnel).await });
            Ok(())
        }

        Packet::TunnelConfirm { init_id, tun_id } => {
            match inner.tunnels.get(init_id) {
                Some(shared) => shared.confirm(tun_id),
                // The opener timed out and freed the slot.
                None => debug!(id = init_id, "confirm for an abandoned tunnel dropped"),
            }
            Ok(())
        }

        Packet::TunnelAllow { id, bytes } => {
            match inner.tunnels.get(id) {
                Some(shared) => shared.grant(bytes),
                None => debug!(id, "allowance for an unknown tunnel dropped"),
            }
            Ok(())
        }

        Packet::TunnelTransfer { id, size, payload } => {
            let Some(shared) = inner.tunnels.get(id) else {
                debug!(id, "transfer for an unknown tunnel dropped");
                return Ok(());
            };
            if let Some(grant) = shared.ingest(size, payload)? {
                if grant > 0 {
                    if let Some(remote) = shared.remote_id() {
                        inner
                            .send_packet(Packet::TunnelAllow {
                                id: remote,
                                bytes: grant,
                            })
                            .await?;
                    }
                }
            }
            Ok(())
        }

        Packet::TunnelClose { id } => {
            match inner.tunnels.remove(id) {
                Some(shared) => shared.shutdown(CloseCause::Remote),
                None => debug!(id, "close for an unknown tunnel dropped"),
            }
            Ok(())
        }

        Packet::Subscribe { .. } | Packet::Unsubscribe { .. } => Err(RelayError::Protocol(
            "daemon sent a client-only packet".to_string(),
        )),

        // Intercepted by the read loop before dispatch.
        Packet::Close => Ok(()),
    }
}
