//! # Connection Facade
//!
//! The public operation surface of the binding: one logical connection to the
//! local relay daemon carrying broadcasts, requests, publish/subscribe traffic
//! and tunnels.
//!
//! A [`Connection`] is a cheap-to-clone handle; all clones share one socket,
//! one reader task and one set of registries. Closing any handle closes them
//! all. Every operation fails with [`RelayError::Closed`] once the connection
//! is closed or dropped.

use crate::config::ClientConfig;
use crate::core::codec::PacketCodec;
use crate::core::packet::Packet;
use crate::error::{RelayError, Result};
use crate::handler::{ConnectionHandler, TopicHandler};
use crate::protocol::dispatcher;
use crate::protocol::handshake;
use crate::protocol::requests::RequestRegistry;
use crate::protocol::subscriptions::SubscriptionTable;
use crate::tunnel::{CloseCause, Tunnel, TunnelRegistry, TunnelShared};
use futures::{SinkExt, StreamExt};
use std::io;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, info, instrument, warn};

type PacketSink = futures::stream::SplitSink<Framed<TcpStream, PacketCodec>, Packet>;

/// The write half of the relay socket behind the connection-wide write lock.
/// No two packets ever interleave on the wire; a failed write permanently
/// poisons the transport.
pub(crate) struct PacketWriter {
    sink: tokio::sync::Mutex<PacketSink>,
    poisoned: AtomicBool,
}

impl PacketWriter {
    fn new(sink: PacketSink) -> Self {
        Self {
            sink: tokio::sync::Mutex::new(sink),
            poisoned: AtomicBool::new(false),
        }
    }

    pub(crate) async fn send(&self, packet: Packet) -> Result<()> {
        if self.poisoned.load(Ordering::Acquire) {
            return Err(RelayError::Closed);
        }
        let mut sink = self.sink.lock().await;
        if self.poisoned.load(Ordering::Acquire) {
            return Err(RelayError::Closed);
        }
        match sink.send(packet).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.poisoned.store(true, Ordering::Release);
                Err(err)
            }
        }
    }

    pub(crate) fn poison(&self) {
        self.poisoned.store(true, Ordering::Release);
    }
}

/// State shared by every clone of a [`Connection`], the reader task and all
/// tunnels (through weak references, so the registry never forms a cycle).
pub(crate) struct ConnectionInner {
    pub(crate) app: String,
    pub(crate) config: ClientConfig,
    pub(crate) writer: PacketWriter,
    pub(crate) requests: RequestRegistry,
    pub(crate) subscriptions: SubscriptionTable,
    pub(crate) tunnels: TunnelRegistry,
    pub(crate) handler: Option<Arc<dyn ConnectionHandler>>,
    /// Gate for the public operations; set at the start of a local close and
    /// by teardown.
    pub(crate) closed: AtomicBool,
    /// Ensures the teardown sequence runs exactly once.
    torn_down: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionInner {
    /// Write one packet under the write lock. A transport-level failure tears
    /// the whole connection down before the error is returned.
    pub(crate) async fn send_packet(self: &Arc<Self>, packet: Packet) -> Result<()> {
        match self.writer.send(packet).await {
            Ok(()) => Ok(()),
            Err(err) => {
                if let RelayError::Io(ioe) = &err {
                    let reason = RelayError::Io(io::Error::new(ioe.kind(), ioe.to_string()));
                    self.shutdown(Some(reason));
                }
                Err(err)
            }
        }
    }

    pub(crate) fn deregister_tunnel(&self, id: u64) {
        self.tunnels.remove(id);
    }

    /// Tear the connection down: poison the writer, close every tunnel, clear
    /// subscriptions, stop the reader, then abort every pending request.
    /// `cause` is `None` for a user-initiated close (no drop notification) and
    /// the failure for a reader- or writer-detected drop.
    pub(crate) fn shutdown(self: &Arc<Self>, cause: Option<RelayError>) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.closed.store(true, Ordering::Release);
        self.writer.poison();
        let tunnel_cause = if cause.is_some() {
            CloseCause::Dropped
        } else {
            CloseCause::Local
        };
        for tunnel in self.tunnels.drain() {
            tunnel.shutdown(tunnel_cause);
        }
        self.subscriptions.clear();
        if let Some(reader) = self.reader.lock().expect("reader slot poisoned").take() {
            reader.abort();
        }
        self.requests.abort_all();

        match &cause {
            Some(reason) => warn!(app = %self.app, error = %reason, "connection dropped"),
            None => debug!(app = %self.app, "connection closed"),
        }
        if let Some(reason) = cause {
            if let Some(handler) = &self.handler {
                let handler = Arc::clone(handler);
                tokio::spawn(async move { handler.handle_drop(reason).await });
            }
        }
    }
}

/// A logical connection to the local relay daemon.
///
/// Call [`close`](Connection::close) when done: dropping the last handle
/// without closing leaves the registration with the daemon active until the
/// daemon ends the socket itself.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Connect to the relay daemon listening on `port`, registering under
    /// `app`. Passing a handler advertises that this client accepts inbound
    /// broadcasts, requests and tunnels; `None` registers a send-only client.
    pub async fn connect(
        port: u16,
        app: &str,
        handler: Option<Arc<dyn ConnectionHandler>>,
    ) -> Result<Connection> {
        Self::connect_with(ClientConfig::default(), port, app, handler).await
    }

    /// [`connect`](Connection::connect) with explicit configuration.
    #[instrument(skip(config, handler), fields(app = %app))]
    pub async fn connect_with(
        config: ClientConfig,
        port: u16,
        app: &str,
        handler: Option<Arc<dyn ConnectionHandler>>,
    ) -> Result<Connection> {
        config.validate_strict()?;

        let connect = TcpStream::connect((Ipv4Addr::LOCALHOST, port));
        let mut stream = tokio::time::timeout(config.connect_timeout, connect)
            .await
            .map_err(|_| {
                RelayError::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "connecting to the relay daemon timed out",
                ))
            })??;
        stream.set_nodelay(true)?;

        handshake::initiate(&mut stream, app, handler.is_some(), config.handshake_timeout).await?;

        let framed = Framed::new(stream, PacketCodec::new(config.max_payload));
        let (sink, stream) = framed.split();
        let inner = Arc::new(ConnectionInner {
            app: app.to_string(),
            config,
            writer: PacketWriter::new(sink),
            requests: RequestRegistry::new(),
            subscriptions: SubscriptionTable::new(),
            tunnels: TunnelRegistry::new(),
            handler,
            closed: AtomicBool::new(false),
            torn_down: AtomicBool::new(false),
            reader: Mutex::new(None),
        });
        let reader = tokio::spawn(dispatcher::run(Arc::clone(&inner), stream));
        *inner.reader.lock().expect("reader slot poisoned") = Some(reader);

        info!(app = %inner.app, port, "connected to relay daemon");
        Ok(Connection { inner })
    }

    /// Deliver `message` to every peer registered under `app`. Returns once
    /// the packet is on the wire; delivery is fire-and-forget.
    pub async fn broadcast(&self, app: &str, message: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.inner
            .send_packet(Packet::Broadcast {
                app: app.to_string(),
                message: message.to_vec(),
            })
            .await
    }

    /// Send `request` to one peer of `app` and await its reply. The timeout
    /// also travels to the daemon so the cluster can expire the request.
    pub async fn request(&self, app: &str, request: &[u8], timeout: Duration) -> Result<Vec<u8>> {
        self.ensure_open()?;
        let (id, reply) = self.inner.requests.begin();
        let packet = Packet::Request {
            id,
            app: app.to_string(),
            request: request.to_vec(),
            timeout_ms: timeout.as_millis() as u64,
        };
        if let Err(err) = self.inner.send_packet(packet).await {
            self.inner.requests.cancel(id);
            return Err(err);
        }
        match tokio::time::timeout(timeout, reply).await {
            Ok(Ok(outcome)) => outcome,
            // The registry was torn down before completing the slot.
            Ok(Err(_)) => Err(RelayError::Closed),
            Err(_) => {
                // Removing the slot guards against the late reply: the
                // dispatcher finds nothing to complete and discards it.
                self.inner.requests.cancel(id);
                Err(RelayError::Timeout)
            }
        }
    }

    /// Subscribe to `topic`, delivering matching publishes to `handler`.
    /// Awaits the daemon's acknowledgement of the registration.
    pub async fn subscribe(&self, topic: &str, handler: Arc<dyn TopicHandler>) -> Result<()> {
        self.ensure_open()?;
        self.inner.subscriptions.insert(topic, handler)?;
        let (id, ack) = self.inner.requests.begin();
        let packet = Packet::Subscribe {
            id,
            topic: topic.to_string(),
        };
        if let Err(err) = self.inner.send_packet(packet).await {
            self.inner.requests.cancel(id);
            let _ = self.inner.subscriptions.remove(topic);
            return Err(err);
        }
        match ack.await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(err)) => {
                let _ = self.inner.subscriptions.remove(topic);
                Err(err)
            }
            Err(_) => {
                let _ = self.inner.subscriptions.remove(topic);
                Err(RelayError::Closed)
            }
        }
    }

    /// Drop the subscription for `topic`. The local entry is removed before
    /// the wire round trip, so an event racing the unsubscribe is silently
    /// discarded rather than delivered to a dead handler.
    pub async fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.ensure_open()?;
        self.inner.subscriptions.remove(topic)?;
        let (id, ack) = self.inner.requests.begin();
        let packet = Packet::Unsubscribe {
            id,
            topic: topic.to_string(),
        };
        if let Err(err) = self.inner.send_packet(packet).await {
            self.inner.requests.cancel(id);
            return Err(err);
        }
        match ack.await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(RelayError::Closed),
        }
    }

    /// Publish `message` to every subscriber of `topic`.
    pub async fn publish(&self, topic: &str, message: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.inner
            .send_packet(Packet::Publish {
                topic: topic.to_string(),
                message: message.to_vec(),
            })
            .await
    }

    /// Open a tunnel to one peer of `app`, waiting up to `timeout` for the
    /// open handshake to complete. On expiry the local id slot is freed and a
    /// late confirm is discarded.
    pub async fn tunnel(&self, app: &str, timeout: Duration) -> Result<Tunnel> {
        self.ensure_open()?;
        let id = self.inner.tunnels.allocate_id();
        let (shared, confirm) = TunnelShared::opening(
            id,
            self.inner.config.tunnel_window as u64,
            Arc::downgrade(&self.inner),
        );
        self.inner.tunnels.register(Arc::clone(&shared));

        let packet = Packet::TunnelInit {
            id,
            app: app.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        };
        if let Err(err) = self.inner.send_packet(packet).await {
            self.abandon_opening(id);
            return Err(err);
        }
        match tokio::time::timeout(timeout, confirm).await {
            Ok(Ok(())) => Ok(shared.handle()),
            Ok(Err(_)) => {
                self.abandon_opening(id);
                Err(RelayError::Closed)
            }
            Err(_) => {
                self.abandon_opening(id);
                Err(RelayError::Timeout)
            }
        }
    }

    /// Close the connection: tell the daemon (best effort), then tear down
    /// every pending request, subscription and tunnel. Idempotent in effect;
    /// the second call reports `Closed`.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Err(RelayError::Closed);
        }
        let _ = self.inner.send_packet(Packet::Close).await;
        self.inner.shutdown(None);
        Ok(())
    }

    /// The application name this connection registered under.
    pub fn app(&self) -> &str {
        &self.inner.app
    }

    /// Whether the connection is still usable.
    pub fn is_open(&self) -> bool {
        !self.inner.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(RelayError::Closed);
        }
        Ok(())
    }

    fn abandon_opening(&self, id: u64) {
        if let Some(shared) = self.inner.tunnels.remove(id) {
            shared.shutdown(CloseCause::Local);
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("app", &self.inner.app)
            .field("open", &self.is_open())
            .finish()
    }
}
