//! # Tunnels
//!
//! Reliable, ordered, bidirectional byte-message channels multiplexed on the
//! relay socket, with explicit byte-credit flow control.
//!
//! ## Flow Control
//! Each direction starts with a byte allowance equal to the configured window.
//! Every outbound transfer consumes allowance equal to its payload length; the
//! receive side replenishes a message's full length once the assembled message
//! is enqueued. A message that does not fit the current allowance is split
//! into chunks and streamed as credit arrives: the opening chunk announces the
//! total length (plus one, so the empty message stays representable),
//! continuations carry zero.
//!
//! Because credit only returns when a *complete* message is delivered, a
//! single message may not exceed the window; `send` rejects larger messages up
//! front instead of deadlocking against its own unreplenished allowance.
//!
//! ## Lifecycle
//! ```text
//!           confirm             Send/Recv
//! Opening ──────────▶ Open ──────────────▶ Open
//!    │ timeout         │ close()            │ peer close / drop
//!    ▼                 ▼                    ▼
//!  (freed)          Closed ◀─────────── Closed
//! ```
//! A locally closed tunnel fails `send` and `recv` immediately; a remotely
//! closed tunnel drains already-queued messages before `recv` reports
//! `Closed`.

mod registry;

pub(crate) use registry::TunnelRegistry;

use crate::connection::ConnectionInner;
use crate::core::packet::Packet;
use crate::error::{constants, RelayError, Result};
use crate::utils::timeout::{deadline_after, with_deadline};
use std::pin::pin;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::debug;

/// Why a tunnel stopped accepting traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseCause {
    /// `close()` was called on this side.
    Local,
    /// The peer emitted a close packet.
    Remote,
    /// The owning connection went down.
    Dropped,
}

enum Phase {
    /// Init sent, waiting for the daemon's confirm.
    Opening { confirm: Option<oneshot::Sender<()>> },
    /// Confirmed; `remote_id` addresses the peer end on the wire.
    Open { remote_id: u64 },
    /// Terminal.
    Closed { cause: CloseCause },
}

/// In-progress reassembly of one logical inbound message.
struct Reassembly {
    expect: usize,
    buffer: Vec<u8>,
}

struct TunnelState {
    phase: Phase,
    allowance: u64,
    window: u64,
    assembling: Option<Reassembly>,
    queue_tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

/// State shared between the user-facing [`Tunnel`] handle, the inbound
/// dispatcher and the owning connection's registry.
pub(crate) struct TunnelShared {
    local_id: u64,
    conn: Weak<ConnectionInner>,
    state: Mutex<TunnelState>,
    /// Signalled on every allowance change and on close, waking blocked
    /// senders to recheck.
    allowance_changed: Notify,
    /// Serializes whole-message sends so chunk sequences never interleave.
    /// `tokio::sync::Mutex` acquisition is FIFO, which gives blocked senders
    /// their credit in arrival order.
    send_lock: tokio::sync::Mutex<()>,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl TunnelShared {
    /// State for an initiator-side tunnel awaiting its confirm.
    pub(crate) fn opening(
        local_id: u64,
        window: u64,
        conn: Weak<ConnectionInner>,
    ) -> (Arc<Self>, oneshot::Receiver<()>) {
        let (confirm_tx, confirm_rx) = oneshot::channel();
        let shared = Self::build(
            local_id,
            window,
            conn,
            Phase::Opening {
                confirm: Some(confirm_tx),
            },
        );
        (shared, confirm_rx)
    }

    /// State for an acceptor-side tunnel, open from the start.
    pub(crate) fn accepted(
        local_id: u64,
        remote_id: u64,
        window: u64,
        conn: Weak<ConnectionInner>,
    ) -> Arc<Self> {
        Self::build(local_id, window, conn, Phase::Open { remote_id })
    }

    fn build(local_id: u64, window: u64, conn: Weak<ConnectionInner>, phase: Phase) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            local_id,
            conn,
            state: Mutex::new(TunnelState {
                phase,
                allowance: window,
                window,
                assembling: None,
                queue_tx: Some(queue_tx),
            }),
            allowance_changed: Notify::new(),
            send_lock: tokio::sync::Mutex::new(()),
            inbound: tokio::sync::Mutex::new(queue_rx),
        })
    }

    pub(crate) fn local_id(&self) -> u64 {
        self.local_id
    }

    /// Wrap this state in a user-facing handle.
    pub(crate) fn handle(self: &Arc<Self>) -> Tunnel {
        Tunnel {
            shared: Arc::clone(self),
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, TunnelState> {
        self.state.lock().expect("tunnel state poisoned")
    }

    /// Dispatcher: the daemon confirmed the open; store the remote id and wake
    /// the opener. Duplicate confirms are ignored.
    pub(crate) fn confirm(&self, remote_id: u64) {
        let mut state = self.lock_state();
        let waiting = match &mut state.phase {
            Phase::Opening { confirm } => confirm.take(),
            _ => return,
        };
        state.phase = Phase::Open { remote_id };
        drop(state);
        if let Some(tx) = waiting {
            let _ = tx.send(());
        }
    }

    /// Dispatcher: the peer replenished send credit.
    pub(crate) fn grant(&self, bytes: u64) {
        let mut state = self.lock_state();
        if let Phase::Closed { .. } = state.phase {
            return;
        }
        state.allowance = state.allowance.saturating_add(bytes);
        drop(state);
        self.allowance_changed.notify_waiters();
    }

    /// Dispatcher: one inbound chunk. Returns the allowance to replenish when
    /// the chunk completed a logical message.
    pub(crate) fn ingest(&self, size: u64, payload: Vec<u8>) -> Result<Option<u64>> {
        let mut state = self.lock_state();
        if let Phase::Closed { .. } = state.phase {
            // In-flight data may trail a close; nothing left to deliver it to.
            return Ok(None);
        }
        if size > 0 {
            let expect = (size - 1) as usize;
            if payload.len() > expect {
                return Err(RelayError::Protocol(constants::ERR_CHUNK_OVERFLOW.into()));
            }
            let mut buffer = payload;
            buffer.reserve_exact(expect - buffer.len());
            state.assembling = Some(Reassembly { expect, buffer });
        } else {
            let Some(assembly) = state.assembling.as_mut() else {
                return Err(RelayError::Protocol(constants::ERR_ORPHAN_CHUNK.into()));
            };
            if assembly.buffer.len() + payload.len() > assembly.expect {
                return Err(RelayError::Protocol(constants::ERR_CHUNK_OVERFLOW.into()));
            }
            assembly.buffer.extend_from_slice(&payload);
        }

        let complete = state
            .assembling
            .as_ref()
            .is_some_and(|a| a.buffer.len() == a.expect);
        if !complete {
            return Ok(None);
        }
        let assembly = state.assembling.take().expect("assembly checked above");
        let grant = assembly.expect as u64;
        if let Some(tx) = &state.queue_tx {
            let _ = tx.send(assembly.buffer);
        }
        Ok(Some(grant))
    }

    /// The wire id for addressing the peer end, once open.
    pub(crate) fn remote_id(&self) -> Option<u64> {
        match self.lock_state().phase {
            Phase::Open { remote_id } => Some(remote_id),
            _ => None,
        }
    }

    /// Terminal transition without wire traffic: peer close or connection
    /// drop. Wakes blocked senders and lets receivers drain (remote close) or
    /// fail (drop).
    pub(crate) fn shutdown(&self, cause: CloseCause) {
        let mut state = self.lock_state();
        if let Phase::Closed { .. } = state.phase {
            return;
        }
        state.phase = Phase::Closed { cause };
        state.queue_tx = None;
        state.assembling = None;
        drop(state);
        self.allowance_changed.notify_waiters();
    }
}

/// A bidirectional ordered byte-message channel to one peer.
///
/// Handles are cheap to clone; all clones refer to the same tunnel. Created by
/// [`Connection::tunnel`](crate::Connection::tunnel) on the initiating side or
/// handed to [`ConnectionHandler::handle_tunnel`](crate::ConnectionHandler::handle_tunnel)
/// on the accepting side.
#[derive(Clone)]
pub struct Tunnel {
    shared: Arc<TunnelShared>,
}

impl Tunnel {
    /// Send one logical message, blocking while flow-control credit is
    /// exhausted. `None` waits indefinitely.
    ///
    /// A deadline that expires after part of the message was already on the
    /// wire closes the tunnel: the peer's reassembly cannot be rewound.
    pub async fn send(&self, message: &[u8], timeout: Option<Duration>) -> Result<()> {
        let deadline = deadline_after(timeout);
        let _serial = with_deadline(deadline, self.shared.send_lock.lock()).await?;

        let remote_id = {
            let state = self.shared.lock_state();
            match state.phase {
                Phase::Open { remote_id } => {
                    if message.len() as u64 > state.window {
                        return Err(RelayError::Protocol(
                            constants::ERR_MESSAGE_OVER_WINDOW.into(),
                        ));
                    }
                    remote_id
                }
                _ => return Err(RelayError::Closed),
            }
        };
        let conn = self.shared.conn.upgrade().ok_or(RelayError::Closed)?;

        let total = message.len();
        let mut offset = 0usize;
        let mut opening = true;
        while opening || offset < total {
            let take = match self.reserve_allowance(total - offset, deadline).await {
                Ok(take) => take,
                Err(err) => {
                    if !opening && err.is_timeout() {
                        // The message is half on the wire; the stream can no
                        // longer frame correctly.
                        debug!(tunnel = self.shared.local_id, "send deadline expired mid-message, closing tunnel");
                        let _ = self.close().await;
                    }
                    return Err(err);
                }
            };
            let end = offset + take;
            let size = if opening { total as u64 + 1 } else { 0 };
            conn.send_packet(Packet::TunnelTransfer {
                id: remote_id,
                size,
                payload: message[offset..end].to_vec(),
            })
            .await?;
            opening = false;
            offset = end;
        }
        Ok(())
    }

    /// Receive the next logical message. `None` waits indefinitely; an expired
    /// deadline returns [`RelayError::Timeout`]. After a remote close, queued
    /// messages drain before `Closed` is reported.
    pub async fn recv(&self, timeout: Option<Duration>) -> Result<Vec<u8>> {
        let deadline = deadline_after(timeout);
        {
            let state = self.shared.lock_state();
            if let Phase::Closed {
                cause: CloseCause::Local | CloseCause::Dropped,
            } = state.phase
            {
                return Err(RelayError::Closed);
            }
        }
        let mut rx = with_deadline(deadline, self.shared.inbound.lock()).await?;
        match with_deadline(deadline, rx.recv()).await? {
            Some(message) => Ok(message),
            None => Err(RelayError::Closed),
        }
    }

    /// Close the tunnel: notify the peer (best effort), cancel blocked senders
    /// and receivers, and release the local id. Returns `Closed` when already
    /// closed.
    pub async fn close(&self) -> Result<()> {
        let remote = {
            let mut state = self.shared.lock_state();
            if let Phase::Closed { .. } = state.phase {
                return Err(RelayError::Closed);
            }
            let remote = match state.phase {
                Phase::Open { remote_id } => Some(remote_id),
                _ => None,
            };
            state.phase = Phase::Closed {
                cause: CloseCause::Local,
            };
            state.queue_tx = None;
            state.assembling = None;
            remote
        };
        self.shared.allowance_changed.notify_waiters();

        if let Some(conn) = self.shared.conn.upgrade() {
            if let Some(remote_id) = remote {
                let _ = conn.send_packet(Packet::TunnelClose { id: remote_id }).await;
            }
            conn.deregister_tunnel(self.shared.local_id);
        }
        Ok(())
    }

    /// Take up to `remaining` bytes of send allowance, blocking until credit
    /// arrives or the deadline expires. Returns 0 only for empty messages.
    async fn reserve_allowance(
        &self,
        remaining: usize,
        deadline: Option<tokio::time::Instant>,
    ) -> Result<usize> {
        if remaining == 0 {
            return Ok(0);
        }
        loop {
            let mut notified = pin!(self.shared.allowance_changed.notified());
            // Register before checking so a grant racing with the check cannot
            // be missed.
            notified.as_mut().enable();
            {
                let mut state = self.shared.lock_state();
                if let Phase::Closed { .. } = state.phase {
                    return Err(RelayError::Closed);
                }
                if state.allowance > 0 {
                    let take = state.allowance.min(remaining as u64);
                    state.allowance -= take;
                    return Ok(take as usize);
                }
            }
            with_deadline(deadline, notified).await?;
        }
    }
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("id", &self.shared.local_id)
            .finish()
    }
}
