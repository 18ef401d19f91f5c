//! Relay handshake: the raw byte exchange that precedes packet framing.
//!
//! The client announces the magic bytes, the protocol version, its application
//! name and whether it accepts inbound traffic (broadcasts, requests and
//! tunnels routed *to* it). The daemon answers with a single status byte:
//! `0x00` acknowledges the registration, anything else is a protocol error
//! code and the connection is unusable.

use crate::config::{MAGIC_BYTES, PROTOCOL_VERSION};
use crate::core::wire;
use crate::error::{constants, RelayError, Result};
use bytes::BytesMut;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, instrument};

/// Status byte the daemon sends for a successful registration.
const STATUS_ACK: u8 = 0x00;

/// Run the client side of the handshake on a freshly connected socket.
#[instrument(skip(stream), fields(app = %app, inbound = accepts_inbound))]
pub(crate) async fn initiate(
    stream: &mut TcpStream,
    app: &str,
    accepts_inbound: bool,
    timeout: Duration,
) -> Result<()> {
    let exchange = async {
        let mut hello = BytesMut::with_capacity(MAGIC_BYTES.len() + 2 + app.len() + 8);
        hello.extend_from_slice(&MAGIC_BYTES);
        hello.extend_from_slice(&[PROTOCOL_VERSION]);
        wire::put_string(&mut hello, app);
        wire::put_bool(&mut hello, accepts_inbound);
        stream.write_all(&hello).await?;
        stream.flush().await?;

        let mut status = [0u8; 1];
        stream.read_exact(&mut status).await?;
        match status[0] {
            STATUS_ACK => {
                debug!("relay acknowledged registration");
                Ok(())
            }
            code => Err(RelayError::Protocol(format!(
                "relay rejected handshake with code {code:#04x}"
            ))),
        }
    };

    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| {
            RelayError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                constants::ERR_HANDSHAKE_TIMEOUT,
            ))
        })?
}
