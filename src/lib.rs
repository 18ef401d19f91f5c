//! # relay-link
//!
//! Client-side binding for a decentralized messaging relay. An application
//! links this crate, opens one logical [`Connection`] to the relay daemon on
//! the local host, and exchanges four classes of traffic with the wider
//! cluster:
//!
//! - **Broadcasts**: one-to-many delivery to every peer of an application
//! - **Requests**: synchronous round trips answered by exactly one peer
//! - **Publish/subscribe**: topic-scoped delivery with per-topic handlers
//! - **Tunnels**: ordered, flow-controlled, bidirectional message channels
//!
//! All traffic is multiplexed over a single loopback socket; a single reader
//! task demultiplexes inbound packets and never executes user code inline.
//!
//! ## Example
//! ```no_run
//! use relay_link::Connection;
//! use std::time::Duration;
//!
//! # async fn example() -> relay_link::Result<()> {
//! let conn = Connection::connect(55555, "echo", None).await?;
//! let reply = conn
//!     .request("echo", b"ping", Duration::from_millis(250))
//!     .await?;
//! assert_eq!(reply, b"ping");
//! conn.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod utils;

mod connection;
mod handler;
mod protocol;
mod tunnel;

pub use config::ClientConfig;
pub use connection::Connection;
pub use error::{RelayError, Result};
pub use handler::{ConnectionHandler, TopicHandler};
pub use tunnel::Tunnel;
