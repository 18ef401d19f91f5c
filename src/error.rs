//! # Error Types
//!
//! Error handling for the relay binding.
//!
//! This module defines every failure a caller can observe, from socket-level
//! I/O problems to local bookkeeping errors such as subscribing to the same
//! topic twice.
//!
//! ## Error Categories
//! - **I/O errors**: the relay socket failed mid-operation
//! - **Protocol errors**: the daemon sent something malformed or unexpected
//! - **Timeouts**: an explicit operation deadline expired
//! - **Lifecycle errors**: the connection or tunnel is already closed
//! - **Remote errors**: the answering peer reported a failure for a request
//!
//! Deadline expiry is distinguishable from every other failure through
//! [`RelayError::is_timeout`], so callers can retry on timeout without
//! special-casing the other variants.

use std::io;
use thiserror::Error;

/// Error message constants shared between modules to keep wording consistent
/// on the hot paths.
pub mod constants {
    /// Teardown and lifecycle errors
    pub const ERR_RELAY_HUNG_UP: &str = "relay daemon closed the connection";

    /// Handshake errors
    pub const ERR_HANDSHAKE_TIMEOUT: &str = "relay handshake timed out";

    /// Wire-format errors
    pub const ERR_VARINT_OVERFLOW: &str = "varint does not fit in 64 bits";
    pub const ERR_OVERSIZED_BLOB: &str = "length prefix exceeds maximum payload size";
    pub const ERR_INVALID_BOOL: &str = "boolean byte is neither 0 nor 1";
    pub const ERR_INVALID_UTF8: &str = "string field is not valid UTF-8";

    /// Tunnel errors
    pub const ERR_ORPHAN_CHUNK: &str = "continuation chunk without an open message";
    pub const ERR_CHUNK_OVERFLOW: &str = "chunk exceeds the announced message size";
    pub const ERR_MESSAGE_OVER_WINDOW: &str = "message larger than the tunnel flow-control window";
}

/// The primary error type for all relay operations.
#[derive(Error, Debug)]
pub enum RelayError {
    /// The relay socket failed; the connection transitions to broken and every
    /// outstanding operation is aborted.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The daemon violated the wire protocol (unknown tag, malformed field,
    /// unexpected packet). Dropping the connection is the only recovery.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// An explicit operation deadline expired.
    #[error("operation timed out")]
    Timeout,

    /// The connection or tunnel is already closed, or was torn down while the
    /// operation was in flight.
    #[error("connection or tunnel closed")]
    Closed,

    /// The peer answering a request reported an application-level failure.
    #[error("remote error: {0}")]
    Remote(String),

    /// A subscription for the topic already exists on this connection.
    #[error("already subscribed to topic: {0}")]
    AlreadySubscribed(String),

    /// No subscription for the topic exists on this connection.
    #[error("not subscribed to topic: {0}")]
    NotSubscribed(String),

    /// The supplied client configuration is unusable.
    #[error("configuration error: {0}")]
    Config(String),
}

impl RelayError {
    /// True when the error stems from deadline expiry rather than a real
    /// failure. Covers both the explicit [`RelayError::Timeout`] variant and
    /// timed-out socket operations.
    pub fn is_timeout(&self) -> bool {
        match self {
            RelayError::Timeout => true,
            RelayError::Io(err) => err.kind() == io::ErrorKind::TimedOut,
            _ => false,
        }
    }

    /// True when the connection or tunnel will never become usable again.
    pub fn is_closed(&self) -> bool {
        matches!(self, RelayError::Closed)
    }
}

/// Type alias for Results using RelayError
pub type Result<T> = std::result::Result<T, RelayError>;
