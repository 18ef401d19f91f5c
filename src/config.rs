//! # Configuration Management
//!
//! Protocol constants and client configuration for the relay binding.
//!
//! The binding deliberately has a small configuration surface: the relay port,
//! the application name and the handler capabilities are supplied per
//! connection, everything else lives here with defaults that match the relay
//! daemon's own expectations.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment-variable overrides via `from_env()`
//!
//! ## Flow-Control Note
//! The tunnel window is the byte allowance each side starts with. Both ends of
//! a tunnel must run with the same window since the receive side replenishes
//! exactly what a delivered message consumed.

use crate::error::{RelayError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Current supported relay protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Magic bytes opening the relay handshake ("RLNK")
pub const MAGIC_BYTES: [u8; 4] = [0x52, 0x4C, 0x4E, 0x4B];

/// Max allowed payload size for any single wire field (16 MB)
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Default byte allowance granted to each tunnel direction
pub const DEFAULT_TUNNEL_WINDOW: usize = 256 * 1024;

/// Default deadline for establishing the TCP connection to the daemon
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Default deadline for the handshake exchange after the socket is up
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);

/// Client configuration for a relay connection.
///
/// The defaults are correct for a relay daemon on the same host; tests and
/// embedded deployments mostly tweak `tunnel_window`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Deadline for the TCP connect to the daemon
    #[serde(with = "duration_millis")]
    pub connect_timeout: Duration,

    /// Deadline for the magic/version/app-name handshake
    #[serde(with = "duration_millis")]
    pub handshake_timeout: Duration,

    /// Initial byte allowance per tunnel direction
    pub tunnel_window: usize,

    /// Upper bound accepted for any single wire field
    pub max_payload: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            tunnel_window: DEFAULT_TUNNEL_WINDOW,
            max_payload: MAX_PAYLOAD_SIZE,
        }
    }
}

impl ClientConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| RelayError::Config(format!("failed to read config file: {e}")))?;
        Self::from_toml(&contents)
    }

    /// Load configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| RelayError::Config(format!("failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables, starting from defaults
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(ms) = std::env::var("RELAY_LINK_CONNECT_TIMEOUT_MS") {
            if let Ok(val) = ms.parse::<u64>() {
                config.connect_timeout = Duration::from_millis(val);
            }
        }

        if let Ok(ms) = std::env::var("RELAY_LINK_HANDSHAKE_TIMEOUT_MS") {
            if let Ok(val) = ms.parse::<u64>() {
                config.handshake_timeout = Duration::from_millis(val);
            }
        }

        if let Ok(window) = std::env::var("RELAY_LINK_TUNNEL_WINDOW") {
            if let Ok(val) = window.parse::<usize>() {
                config.tunnel_window = val;
            }
        }

        Ok(config)
    }

    /// Validate the configuration for common misconfigurations.
    ///
    /// Returns a list of validation errors. Empty list means the configuration
    /// is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.connect_timeout.as_millis() < 10 {
            errors.push("connect timeout too short (minimum: 10ms)".to_string());
        }

        if self.handshake_timeout.as_millis() < 10 {
            errors.push("handshake timeout too short (minimum: 10ms)".to_string());
        }

        if self.tunnel_window == 0 {
            errors.push("tunnel window must be greater than 0".to_string());
        } else if self.tunnel_window > self.max_payload {
            errors.push(format!(
                "tunnel window ({}) exceeds max payload size ({})",
                self.tunnel_window, self.max_payload
            ));
        }

        if self.max_payload == 0 {
            errors.push("max payload must be greater than 0".to_string());
        } else if self.max_payload > MAX_PAYLOAD_SIZE {
            errors.push(format!(
                "max payload {} exceeds protocol limit {}",
                self.max_payload, MAX_PAYLOAD_SIZE
            ));
        }

        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(RelayError::Config(format!(
                "configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Serde helper serializing `Duration` as integer milliseconds, matching the
/// millisecond resolution the operation deadlines use.
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
