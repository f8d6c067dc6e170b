//! Server configuration.
//!
//! Everything is an explicit record injected into the listener constructor;
//! the server reads no environment variables and keeps no global settings.
//! A TOML file can populate the record, and CLI flags override the file.

use std::time::Duration;

use packline_core::ConnectionConfig;
use packline_proto::DEFAULT_MAX_PACKET_SIZE;
use serde::Deserialize;

use crate::error::ServerError;

/// Complete server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Listener endpoint and capacity
    pub listener: ListenerSettings,
    /// Packet size limits and arena tuning
    pub packet: PacketSettings,
    /// Ban store behavior
    pub admission: AdmissionSettings,
    /// Sliding-window rate limiter criterion
    pub ratelimit: RateLimitSettings,
    /// Per-connection timeouts and tx queue marks
    pub connection: ConnectionSettings,
}

/// `[listener]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ListenerSettings {
    /// Endpoint to bind, e.g. `0.0.0.0:9940`
    pub bind: String,
    /// Maximum concurrent connections
    pub max_connections: usize,
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self { bind: "0.0.0.0:9940".to_owned(), max_connections: 10_000 }
    }
}

/// `[packet]` section.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PacketSettings {
    /// Maximum frame size (header + payload) in bytes
    pub max_size: usize,
    /// Payload size above which the arena allocates directly
    pub heap_alloc_threshold: usize,
}

impl Default for PacketSettings {
    fn default() -> Self {
        Self { max_size: DEFAULT_MAX_PACKET_SIZE, heap_alloc_threshold: 1024 }
    }
}

/// `[admission]` section.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AdmissionSettings {
    /// Default ban duration in minutes
    pub ban_minutes: u64,
    /// Interval between ban-store purges in seconds
    pub purge_interval_seconds: u64,
}

impl Default for AdmissionSettings {
    fn default() -> Self {
        Self { ban_minutes: 15, purge_interval_seconds: 30 }
    }
}

/// `[ratelimit]` section.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitSettings {
    /// Requests admitted per window
    pub max_requests: usize,
    /// Window length in milliseconds
    pub window_ms: u64,
    /// Lockout applied on violation, in seconds
    pub lockout_seconds: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self { max_requests: 20, window_ms: 1_000, lockout_seconds: 60 }
    }
}

/// `[connection]` section.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConnectionSettings {
    /// Idle timeout in seconds (no received bytes)
    pub idle_timeout_seconds: u64,
    /// Tx queue high-water mark in packets
    pub tx_highwater: usize,
    /// Tx queue low-water mark where paused reads resume
    pub tx_lowwater: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self { idle_timeout_seconds: 60, tx_highwater: 64, tx_lowwater: 16 }
    }
}

impl ServerConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// - [`ServerError::Config`] if the file is unreadable, not TOML, or
    ///   contains unrecognized keys.
    pub fn load(path: &str) -> Result<Self, ServerError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ServerError::Config(format!("cannot read '{path}': {e}")))?;

        toml::from_str(&raw).map_err(|e| ServerError::Config(format!("invalid config: {e}")))
    }

    /// Per-connection limits derived from this configuration.
    #[must_use]
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            idle_timeout: Duration::from_secs(self.connection.idle_timeout_seconds),
            tx_highwater: self.connection.tx_highwater,
            tx_lowwater: self.connection.tx_lowwater,
            ..ConnectionConfig::default()
        }
    }

    /// Rate limiter configuration for the admission criterion.
    #[must_use]
    pub fn ratelimit_config(&self) -> packline_core::RateLimitConfig {
        packline_core::RateLimitConfig {
            max_requests: self.ratelimit.max_requests,
            window_ms: self.ratelimit.window_ms,
            lockout_seconds: self.ratelimit.lockout_seconds,
        }
    }
}
