//! Server error types.
//!
//! Provides strongly-typed errors for server operations: startup
//! (configuration, binding), per-connection processing, and dispatch. The
//! underlying protocol, connection, and admission faults are wrapped rather
//! than flattened so callers can branch on origin.

use std::fmt;

use packline_core::{AdmissionError, ConnectionError};
use packline_proto::ProtocolError;

/// Errors that can occur in the server.
#[derive(Debug)]
pub enum ServerError {
    /// Configuration error (invalid bind address, unreadable config file,
    /// bad whitelist entry, etc.).
    ///
    /// Fatal before startup completes. Fix configuration and restart.
    Config(String),

    /// Transport/network error (bind failure, accept failure, I/O error).
    Transport(String),

    /// Driver asked about a connection id it is not tracking.
    ///
    /// Indicates an event ordering bug between runtime and driver.
    ConnectionNotFound(u64),

    /// A second handler was registered for an opcode.
    ///
    /// At most one handler per opcode; this is a startup bug.
    DuplicateHandler(u16),

    /// Admission subsystem fault.
    Admission(AdmissionError),

    /// Connection lifecycle fault.
    Connection(ConnectionError),

    /// Wire-format fault outside any single connection's stream (e.g.
    /// encoding an outbound packet).
    Protocol(ProtocolError),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration error: {msg}"),
            Self::Transport(msg) => write!(f, "transport error: {msg}"),
            Self::ConnectionNotFound(id) => write!(f, "connection not found: {id}"),
            Self::DuplicateHandler(opcode) => {
                write!(f, "duplicate handler for opcode {opcode:#06x}")
            },
            Self::Admission(err) => write!(f, "admission error: {err}"),
            Self::Connection(err) => write!(f, "connection error: {err}"),
            Self::Protocol(err) => write!(f, "protocol error: {err}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Admission(err) => Some(err),
            Self::Connection(err) => Some(err),
            Self::Protocol(err) => Some(err),
            _ => None,
        }
    }
}

impl From<AdmissionError> for ServerError {
    fn from(err: AdmissionError) -> Self {
        Self::Admission(err)
    }
}

impl From<ConnectionError> for ServerError {
    fn from(err: ConnectionError) -> Self {
        Self::Connection(err)
    }
}

impl From<ProtocolError> for ServerError {
    fn from(err: ProtocolError) -> Self {
        Self::Protocol(err)
    }
}

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}
