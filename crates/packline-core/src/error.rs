//! Error types for the Packline core.
//!
//! Strongly-typed errors for the two lifecycle layers: connection faults
//! (state violations, timeouts, backpressure) and admission faults (bans,
//! lock discipline, address parsing). Protocol faults from the wire layer
//! pass through as [`packline_proto::ProtocolError`].

use std::{net::IpAddr, time::Duration};

use packline_proto::ProtocolError;
use thiserror::Error;

use crate::connection::ConnectionState;

/// Errors that can occur during connection state machine operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// Operation requires an Open connection.
    #[error("connection is {state:?}, cannot send")]
    NotOpen {
        /// State the connection was in
        state: ConnectionState,
    },

    /// Connection idle timeout exceeded.
    #[error("idle timeout after {elapsed:?}")]
    IdleTimeout {
        /// How long the connection was idle
        elapsed: Duration,
    },

    /// Tx queue stayed above the high-water mark past the drain deadline.
    #[error("tx queue full past drain deadline")]
    Backpressure,

    /// Wire-format fault on this connection's stream.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The bound cipher rejected a payload.
    #[error("cipher failure: {0}")]
    Cipher(String),
}

/// Errors from the IP admission subsystem.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    /// Admission rejected the address; the connection is refused
    /// immediately.
    #[error("address {0} is forbidden")]
    Forbidden(IpAddr),

    /// Criterion registration attempted after the store locked.
    ///
    /// The store locks at its first `check`; registering later is a startup
    /// ordering bug and fatal.
    #[error("admission store is locked; register criteria before start")]
    Locked,

    /// Whitelist entry could not be parsed as an address or CIDR block.
    #[error("invalid address or CIDR notation: {0}")]
    InvalidAddress(String),

    /// Rate limiter configuration violates its invariants.
    #[error("invalid rate limit configuration: {0}")]
    InvalidConfig(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = ConnectionError::NotOpen { state: ConnectionState::Closed };
        assert_eq!(err.to_string(), "connection is Closed, cannot send");

        let err = AdmissionError::Forbidden("10.1.2.3".parse().unwrap());
        assert_eq!(err.to_string(), "address 10.1.2.3 is forbidden");
    }

    #[test]
    fn protocol_errors_convert() {
        let err: ConnectionError = ProtocolError::UnknownOpcode(7).into();
        assert!(matches!(err, ConnectionError::Protocol(ProtocolError::UnknownOpcode(7))));
    }
}
