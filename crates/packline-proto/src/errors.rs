//! Error types for the Packline wire format.
//!
//! Every protocol fault is a discriminated value, never a string. Callers
//! branch on the kind to decide disposition: integrity and unknown-opcode
//! faults are recoverable per connection, framing faults are fatal for the
//! connection that produced them.

use thiserror::Error;

/// Result alias for wire-format operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors produced while encoding or decoding packets and payload values.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    /// Frame length field is below the header size, or the buffer ran out
    /// before the claimed length was available.
    #[error("short frame: expected {expected} bytes, got {actual}")]
    ShortFrame {
        /// Bytes the frame claimed or the operation required
        expected: usize,
        /// Bytes actually available
        actual: usize,
    },

    /// Frame length exceeds the configured maximum packet size.
    #[error("oversize frame: {size} bytes exceeds maximum {max}")]
    Oversize {
        /// Claimed frame size
        size: usize,
        /// Configured maximum
        max: usize,
    },

    /// Payload checksum does not match the header checksum.
    ///
    /// The checksum is always recomputed on decode; the wire value is never
    /// trusted for routing.
    #[error("integrity failure: header checksum {expected:#010x}, computed {computed:#010x}")]
    Integrity {
        /// Checksum carried in the header
        expected: u32,
        /// Checksum computed over the received payload
        computed: u32,
    },

    /// No handler is registered for this opcode.
    #[error("unknown opcode {0:#06x}")]
    UnknownOpcode(u16),

    /// A string or sequence exceeds its configured encoding limit.
    #[error("serialization limit: length {len} exceeds maximum {max}")]
    SerializationLimit {
        /// Encoded length requested
        len: usize,
        /// Configured maximum
        max: usize,
    },

    /// No formatter is registered for the requested type.
    #[error("unregistered type: {0}")]
    UnregisteredType(&'static str),

    /// Nullable flag byte was neither 0 (absent) nor 1 (present).
    #[error("invalid nullable flag byte {0:#04x}")]
    InvalidNullable(u8),

    /// String bytes were not valid UTF-8, or a null sentinel appeared where
    /// a non-nullable string was expected.
    #[error("invalid string encoding")]
    InvalidString,

    /// A payload buffer could not be allocated.
    ///
    /// Out of memory is fatal for the connection whose frame needed the
    /// buffer: the frame cannot be materialized, so the connection closes
    /// with no retry. Other connections are unaffected.
    #[error("payload allocation of {size} bytes failed")]
    OutOfMemory {
        /// Bytes requested from the arena
        size: usize,
    },
}

impl ProtocolError {
    /// Returns true if the connection can survive this fault.
    ///
    /// Integrity and unknown-opcode faults drop the offending packet and
    /// continue. Framing faults (short/oversize) desynchronize the stream
    /// and are fatal; formatter faults fail the encode/decode operation.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Integrity { .. } | Self::UnknownOpcode(_))
    }
}
