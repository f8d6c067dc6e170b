//! Packline wire format.
//!
//! The binary protocol spoken on the packet port: a fixed 22-byte Little
//! Endian header with CRC32 payload integrity, a packet codec, and the
//! formatter registry used to encode payload values.
//!
//! Layering:
//!
//! - [`PacketHeader`]: raw binary header, zero-copy parsed
//! - [`Packet`]: header + payload codec, integrity validated on decode
//! - [`wire`]: Little Endian value encoding and the type-indexed
//!   [`wire::FormatterRegistry`]
//!
//! Framing and connection lifecycle live in `packline-core`; this crate is
//! pure data and has no I/O.

pub mod errors;
mod header;
mod packet;
pub mod wire;

pub use errors::ProtocolError;
pub use header::{PacketFlags, PacketHeader};
pub use packet::{DEFAULT_MAX_PACKET_SIZE, Packet};
