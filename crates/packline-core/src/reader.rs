//! Incremental packet stream reader.
//!
//! Consumes a byte source that yields arbitrarily fragmented chunks and
//! produces complete packets. The reader is sans-IO and restartable: all
//! state lives in the buffer, so the owning task can suspend between
//! [`PacketReader::push`] calls and resume where it left off. Dropping the
//! reader discards any partial frame.

use bytes::{Buf, BytesMut};
use packline_proto::{Packet, PacketHeader, ProtocolError};

use crate::arena::PayloadArena;

/// Splits a fragmented byte stream into validated packets.
///
/// One reader per connection. Framing faults returned from
/// [`PacketReader::next`] are typed: recoverable faults
/// ([`ProtocolError::is_recoverable`]) have already advanced past the
/// offending frame and the caller may continue; anything else means the
/// stream is desynchronized and the connection must close.
#[derive(Debug)]
pub struct PacketReader {
    buf: BytesMut,
    max_size: usize,
}

impl PacketReader {
    /// Create a reader enforcing the given maximum frame size.
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self { buf: BytesMut::new(), max_size }
    }

    /// Append a received chunk to the frame buffer.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Bytes currently buffered (for backpressure accounting and tests).
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Try to produce the next complete packet.
    ///
    /// Returns `Ok(None)` when more bytes are needed — the caller awaits
    /// the source and calls [`PacketReader::push`] again.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::ShortFrame`] if the length prefix claims fewer
    ///   than 22 bytes (fatal; buffer untouched, connection closes).
    /// - [`ProtocolError::Oversize`] if the prefix exceeds the configured
    ///   maximum (fatal).
    /// - [`ProtocolError::OutOfMemory`] if the payload buffer could not be
    ///   allocated (fatal for this connection, no retry).
    /// - [`ProtocolError::Integrity`] on checksum mismatch. The frame has
    ///   been discarded and the stream is already resynchronized on the
    ///   next length prefix; the connection may continue.
    pub fn next(
        &mut self,
        arena: &PayloadArena,
        now_ms: i64,
    ) -> Result<Option<Packet>, ProtocolError> {
        if self.buf.len() < 2 {
            return Ok(None);
        }

        let length = u16::from_le_bytes([self.buf[0], self.buf[1]]) as usize;

        if length < PacketHeader::SIZE {
            return Err(ProtocolError::ShortFrame { expected: PacketHeader::SIZE, actual: length });
        }
        if length > self.max_size {
            return Err(ProtocolError::Oversize { size: length, max: self.max_size });
        }

        if self.buf.len() < length {
            return Ok(None);
        }

        let payload_len = length - PacketHeader::SIZE;
        let payload_buf = arena.acquire(payload_len)?;

        let result =
            Packet::decode_with_buffer(&self.buf[..length], payload_buf, self.max_size, now_ms);

        // Resync by discarding the frame: both the success path and the
        // recoverable integrity path advance past `length`.
        self.buf.advance(length);

        match result {
            Ok(packet) => {
                if payload_len > arena.heap_alloc_threshold() {
                    arena.track(&packet.payload)?;
                }
                Ok(Some(packet))
            },
            Err(err) => Err(err),
        }
    }
}
