//! Packet type combining header and payload.
//!
//! A `Packet` is one length-prefixed unit on the wire: a 22-byte raw binary
//! header followed by an arbitrary payload bounded by the configured maximum
//! packet size. The codec here is the single place where integrity is
//! decided: the checksum is recomputed over the received payload on every
//! decode and compared against the header before a packet exists at all.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    PacketHeader,
    errors::{ProtocolError, Result},
};

/// Default maximum frame size (header + payload) in bytes.
///
/// The `length` field is a u16, so the hard ceiling is 65535; deployments
/// typically configure far below that.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 32 * 1024;

/// Complete protocol packet.
///
/// Layout on the wire:
/// `[PacketHeader: 22 bytes, raw binary] + [payload: variable bytes]`
///
/// # Invariants
///
/// - `header.length() == 22 + payload.len()` for any packet produced by
///   [`Packet::new`] or [`Packet::decode`].
/// - `header.checksum() == CRC32(payload)` likewise; [`Packet::decode`]
///   rejects frames where the recomputed CRC disagrees with the header.
/// - Zero `timestamp` and `number` values are normalized at construction
///   (`timestamp` to the current Unix milliseconds, then `number` to
///   `timestamp mod 256`).
///
/// The payload is immutable after construction (`Bytes`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Packet header (22 bytes)
    pub header: PacketHeader,

    /// Raw payload bytes
    pub payload: Bytes,
}

impl Packet {
    /// Create a new packet, computing length and checksum.
    ///
    /// Applies the construction normalizations: a zero `timestamp` becomes
    /// `now_ms`, and a zero `number` becomes `timestamp mod 256`.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::Oversize`] if `22 + payload.len()` exceeds the u16
    ///   length field. The configured maximum is enforced at encode time.
    pub fn new(mut header: PacketHeader, payload: impl Into<Bytes>, now_ms: i64) -> Result<Self> {
        let payload = payload.into();

        let total = PacketHeader::SIZE + payload.len();
        let Ok(length) = u16::try_from(total) else {
            return Err(ProtocolError::Oversize { size: total, max: u16::MAX as usize });
        };

        header.set_length(length);
        header.set_checksum(crc32fast::hash(&payload));

        if header.timestamp() == 0 {
            header.set_timestamp(now_ms);
        }
        if header.number() == 0 {
            header.set_number(header.timestamp().rem_euclid(256) as u8);
        }

        Ok(Self { header, payload })
    }

    /// Construct a reply correlated with this packet.
    ///
    /// Copies `opcode`, `number`, `kind`, and `priority` from the request so
    /// the peer can match the response; length, checksum, and timestamp are
    /// computed for the new payload.
    pub fn reply(&self, payload: impl Into<Bytes>, now_ms: i64) -> Result<Self> {
        let mut header = PacketHeader::new(self.header.opcode());
        header.set_number(self.header.number());
        header.set_kind(self.header.kind());
        header.set_priority(self.header.priority());
        Self::new(header, payload, now_ms)
    }

    /// Total frame length (header + payload) of this packet.
    #[must_use]
    pub fn frame_len(&self) -> usize {
        PacketHeader::SIZE + self.payload.len()
    }

    /// Encode the packet into a buffer.
    ///
    /// Writes the 22-byte header followed by the payload. Length is always
    /// recomputed; the checksum is computed here only when it was omitted at
    /// construction (zero), so a deliberately corrupted checksum still hits
    /// the wire as-is for tests and fuzzing.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::Oversize`] if the frame exceeds `max_size`.
    pub fn encode(&self, dst: &mut impl BufMut, max_size: usize) -> Result<()> {
        let total = self.frame_len();
        if total > max_size || total > u16::MAX as usize {
            return Err(ProtocolError::Oversize { size: total, max: max_size });
        }

        let mut header = self.header;
        header.set_length(total as u16);
        if header.checksum() == 0 {
            header.set_checksum(crc32fast::hash(&self.payload));
        }

        dst.put_slice(&header.to_bytes());
        dst.put_slice(&self.payload);

        Ok(())
    }

    /// Decode a packet from wire bytes.
    ///
    /// Validation order mirrors the framing rules:
    ///
    /// 1. Header prefix cast; `length < 22` fails
    ///    [`ProtocolError::ShortFrame`].
    /// 2. `length > max_size` fails [`ProtocolError::Oversize`].
    /// 3. Fewer buffered bytes than `length` fails
    ///    [`ProtocolError::ShortFrame`].
    /// 4. CRC32 recomputed over `bytes[22..length]`; mismatch fails
    ///    [`ProtocolError::Integrity`]. The wire checksum is never trusted.
    ///
    /// Trailing bytes beyond `length` are ignored; the stream reader owns
    /// buffer advancement.
    pub fn decode(bytes: &[u8], max_size: usize, now_ms: i64) -> Result<Self> {
        Self::decode_with_buffer(bytes, BytesMut::new(), max_size, now_ms)
    }

    /// Decode a packet, copying the payload into a caller-provided buffer.
    ///
    /// This is the arena integration point: the stream reader passes a
    /// pooled buffer so payload storage is reused across packets. Behaves
    /// exactly like [`Packet::decode`] otherwise.
    pub fn decode_with_buffer(
        bytes: &[u8],
        mut payload_buf: BytesMut,
        max_size: usize,
        now_ms: i64,
    ) -> Result<Self> {
        let header = PacketHeader::from_bytes(bytes)?;
        let length = header.length() as usize;

        if length > max_size {
            return Err(ProtocolError::Oversize { size: length, max: max_size });
        }

        if bytes.len() < length {
            return Err(ProtocolError::ShortFrame { expected: length, actual: bytes.len() });
        }

        // INVARIANT: 22 <= length <= bytes.len() after the checks above, so
        // this slice cannot panic.
        let payload_bytes = &bytes[PacketHeader::SIZE..length];

        let computed = crc32fast::hash(payload_bytes);
        if computed != header.checksum() {
            return Err(ProtocolError::Integrity { expected: header.checksum(), computed });
        }

        payload_buf.clear();
        payload_buf.extend_from_slice(payload_bytes);

        let mut header = *header;
        if header.timestamp() == 0 {
            header.set_timestamp(now_ms);
        }
        if header.number() == 0 {
            header.set_number(header.timestamp().rem_euclid(256) as u8);
        }

        Ok(Self { header, payload: payload_buf.freeze() })
    }
}
