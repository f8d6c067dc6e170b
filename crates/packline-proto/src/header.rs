//! Packet header implementation with zero-copy parsing.
//!
//! The `PacketHeader` is a fixed 22-byte structure serialized as raw binary
//! (Little Endian). The leading `length` field makes frames self-delimiting,
//! so the stream reader can split a byte stream into frames by peeking two
//! bytes, and the dispatcher can route on `opcode` without touching the
//! payload.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::errors::{ProtocolError, Result};

/// Fixed 22-byte packet header (Little Endian wire order).
///
/// All multi-byte integers are stored in Little Endian format. Fields are
/// stored as raw byte arrays to avoid alignment issues.
///
/// Wire layout, offsets in bytes:
///
/// ```text
/// 0       2       4    5    6     7     8         12         20        22..
/// length  opcode  num  kind flags prio  checksum  timestamp  reserved  payload
/// u16     u16     u8   u8   u8    u8    u32       i64        [u8; 2]
/// ```
///
/// `length` counts the whole frame including this header, so a valid frame
/// always satisfies `length >= 22` and `length == 22 + payload_len`.
///
/// # Security
///
/// The `#[repr(C, packed)]` layout with zerocopy traits ensures this struct
/// can be cast from untrusted network bytes without undefined behavior: all
/// 22-byte patterns are valid. Structural validity does not imply integrity;
/// the checksum is verified separately by the packet codec before dispatch.
#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct PacketHeader {
    /// Total frame bytes including the header (u16 LE)
    pub(crate) length: [u8; 2],
    /// Application routing key (u16 LE)
    opcode: [u8; 2],
    /// Sequence tag; zero at construction is replaced by `timestamp mod 256`
    number: u8,
    /// Payload schema family, opaque to the transport core
    kind: u8,
    /// PacketFlags bitfield
    flags: u8,
    /// Scheduling hint
    priority: u8,
    /// CRC32 of payload bytes (u32 LE)
    pub(crate) checksum: [u8; 4],
    /// Unix milliseconds at construction, server clock (i64 LE)
    timestamp: [u8; 8],
    /// Reserved, zero on the wire
    reserved: [u8; 2],
}

impl PacketHeader {
    /// Size of the serialized header (22 bytes).
    pub const SIZE: usize = 22;

    /// Create a new header with the specified opcode.
    ///
    /// All other fields start zeroed; `length`, `checksum`, `number`, and
    /// `timestamp` are filled in by packet construction.
    #[must_use]
    pub fn new(opcode: u16) -> Self {
        Self {
            length: (Self::SIZE as u16).to_le_bytes(),
            opcode: opcode.to_le_bytes(),
            number: 0,
            kind: 0,
            flags: 0,
            priority: 0,
            checksum: [0; 4],
            timestamp: [0; 8],
            reserved: [0; 2],
        }
    }

    /// Parse a header from network bytes (zero-copy, safe).
    ///
    /// Casts the buffer prefix directly to a `PacketHeader` reference using
    /// compile-time layout verification from `zerocopy`. No data is copied.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::ShortFrame`] if the buffer holds fewer than 22
    ///   bytes, or the `length` field claims fewer than 22 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        let header = Self::ref_from_prefix(bytes)
            .map_err(|_| ProtocolError::ShortFrame { expected: Self::SIZE, actual: bytes.len() })?
            .0;

        if (header.length() as usize) < Self::SIZE {
            return Err(ProtocolError::ShortFrame {
                expected: Self::SIZE,
                actual: header.length() as usize,
            });
        }

        Ok(header)
    }

    /// Serialize the header to bytes (zero-copy).
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let bytes = IntoBytes::as_bytes(self);
        let mut arr = [0u8; Self::SIZE];
        arr.copy_from_slice(bytes);
        arr
    }

    /// Total frame length including the header.
    #[must_use]
    pub fn length(&self) -> u16 {
        u16::from_le_bytes(self.length)
    }

    /// Application routing key.
    #[must_use]
    pub fn opcode(&self) -> u16 {
        u16::from_le_bytes(self.opcode)
    }

    /// Sequence tag.
    #[must_use]
    pub fn number(&self) -> u8 {
        self.number
    }

    /// Payload schema family. Opaque to the transport core.
    #[must_use]
    pub fn kind(&self) -> u8 {
        self.kind
    }

    /// Packet processing flags (compression, encryption).
    #[must_use]
    pub fn flags(&self) -> PacketFlags {
        PacketFlags::from_byte(self.flags)
    }

    /// Scheduling hint.
    #[must_use]
    pub fn priority(&self) -> u8 {
        self.priority
    }

    /// CRC32 over payload bytes, as carried in the header.
    #[must_use]
    pub fn checksum(&self) -> u32 {
        u32::from_le_bytes(self.checksum)
    }

    /// Unix milliseconds at packet construction (server clock).
    #[must_use]
    pub fn timestamp(&self) -> i64 {
        i64::from_le_bytes(self.timestamp)
    }

    /// Payload length implied by the frame length.
    #[must_use]
    pub fn payload_len(&self) -> usize {
        (self.length() as usize).saturating_sub(Self::SIZE)
    }

    /// Set the total frame length.
    pub fn set_length(&mut self, length: u16) {
        self.length = length.to_le_bytes();
    }

    /// Set the routing key.
    pub fn set_opcode(&mut self, opcode: u16) {
        self.opcode = opcode.to_le_bytes();
    }

    /// Set the sequence tag.
    pub fn set_number(&mut self, number: u8) {
        self.number = number;
    }

    /// Set the payload schema family.
    pub fn set_kind(&mut self, kind: u8) {
        self.kind = kind;
    }

    /// Set packet processing flags.
    pub fn set_flags(&mut self, flags: PacketFlags) {
        self.flags = flags.to_byte();
    }

    /// Set the scheduling hint.
    pub fn set_priority(&mut self, priority: u8) {
        self.priority = priority;
    }

    /// Set the payload checksum.
    pub fn set_checksum(&mut self, checksum: u32) {
        self.checksum = checksum.to_le_bytes();
    }

    /// Set the construction timestamp.
    pub fn set_timestamp(&mut self, timestamp: i64) {
        self.timestamp = timestamp.to_le_bytes();
    }
}

// Manual Debug implementation (can't derive due to packed repr)
impl std::fmt::Debug for PacketHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketHeader")
            .field("length", &self.length())
            .field("opcode", &format!("{:#06x}", self.opcode()))
            .field("number", &self.number())
            .field("kind", &self.kind())
            .field("flags", &self.flags())
            .field("priority", &self.priority())
            .field("checksum", &format!("{:#010x}", self.checksum()))
            .field("timestamp", &self.timestamp())
            .finish()
    }
}

// Manual PartialEq implementation (can't derive due to packed repr)
impl PartialEq for PacketHeader {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for PacketHeader {}

/// Packet processing flags carried in the header `flags` byte.
///
/// The transport core only transports these; interpretation (decompression,
/// cipher application) happens at the connection boundary or in handlers.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketFlags(u8);

impl PacketFlags {
    /// Payload is compressed.
    pub const COMPRESSED: Self = Self(0b0000_0001);
    /// Payload is encrypted with the connection cipher.
    pub const ENCRYPTED: Self = Self(0b0000_0010);

    /// No flags set.
    #[must_use]
    pub fn empty() -> Self {
        Self(0)
    }

    /// Reconstruct flags from the raw header byte.
    #[must_use]
    pub fn from_byte(byte: u8) -> Self {
        Self(byte)
    }

    /// Raw byte for the header.
    #[must_use]
    pub fn to_byte(self) -> u8 {
        self.0
    }

    /// Check whether every flag in `other` is set.
    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Set the flags in `other`.
    #[must_use]
    pub fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl std::fmt::Debug for PacketFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&str> = Vec::new();
        if self.contains(Self::COMPRESSED) {
            names.push("COMPRESSED");
        }
        if self.contains(Self::ENCRYPTED) {
            names.push("ENCRYPTED");
        }
        write!(f, "PacketFlags({:#04x}: {})", self.0, names.join("|"))
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    impl Arbitrary for PacketHeader {
        type Parameters = ();
        type Strategy = BoxedStrategy<Self>;

        fn arbitrary_with((): Self::Parameters) -> Self::Strategy {
            (
                PacketHeader::SIZE as u16..=u16::MAX, // length
                any::<u16>(),                         // opcode
                any::<u8>(),                          // number
                any::<u8>(),                          // kind
                any::<u8>(),                          // flags
                any::<u8>(),                          // priority
                any::<u32>(),                         // checksum
                any::<i64>(),                         // timestamp
            )
                .prop_map(|(length, opcode, number, kind, flags, priority, checksum, timestamp)| {
                    Self {
                        length: length.to_le_bytes(),
                        opcode: opcode.to_le_bytes(),
                        number,
                        kind,
                        flags,
                        priority,
                        checksum: checksum.to_le_bytes(),
                        timestamp: timestamp.to_le_bytes(),
                        reserved: [0; 2],
                    }
                })
                .boxed()
        }
    }

    #[test]
    fn header_size() {
        assert_eq!(std::mem::size_of::<PacketHeader>(), PacketHeader::SIZE);
        assert_eq!(PacketHeader::SIZE, 22);
    }

    #[test]
    fn field_offsets_are_fixed() {
        let mut header = PacketHeader::new(0x0102);
        header.set_length(0x1B);
        header.set_number(7);
        header.set_kind(3);
        header.set_flags(PacketFlags::ENCRYPTED);
        header.set_priority(9);
        header.set_checksum(0xAABB_CCDD);
        header.set_timestamp(0x0102_0304_0506_0708);

        let bytes = header.to_bytes();
        assert_eq!(&bytes[0..2], &[0x1B, 0x00]);
        assert_eq!(&bytes[2..4], &[0x02, 0x01]);
        assert_eq!(bytes[4], 7);
        assert_eq!(bytes[5], 3);
        assert_eq!(bytes[6], 0x02);
        assert_eq!(bytes[7], 9);
        assert_eq!(&bytes[8..12], &[0xDD, 0xCC, 0xBB, 0xAA]);
        assert_eq!(&bytes[12..20], &[0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&bytes[20..22], &[0x00, 0x00]);
    }

    proptest! {
        #[test]
        fn header_round_trip(header in any::<PacketHeader>()) {
            let bytes = header.to_bytes();
            let parsed = PacketHeader::from_bytes(&bytes).expect("should parse");
            prop_assert_eq!(&header, parsed);
        }
    }

    #[test]
    fn reject_short_buffer() {
        let short_buf = [0u8; 10];
        let result = PacketHeader::from_bytes(&short_buf);
        assert_eq!(result, Err(ProtocolError::ShortFrame { expected: 22, actual: 10 }));
    }

    #[test]
    fn reject_length_below_header_size() {
        let mut buf = [0u8; 22];
        buf[0..2].copy_from_slice(&21u16.to_le_bytes());

        let result = PacketHeader::from_bytes(&buf);
        assert_eq!(result, Err(ProtocolError::ShortFrame { expected: 22, actual: 21 }));
    }

    #[test]
    fn flags_bitfield() {
        let flags = PacketFlags::empty().with(PacketFlags::COMPRESSED);
        assert!(flags.contains(PacketFlags::COMPRESSED));
        assert!(!flags.contains(PacketFlags::ENCRYPTED));
        assert_eq!(flags.to_byte(), 0b0000_0001);

        let both = flags.with(PacketFlags::ENCRYPTED);
        assert!(both.contains(PacketFlags::ENCRYPTED));
        assert_eq!(PacketFlags::from_byte(both.to_byte()), both);
    }
}
