//! Property-based tests for stream reassembly and admission.
//!
//! The stream reader must yield the same packet sequence regardless of how
//! the transport fragments the bytes, and the admission store must uphold
//! its ban invariants for arbitrary request patterns.

use bytes::Bytes;
use packline_core::{
    AdmissionError, AdmissionStore, PacketReader, PayloadArena, RateLimitConfig,
    SlidingWindowLimiter,
};
use packline_proto::{DEFAULT_MAX_PACKET_SIZE, Packet, PacketHeader};
use proptest::prelude::*;
use std::{net::IpAddr, sync::Arc};

const NOW_MS: i64 = 1_722_000_000_321;

fn arbitrary_packet() -> impl Strategy<Value = Packet> {
    (any::<u16>(), any::<u8>(), prop::collection::vec(any::<u8>(), 0..512)).prop_map(
        |(opcode, number, payload)| {
            let mut header = PacketHeader::new(opcode);
            header.set_number(number);
            Packet::new(header, payload, NOW_MS).expect("bounded payload")
        },
    )
}

fn drain(reader: &mut PacketReader, arena: &PayloadArena) -> Vec<Packet> {
    let mut out = Vec::new();
    while let Ok(Some(packet)) = reader.next(arena, NOW_MS) {
        out.push(packet);
    }
    out
}

proptest! {
    /// Any fragmentation of an encoded packet sequence reassembles into the
    /// identical sequence, in order.
    #[test]
    fn reassembly_is_fragmentation_independent(
        packets in prop::collection::vec(arbitrary_packet(), 1..8),
        cuts in prop::collection::vec(1usize..64, 0..32),
    ) {
        let mut wire = Vec::new();
        for packet in &packets {
            packet.encode(&mut wire, DEFAULT_MAX_PACKET_SIZE).expect("should encode");
        }

        let arena = PayloadArena::default();
        let mut reader = PacketReader::new(DEFAULT_MAX_PACKET_SIZE);
        let mut received = Vec::new();

        let mut offset = 0;
        let mut cuts = cuts.into_iter();
        while offset < wire.len() {
            let step = cuts.next().unwrap_or(wire.len()).min(wire.len() - offset);
            reader.push(&wire[offset..offset + step]);
            offset += step;
            received.extend(drain(&mut reader, &arena));
        }

        prop_assert_eq!(received.len(), packets.len());
        for (got, want) in received.iter().zip(&packets) {
            prop_assert_eq!(&got.header, &want.header);
            prop_assert_eq!(&got.payload, &want.payload);
        }
    }

    /// Once a check sets a ban, every subsequent check inside the ban
    /// window is Forbidden, whatever the request spacing.
    #[test]
    fn ban_holds_for_its_window(spacings in prop::collection::vec(0i64..500, 1..20)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("runtime");

        runtime.block_on(async {
            let store = AdmissionStore::new(1);
            let limiter = SlidingWindowLimiter::new(RateLimitConfig {
                max_requests: 1,
                window_ms: 1_000,
                lockout_seconds: 60,
            })
            .expect("valid config");
            store.register_criterion(Arc::new(limiter)).expect("unlocked");

            let addr: IpAddr = "9.9.9.9".parse().expect("addr");

            // First request passes, second violates and bans.
            assert!(store.check(addr, NOW_MS).await.is_ok());
            assert_eq!(
                store.check(addr, NOW_MS + 1).await,
                Err(AdmissionError::Forbidden(addr))
            );

            // One minute of ban: every follow-up inside it is Forbidden.
            let mut at = NOW_MS + 1;
            for spacing in spacings {
                at += spacing;
                assert_eq!(
                    store.check(addr, at).await,
                    Err(AdmissionError::Forbidden(addr)),
                    "check at {at} should still be banned"
                );
            }
        });
    }
}

/// The documented fragment pattern {1, 1, 20, 5} yields exactly one packet.
#[test]
fn documented_fragment_pattern() {
    let mut header = PacketHeader::new(0x0001);
    header.set_number(7);
    let packet = Packet::new(header, Bytes::from_static(b"hello"), NOW_MS).unwrap();

    let mut wire = Vec::new();
    packet.encode(&mut wire, DEFAULT_MAX_PACKET_SIZE).unwrap();
    assert_eq!(wire.len(), 27);

    let arena = PayloadArena::default();
    let mut reader = PacketReader::new(DEFAULT_MAX_PACKET_SIZE);

    let mut produced = Vec::new();
    let mut offset = 0;
    for size in [1usize, 1, 20, 5] {
        reader.push(&wire[offset..offset + size]);
        offset += size;
        produced.extend(drain(&mut reader, &arena));
    }

    assert_eq!(produced.len(), 1);
    assert_eq!(&produced[0].payload[..], b"hello");
    assert_eq!(produced[0].header, packet.header);
}
