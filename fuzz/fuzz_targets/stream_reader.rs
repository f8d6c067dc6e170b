//! Fuzz target for the packet stream reader.
//!
//! Feeds arbitrary chunk sequences through PacketReader, exercising the
//! partial-read and resync paths. The reader must never panic; it either
//! needs more bytes, yields a packet, or reports a typed framing fault.

#![no_main]

use libfuzzer_sys::fuzz_target;
use packline_core::{PacketReader, PayloadArena};
use packline_proto::DEFAULT_MAX_PACKET_SIZE;

fuzz_target!(|chunks: Vec<Vec<u8>>| {
    let arena = PayloadArena::default();
    let mut reader = PacketReader::new(DEFAULT_MAX_PACKET_SIZE);

    for chunk in &chunks {
        reader.push(chunk);
        loop {
            match reader.next(&arena, 1_722_000_000_321) {
                Ok(Some(_packet)) => continue,
                Ok(None) => break,
                // Recoverable faults resync; fatal faults end the stream.
                Err(err) if err.is_recoverable() => continue,
                Err(_) => return,
            }
        }
    }
});
