//! Pooled payload buffers with deferred large-payload reclamation.
//!
//! Packet payloads churn at wire rate, so small buffers are recycled
//! through size-classed free lists instead of hitting the allocator per
//! frame. Payloads above the heap-alloc threshold are allocated directly
//! and *tracked*: the arena keeps a shared reference, and a periodic
//! [`PayloadArena::sweep`] drops every tracked entry whose packet holder has
//! released it.
//!
//! Allocation is fallible: an out-of-memory condition surfaces as
//! [`ProtocolError::OutOfMemory`], a fatal framing fault for the one
//! connection whose frame needed the buffer. The process and every other
//! connection keep running.

use std::sync::Mutex;

use bytes::{Bytes, BytesMut};
use packline_proto::ProtocolError;

/// Pooled buffer size classes, smallest first.
const SIZE_CLASSES: [usize; 4] = [64, 256, 1024, 4096];

/// Maximum buffers retained per size class.
const MAX_POOLED_PER_CLASS: usize = 64;

/// Default payload size above which buffers bypass the pool.
pub const DEFAULT_HEAP_ALLOC_THRESHOLD: usize = 1024;

/// Allocate a buffer through the fallible reservation path.
fn alloc_buffer(size: usize) -> Result<BytesMut, ProtocolError> {
    let mut storage: Vec<u8> = Vec::new();
    storage.try_reserve_exact(size).map_err(|_| ProtocolError::OutOfMemory { size })?;
    Ok(BytesMut::from(Bytes::from(storage)))
}

/// Two-tier payload allocator: size-classed pools below the heap-alloc
/// threshold, direct heap with deferred reclamation above it.
#[derive(Debug)]
pub struct PayloadArena {
    /// One free list per entry of `SIZE_CLASSES`
    pools: Mutex<[Vec<BytesMut>; SIZE_CLASSES.len()]>,
    /// Direct-heap payloads registered for deferred reclamation
    tracked: Mutex<Vec<Bytes>>,
    /// Payload size above which buffers are direct-heap and tracked
    heap_alloc_threshold: usize,
}

impl Default for PayloadArena {
    fn default() -> Self {
        Self::new(DEFAULT_HEAP_ALLOC_THRESHOLD)
    }
}

impl PayloadArena {
    /// Create an arena with the given heap-alloc threshold in bytes.
    #[must_use]
    pub fn new(heap_alloc_threshold: usize) -> Self {
        Self {
            pools: Mutex::new(std::array::from_fn(|_| Vec::new())),
            tracked: Mutex::new(Vec::new()),
            heap_alloc_threshold,
        }
    }

    /// Payload size above which buffers are direct-heap allocated.
    #[must_use]
    pub fn heap_alloc_threshold(&self) -> usize {
        self.heap_alloc_threshold
    }

    fn class_index(size: usize) -> Option<usize> {
        SIZE_CLASSES.iter().position(|&class| size <= class)
    }

    /// Acquire a cleared buffer with capacity for `size` bytes.
    ///
    /// Sizes at or below the heap-alloc threshold come from the pool when a
    /// buffer is available; larger sizes are always fresh heap allocations
    /// that the caller is expected to [`PayloadArena::track`] once frozen
    /// into a packet.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::OutOfMemory`] if the allocator cannot satisfy the
    ///   request. Fatal for the requesting connection only.
    pub fn acquire(&self, size: usize) -> Result<BytesMut, ProtocolError> {
        if size <= self.heap_alloc_threshold {
            if let Some(index) = Self::class_index(size) {
                if let Ok(mut pools) = self.pools.lock() {
                    if let Some(mut buf) = pools[index].pop() {
                        buf.clear();
                        return Ok(buf);
                    }
                }
                return alloc_buffer(SIZE_CLASSES[index]);
            }
        }

        alloc_buffer(size)
    }

    /// Return a released payload to its pool.
    ///
    /// Only uniquely-held pooled-class buffers are recycled; everything else
    /// simply drops. Returns whether the buffer went back to a pool.
    pub fn release(&self, payload: Bytes) -> bool {
        let Ok(buf) = payload.try_into_mut() else {
            return false;
        };

        if buf.capacity() > self.heap_alloc_threshold {
            return false;
        }

        // Largest class the buffer can serve, so pooled capacity never lies.
        let Some(index) = SIZE_CLASSES.iter().rposition(|&class| buf.capacity() >= class) else {
            return false;
        };

        if let Ok(mut pools) = self.pools.lock() {
            if pools[index].len() < MAX_POOLED_PER_CLASS {
                pools[index].push(buf);
                return true;
            }
        }
        false
    }

    /// Register a direct-heap payload for deferred reclamation.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::OutOfMemory`] if the reclamation registry itself
    ///   cannot grow. Fatal for the requesting connection only.
    pub fn track(&self, payload: &Bytes) -> Result<(), ProtocolError> {
        let Ok(mut tracked) = self.tracked.lock() else {
            return Ok(());
        };

        tracked
            .try_reserve(1)
            .map_err(|_| ProtocolError::OutOfMemory { size: payload.len() })?;
        tracked.push(payload.clone());
        Ok(())
    }

    /// Drop tracked payloads whose exclusive holder has released them.
    ///
    /// Returns the number of payloads reclaimed. Idempotent between
    /// releases: entries still shared with a live packet are kept.
    pub fn sweep(&self) -> usize {
        let Ok(mut tracked) = self.tracked.lock() else {
            return 0;
        };

        let before = tracked.len();
        tracked.retain(|payload| !payload.is_unique());
        before - tracked.len()
    }

    /// Number of direct-heap payloads currently registered.
    #[must_use]
    pub fn tracked_len(&self) -> usize {
        self.tracked.lock().map(|t| t.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_buffers_are_pooled() {
        let arena = PayloadArena::default();

        let mut buf = arena.acquire(100).unwrap();
        buf.extend_from_slice(&[7u8; 100]);
        let payload = buf.freeze();

        assert!(arena.release(payload));

        // The recycled buffer comes back cleared with its class capacity.
        let buf = arena.acquire(100).unwrap();
        assert!(buf.is_empty());
        assert!(buf.capacity() >= 100);
    }

    #[test]
    fn shared_payloads_are_not_pooled() {
        let arena = PayloadArena::default();

        let mut buf = arena.acquire(64).unwrap();
        buf.extend_from_slice(b"shared");
        let payload = buf.freeze();
        let clone = payload.clone();

        assert!(!arena.release(payload));
        drop(clone);
    }

    #[test]
    fn large_buffers_bypass_the_pool() {
        let arena = PayloadArena::new(1024);
        let buf = arena.acquire(4096).unwrap();
        assert!(buf.capacity() >= 4096);

        let payload = buf.freeze();
        assert!(!arena.release(payload));
    }

    #[test]
    fn acquired_capacity_covers_the_request() {
        let arena = PayloadArena::default();
        for size in [0usize, 1, 63, 64, 65, 1024, 5000] {
            let buf = arena.acquire(size).unwrap();
            assert!(buf.capacity() >= size, "capacity for {size}");
        }
    }

    #[test]
    fn sweep_reclaims_released_payloads() {
        let arena = PayloadArena::new(64);

        let mut buf = arena.acquire(1000).unwrap();
        buf.extend_from_slice(&[1u8; 1000]);
        let payload = buf.freeze();
        arena.track(&payload).unwrap();

        // Holder still alive: nothing to reclaim.
        assert_eq!(arena.sweep(), 0);
        assert_eq!(arena.tracked_len(), 1);

        drop(payload);
        assert_eq!(arena.sweep(), 1);
        assert_eq!(arena.tracked_len(), 0);

        // Idempotent when nothing was released since the prior sweep.
        assert_eq!(arena.sweep(), 0);
    }
}
