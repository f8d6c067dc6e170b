//! Bounded per-connection send queue.
//!
//! Wire order equals enqueue order: every outbound packet for a connection
//! goes through this single queue, drained by one writer task. The queue is
//! the backpressure mechanism — capacity is the high-water mark, and a send
//! that cannot reserve a slot before its deadline is a `Backpressure`
//! fault, which closes the connection.

use std::time::Duration;

use packline_core::{ConnectionError, ConnectionState};
use packline_proto::Packet;
use tokio::sync::mpsc;

/// One queue entry.
#[derive(Debug)]
pub enum TxItem {
    /// Encode and write this packet
    Packet(Packet),
    /// Terminal sentinel: flush and stop the writer
    Shutdown,
}

/// Sender half of a connection's tx queue.
#[derive(Debug, Clone)]
pub struct TxQueue {
    tx: mpsc::Sender<TxItem>,
    highwater: usize,
    lowwater: usize,
}

impl TxQueue {
    /// Create a queue with the given water marks. The receiver goes to the
    /// writer task.
    #[must_use]
    pub fn new(highwater: usize, lowwater: usize) -> (Self, mpsc::Receiver<TxItem>) {
        let capacity = highwater.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx, highwater: capacity, lowwater: lowwater.min(capacity) }, rx)
    }

    /// Packets currently queued.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.highwater - self.tx.capacity()
    }

    /// True when the queue is at the high-water mark.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.tx.capacity() == 0
    }

    /// Enqueue a packet, waiting up to `deadline` for a slot.
    ///
    /// # Errors
    ///
    /// - [`ConnectionError::Backpressure`] if no slot frees in time.
    /// - [`ConnectionError::NotOpen`] if the writer has stopped.
    pub async fn send(&self, packet: Packet, deadline: Duration) -> Result<(), ConnectionError> {
        match tokio::time::timeout(deadline, self.tx.reserve()).await {
            Ok(Ok(permit)) => {
                permit.send(TxItem::Packet(packet));
                Ok(())
            },
            Ok(Err(_)) => Err(ConnectionError::NotOpen { state: ConnectionState::Closed }),
            Err(_) => Err(ConnectionError::Backpressure),
        }
    }

    /// Wait until the queue has drained to the low-water mark.
    ///
    /// Called by a paused read task before it resumes. Implemented by
    /// reserving (and immediately releasing) the slots between the marks,
    /// which can only succeed once the writer has drained that far.
    ///
    /// # Errors
    ///
    /// - [`ConnectionError::Backpressure`] if the drain deadline passes.
    pub async fn wait_for_lowwater(&self, deadline: Duration) -> Result<(), ConnectionError> {
        let slots = self.highwater - self.lowwater;
        if slots == 0 {
            return Ok(());
        }

        match tokio::time::timeout(deadline, self.tx.reserve_many(slots)).await {
            Ok(Ok(permits)) => {
                drop(permits);
                Ok(())
            },
            Ok(Err(_)) => Err(ConnectionError::NotOpen { state: ConnectionState::Closed }),
            Err(_) => Err(ConnectionError::Backpressure),
        }
    }

    /// Enqueue the terminal sentinel so the writer flushes and exits.
    ///
    /// Returns `false` if no slot freed before the deadline (the runtime
    /// then aborts the writer instead of draining it).
    pub async fn close(&self, deadline: Duration) -> bool {
        match tokio::time::timeout(deadline, self.tx.reserve()).await {
            Ok(Ok(permit)) => {
                permit.send(TxItem::Shutdown);
                true
            },
            _ => false,
        }
    }
}
