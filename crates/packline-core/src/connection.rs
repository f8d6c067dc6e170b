//! Connection lifecycle state machine.
//!
//! Manages per-client state, idle timeouts, and teardown ordering. Uses the
//! action pattern: methods take time as input and return actions for the
//! runtime to execute. This keeps the state machine pure (no I/O) and makes
//! testing straightforward.
//!
//! # State Machine
//!
//! ```text
//! ┌──────┐ close()/fatal frame/peer EOF ┌─────────┐ tx drained   ┌────────┐
//! │ Open │─────────────────────────────>│ Closing │─────────────>│ Closed │
//! └──────┘                              └─────────┘  or deadline └────────┘
//! ```
//!
//! Transitions are monotone; nothing ever moves backwards.

use std::{
    net::SocketAddr,
    ops::Sub,
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::Bytes;
use packline_proto::{Packet, PacketFlags, ProtocolError};

use crate::{
    cipher::PacketCipher,
    error::ConnectionError,
};

/// Maximum time allowed without any received bytes before the connection is
/// closed.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Time allowed for the tx queue to drain after close before forcing
/// Closed.
pub const DEFAULT_DRAIN_DEADLINE: Duration = Duration::from_secs(5);

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepting reads and writes
    Open,
    /// Draining the tx queue; no new sends
    Closing,
    /// Terminal
    Closed,
}

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Peer closed the stream (EOF)
    PeerClosed,
    /// No bytes received within the idle window
    IdleTimeout,
    /// Fatal framing fault on the stream
    ProtocolViolation(ProtocolError),
    /// Tx queue stayed full past the drain deadline
    Backpressure,
    /// A handler asked for the connection to close
    HandlerRequested(String),
    /// The bound cipher rejected a payload on this stream
    CipherFailure(String),
    /// Listener is at its connection limit
    Overloaded,
    /// Listener is shutting down
    Shutdown,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PeerClosed => write!(f, "peer closed"),
            Self::IdleTimeout => write!(f, "idle timeout"),
            Self::ProtocolViolation(err) => write!(f, "protocol violation: {err}"),
            Self::Backpressure => write!(f, "backpressure"),
            Self::HandlerRequested(reason) => write!(f, "handler requested close: {reason}"),
            Self::CipherFailure(reason) => write!(f, "cipher failure: {reason}"),
            Self::Overloaded => write!(f, "connection limit reached"),
            Self::Shutdown => write!(f, "server shutdown"),
        }
    }
}

/// Actions returned by the connection state machine for the runtime to
/// execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionAction {
    /// Stop the read task and drain the tx queue
    Close {
        /// Reason recorded for the disconnected event
        reason: DisconnectReason,
    },
}

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Idle timeout before disconnecting
    pub idle_timeout: Duration,
    /// Time allowed for tx drain after close
    pub drain_deadline: Duration,
    /// Tx queue high-water mark (packets)
    pub tx_highwater: usize,
    /// Tx queue low-water mark where paused reads resume
    pub tx_lowwater: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            drain_deadline: DEFAULT_DRAIN_DEADLINE,
            tx_highwater: 64,
            tx_lowwater: 16,
        }
    }
}

/// Per-client connection state.
///
/// Owned exclusively by the listener for its lifetime; handlers borrow it
/// through a context value for the duration of one dispatch. Generic over
/// `Instant` so tests drive a virtual clock.
#[derive(Clone)]
pub struct Connection<I = Instant>
where
    I: Copy + Ord + Send + Sync + Sub<Output = Duration>,
{
    id: u64,
    remote_addr: SocketAddr,
    state: ConnectionState,
    config: ConnectionConfig,
    last_activity: I,
    closing_since: Option<I>,
    close_reason: Option<DisconnectReason>,
    cipher: Option<Arc<dyn PacketCipher>>,
}

impl<I> Connection<I>
where
    I: Copy + Ord + Send + Sync + Sub<Output = Duration>,
{
    /// Create a new connection in [`ConnectionState::Open`].
    pub fn new(id: u64, remote_addr: SocketAddr, now: I, config: ConnectionConfig) -> Self {
        Self {
            id,
            remote_addr,
            state: ConnectionState::Open,
            config,
            last_activity: now,
            closing_since: None,
            close_reason: None,
            cipher: None,
        }
    }

    /// Connection id assigned at accept.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Peer address.
    #[must_use]
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Reason recorded by the first close. `None` while Open.
    #[must_use]
    pub fn close_reason(&self) -> Option<&DisconnectReason> {
        self.close_reason.as_ref()
    }

    /// Configured limits for this connection.
    #[must_use]
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Bind a payload cipher. Rebinding replaces the previous capability;
    /// rotation policy is the handler layer's concern.
    pub fn bind_cipher(&mut self, cipher: Arc<dyn PacketCipher>) {
        self.cipher = Some(cipher);
    }

    /// Mark activity (call when bytes arrive).
    pub fn update_activity(&mut self, now: I) {
        self.last_activity = now;
    }

    /// Elapsed idle time, if the idle window is exceeded.
    #[must_use]
    pub fn check_idle(&self, now: I) -> Option<Duration> {
        if self.state != ConnectionState::Open {
            return None;
        }
        let elapsed = now - self.last_activity;
        (elapsed > self.config.idle_timeout).then_some(elapsed)
    }

    /// Verify the connection accepts new sends.
    ///
    /// # Errors
    ///
    /// - [`ConnectionError::NotOpen`] once closing has begun.
    pub fn ensure_open(&self) -> Result<(), ConnectionError> {
        match self.state {
            ConnectionState::Open => Ok(()),
            state => Err(ConnectionError::NotOpen { state }),
        }
    }

    /// Begin teardown. Idempotent: only the first reason is recorded, and
    /// later calls return no actions.
    pub fn close(&mut self, reason: DisconnectReason, now: I) -> Vec<ConnectionAction> {
        if self.state != ConnectionState::Open {
            return Vec::new();
        }

        self.state = ConnectionState::Closing;
        self.closing_since = Some(now);
        self.close_reason = Some(reason.clone());

        vec![ConnectionAction::Close { reason }]
    }

    /// Complete teardown once the tx queue has drained.
    ///
    /// Returns `true` on the Closing → Closed transition; `false` if the
    /// connection was not Closing.
    pub fn finish(&mut self) -> bool {
        if self.state == ConnectionState::Closing {
            self.state = ConnectionState::Closed;
            return true;
        }
        false
    }

    /// Periodic maintenance: idle detection while Open, drain deadline
    /// enforcement while Closing.
    pub fn tick(&mut self, now: I) -> Vec<ConnectionAction> {
        match self.state {
            ConnectionState::Open => {
                if self.check_idle(now).is_some() {
                    return self.close(DisconnectReason::IdleTimeout, now);
                }
                Vec::new()
            },
            ConnectionState::Closing => {
                let deadline_passed = self
                    .closing_since
                    .is_some_and(|since| now - since > self.config.drain_deadline);
                if deadline_passed {
                    self.finish();
                }
                Vec::new()
            },
            ConnectionState::Closed => Vec::new(),
        }
    }

    /// Recover the plaintext payload of a received packet.
    ///
    /// Applies the bound cipher when the ENCRYPTED flag is set. Integrity
    /// was already validated over the wire bytes by the codec.
    ///
    /// # Errors
    ///
    /// - [`ConnectionError::Cipher`] if the flag is set with no cipher
    ///   bound, or decryption fails.
    pub fn open_payload(&self, packet: &Packet) -> Result<Bytes, ConnectionError> {
        if !packet.header.flags().contains(PacketFlags::ENCRYPTED) {
            return Ok(packet.payload.clone());
        }

        let cipher = self
            .cipher
            .as_ref()
            .ok_or_else(|| ConnectionError::Cipher("encrypted packet, no cipher bound".into()))?;

        let plaintext =
            cipher.decrypt(&packet.payload).map_err(|e| ConnectionError::Cipher(e.0))?;
        Ok(Bytes::from(plaintext))
    }

    /// Encrypt an outgoing packet's payload when a cipher is bound and the
    /// ENCRYPTED flag is set, recomputing length and checksum over the
    /// ciphertext.
    pub fn seal(&self, packet: Packet, now_ms: i64) -> Result<Packet, ConnectionError> {
        if !packet.header.flags().contains(PacketFlags::ENCRYPTED) {
            return Ok(packet);
        }

        let cipher = self
            .cipher
            .as_ref()
            .ok_or_else(|| ConnectionError::Cipher("encrypted send, no cipher bound".into()))?;

        let ciphertext =
            cipher.encrypt(&packet.payload).map_err(|e| ConnectionError::Cipher(e.0))?;

        let mut header = packet.header;
        header.set_checksum(0);
        Ok(Packet::new(header, ciphertext, now_ms)?)
    }
}

// Manual Debug: the cipher is an opaque trait object.
impl<I> std::fmt::Debug for Connection<I>
where
    I: Copy + Ord + Send + Sync + Sub<Output = Duration> + std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("state", &self.state)
            .field("last_activity", &self.last_activity)
            .field("cipher_bound", &self.cipher.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_conn(now: Instant) -> Connection {
        Connection::new(1, "127.0.0.1:4000".parse().unwrap(), now, ConnectionConfig::default())
    }

    #[test]
    fn lifecycle_is_monotone() {
        let t0 = Instant::now();
        let mut conn = test_conn(t0);
        assert_eq!(conn.state(), ConnectionState::Open);

        let actions = conn.close(DisconnectReason::PeerClosed, t0);
        assert_eq!(conn.state(), ConnectionState::Closing);
        assert_eq!(actions.len(), 1);

        // Close is idempotent and keeps the first reason.
        let actions = conn.close(DisconnectReason::IdleTimeout, t0);
        assert!(actions.is_empty());
        assert_eq!(conn.close_reason(), Some(&DisconnectReason::PeerClosed));

        assert!(conn.finish());
        assert_eq!(conn.state(), ConnectionState::Closed);

        // Nothing moves backwards.
        assert!(conn.close(DisconnectReason::PeerClosed, t0).is_empty());
        assert!(!conn.finish());
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn send_requires_open() {
        let t0 = Instant::now();
        let mut conn = test_conn(t0);
        assert!(conn.ensure_open().is_ok());

        conn.close(DisconnectReason::Shutdown, t0);
        assert_eq!(
            conn.ensure_open(),
            Err(ConnectionError::NotOpen { state: ConnectionState::Closing })
        );
    }

    #[test]
    fn idle_timeout_closes() {
        let t0 = Instant::now();
        let mut conn = test_conn(t0);

        let t1 = t0 + Duration::from_secs(30);
        assert!(conn.tick(t1).is_empty());

        conn.update_activity(t1);
        let t2 = t1 + Duration::from_secs(61);
        let actions = conn.tick(t2);
        assert_eq!(actions, vec![ConnectionAction::Close {
            reason: DisconnectReason::IdleTimeout
        }]);
        assert_eq!(conn.state(), ConnectionState::Closing);
    }

    #[test]
    fn drain_deadline_forces_closed() {
        let t0 = Instant::now();
        let mut conn = test_conn(t0);
        conn.close(DisconnectReason::Shutdown, t0);

        let t1 = t0 + Duration::from_secs(1);
        conn.tick(t1);
        assert_eq!(conn.state(), ConnectionState::Closing);

        let t2 = t0 + Duration::from_secs(6);
        conn.tick(t2);
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    mod cipher {
        use packline_proto::PacketHeader;

        use super::*;
        use crate::cipher::CipherError;

        const NOW_MS: i64 = 1_722_000_000_321;

        /// Toy XOR cipher: enough to prove the seam, worthless otherwise.
        struct XorCipher(u8);

        impl PacketCipher for XorCipher {
            fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
                Ok(plaintext.iter().map(|b| b ^ self.0).collect())
            }

            fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CipherError> {
                self.encrypt(ciphertext)
            }
        }

        #[test]
        fn seal_and_open_round_trip() {
            let t0 = Instant::now();
            let mut conn = test_conn(t0);
            conn.bind_cipher(Arc::new(XorCipher(0x5A)));

            let mut header = PacketHeader::new(0x0010);
            header.set_flags(PacketFlags::ENCRYPTED);
            let packet = Packet::new(header, &b"secret"[..], NOW_MS).unwrap();

            let sealed = conn.seal(packet.clone(), NOW_MS).unwrap();
            assert_ne!(sealed.payload, packet.payload);
            // Checksum covers the ciphertext on the wire.
            assert_eq!(sealed.header.checksum(), crc32fast::hash(&sealed.payload));

            let opened = conn.open_payload(&sealed).unwrap();
            assert_eq!(&opened[..], b"secret");
        }

        #[test]
        fn encrypted_flag_without_cipher_fails() {
            let t0 = Instant::now();
            let conn = test_conn(t0);

            let mut header = PacketHeader::new(0x0010);
            header.set_flags(PacketFlags::ENCRYPTED);
            let packet = Packet::new(header, &b"secret"[..], NOW_MS).unwrap();

            assert!(matches!(conn.open_payload(&packet), Err(ConnectionError::Cipher(_))));
            assert!(matches!(conn.seal(packet, NOW_MS), Err(ConnectionError::Cipher(_))));
        }

        #[test]
        fn plaintext_packets_pass_through() {
            let t0 = Instant::now();
            let conn = test_conn(t0);
            let packet = Packet::new(PacketHeader::new(1), &b"plain"[..], NOW_MS).unwrap();

            let sealed = conn.seal(packet.clone(), NOW_MS).unwrap();
            assert_eq!(sealed, packet);
            assert_eq!(&conn.open_payload(&packet).unwrap()[..], b"plain");
        }
    }
}
