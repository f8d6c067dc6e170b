//! Server driver.
//!
//! The sans-IO orchestrator: consumes runtime events (accepted connections,
//! received bytes, closures, ticks) and produces actions for the runtime to
//! execute (sends, closes, log lines). The driver exclusively owns every
//! `Connection` and its stream reader; handlers borrow a connection only
//! for the duration of one dispatch, and the handler registry is an
//! immutable snapshot taken before the listener starts.

use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Instant};

use bytes::Bytes;
use packline_core::{
    Connection, ConnectionAction, ConnectionConfig, ConnectionError, ConnectionState,
    DisconnectReason, Environment, PacketReader, PayloadArena,
};
use packline_proto::{DEFAULT_MAX_PACKET_SIZE, Packet};

use crate::{
    error::ServerError,
    handlers::{HandlerAction, HandlerContext, HandlerRegistry},
};

/// Driver configuration.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Maximum concurrent connections
    pub max_connections: usize,
    /// Maximum frame size (header + payload)
    pub max_packet_size: usize,
    /// Per-connection limits
    pub connection: ConnectionConfig,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            max_connections: 10_000,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            connection: ConnectionConfig::default(),
        }
    }
}

/// Events the server driver processes.
///
/// Produced by the runtime (production listener or tests).
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A connection passed admission and was accepted
    ConnectionAccepted {
        /// Connection id assigned by the runtime
        id: u64,
        /// Peer address
        addr: SocketAddr,
    },

    /// Bytes arrived on a connection (arbitrarily fragmented)
    BytesReceived {
        /// Source connection
        id: u64,
        /// Received chunk
        bytes: Bytes,
    },

    /// A connection ended (peer EOF, runtime fault, executed close)
    ConnectionClosed {
        /// Connection that ended
        id: u64,
        /// Why it ended
        reason: DisconnectReason,
    },

    /// Periodic maintenance tick
    Tick,
}

/// Actions the server driver produces.
///
/// Executed by runtime-specific code.
#[derive(Debug, Clone)]
pub enum ServerAction {
    /// Encode and enqueue a packet on a connection's tx queue
    SendToConnection {
        /// Target connection
        id: u64,
        /// Packet to send
        packet: Packet,
    },

    /// Stop a connection's read task and drain its tx queue
    CloseConnection {
        /// Connection to close
        id: u64,
        /// Reason recorded for the disconnected event
        reason: DisconnectReason,
    },

    /// Emit a log line
    Log {
        /// Severity
        level: LogLevel,
        /// Message text
        message: String,
    },
}

/// Log levels for driver actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Verbose connection lifecycle detail
    Debug,
    /// Normal operational events
    Info,
    /// Protocol violations and recoverable faults
    Warn,
    /// Faults that should never happen
    Error,
}

/// Per-connection driver state.
struct ConnectionEntry {
    conn: Connection,
    reader: PacketReader,
}

/// Action-based server driver.
///
/// Pure logic, no I/O: everything observable leaves through the returned
/// actions, which doubles as the event stream (connected, disconnected,
/// packet dispatch, protocol violations) for operators and tests.
///
/// The environment's instant is pinned to `std::time::Instant`: handlers
/// receive a concrete `&Connection`, so the driver runs on the system
/// clock. The core state machines stay generic for virtual-time tests of
/// their own.
pub struct ServerDriver<E>
where
    E: Environment<Instant = Instant>,
{
    connections: HashMap<u64, ConnectionEntry>,
    handlers: Arc<HandlerRegistry>,
    arena: Arc<PayloadArena>,
    env: E,
    config: DriverConfig,
}

impl<E> ServerDriver<E>
where
    E: Environment<Instant = Instant>,
{
    /// Create a new driver with a frozen handler registry.
    pub fn new(
        env: E,
        handlers: Arc<HandlerRegistry>,
        arena: Arc<PayloadArena>,
        config: DriverConfig,
    ) -> Self {
        Self { connections: HashMap::new(), handlers, arena, env, config }
    }

    /// Number of tracked connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Lifecycle state of a connection, if tracked.
    #[must_use]
    pub fn connection_state(&self, id: u64) -> Option<ConnectionState> {
        self.connections.get(&id).map(|entry| entry.conn.state())
    }

    /// Process one event and return the actions to execute.
    pub fn process_event(&mut self, event: ServerEvent) -> Result<Vec<ServerAction>, ServerError> {
        match event {
            ServerEvent::ConnectionAccepted { id, addr } => self.handle_accepted(id, addr),
            ServerEvent::BytesReceived { id, bytes } => self.handle_bytes(id, &bytes),
            ServerEvent::ConnectionClosed { id, reason } => self.handle_closed(id, &reason),
            ServerEvent::Tick => self.handle_tick(),
        }
    }

    fn handle_accepted(
        &mut self,
        id: u64,
        addr: SocketAddr,
    ) -> Result<Vec<ServerAction>, ServerError> {
        if self.connections.len() >= self.config.max_connections {
            return Ok(vec![
                ServerAction::CloseConnection { id, reason: DisconnectReason::Overloaded },
                ServerAction::Log {
                    level: LogLevel::Warn,
                    message: format!("connection {id} from {addr} rejected: at capacity"),
                },
            ]);
        }

        let entry = ConnectionEntry {
            conn: Connection::new(id, addr, self.env.now(), self.config.connection.clone()),
            reader: PacketReader::new(self.config.max_packet_size),
        };
        self.connections.insert(id, entry);

        Ok(vec![ServerAction::Log {
            level: LogLevel::Debug,
            message: format!("connection {id} accepted from {addr}"),
        }])
    }

    fn handle_bytes(&mut self, id: u64, bytes: &Bytes) -> Result<Vec<ServerAction>, ServerError> {
        let now = self.env.now();
        let now_ms = self.env.unix_millis();
        let handlers = Arc::clone(&self.handlers);
        let arena = Arc::clone(&self.arena);

        let entry = self.connections.get_mut(&id).ok_or(ServerError::ConnectionNotFound(id))?;

        entry.conn.update_activity(now);
        entry.reader.push(bytes);

        let mut actions = Vec::new();

        while entry.conn.state() == ConnectionState::Open {
            match entry.reader.next(&arena, now_ms) {
                Ok(Some(packet)) => {
                    dispatch_packet(entry, &handlers, &arena, now, now_ms, id, packet, &mut actions);
                },
                Ok(None) => break,
                Err(err) if err.is_recoverable() => {
                    actions.push(ServerAction::Log {
                        level: LogLevel::Warn,
                        message: format!("connection {id}: protocol violation: {err}"),
                    });
                },
                Err(err) => {
                    actions.push(ServerAction::Log {
                        level: LogLevel::Warn,
                        message: format!("connection {id}: fatal framing fault: {err}"),
                    });
                    let reason = DisconnectReason::ProtocolViolation(err);
                    for action in entry.conn.close(reason, now) {
                        let ConnectionAction::Close { reason } = action;
                        actions.push(ServerAction::CloseConnection { id, reason });
                    }
                    break;
                },
            }
        }

        Ok(actions)
    }

    fn handle_closed(
        &mut self,
        id: u64,
        reason: &DisconnectReason,
    ) -> Result<Vec<ServerAction>, ServerError> {
        let now = self.env.now();

        let Some(mut entry) = self.connections.remove(&id) else {
            return Ok(Vec::new());
        };

        entry.conn.close(reason.clone(), now);
        entry.conn.finish();

        Ok(vec![ServerAction::Log {
            level: LogLevel::Info,
            message: format!("connection {id} disconnected: {reason}"),
        }])
    }

    fn handle_tick(&mut self) -> Result<Vec<ServerAction>, ServerError> {
        let now = self.env.now();
        let mut actions = Vec::new();

        for (&id, entry) in &mut self.connections {
            for action in entry.conn.tick(now) {
                let ConnectionAction::Close { reason } = action;
                actions.push(ServerAction::CloseConnection { id, reason });
            }
        }

        Ok(actions)
    }
}

/// Dispatch one decoded packet through the handler registry.
///
/// Free function so `handle_bytes` can keep its mutable borrow of the
/// connection entry across the read loop.
#[allow(clippy::too_many_arguments)]
fn dispatch_packet(
    entry: &mut ConnectionEntry,
    handlers: &HandlerRegistry,
    arena: &PayloadArena,
    now: Instant,
    now_ms: i64,
    id: u64,
    packet: Packet,
    actions: &mut Vec<ServerAction>,
) {
    // Recover plaintext first; a cipher fault means the stream itself is
    // untrustworthy.
    let payload = match entry.conn.open_payload(&packet) {
        Ok(payload) => payload,
        Err(ConnectionError::Cipher(msg)) => {
            actions.push(ServerAction::Log {
                level: LogLevel::Warn,
                message: format!("connection {id}: cipher failure: {msg}"),
            });
            for action in entry.conn.close(DisconnectReason::CipherFailure(msg), now) {
                let ConnectionAction::Close { reason } = action;
                actions.push(ServerAction::CloseConnection { id, reason });
            }
            arena.release(packet.payload);
            return;
        },
        Err(err) => {
            actions.push(ServerAction::Log {
                level: LogLevel::Error,
                message: format!("connection {id}: payload recovery failed: {err}"),
            });
            arena.release(packet.payload);
            return;
        },
    };

    let opcode = packet.header.opcode();
    actions.push(ServerAction::Log {
        level: LogLevel::Debug,
        message: format!(
            "connection {id}: packet received, opcode {opcode:#06x}, {} payload bytes",
            packet.payload.len()
        ),
    });

    let Some(handler) = handlers.get(opcode) else {
        // Unknown opcode: drop the packet, keep the connection.
        actions.push(ServerAction::Log {
            level: LogLevel::Warn,
            message: format!("connection {id}: protocol violation: unknown opcode {opcode:#06x}"),
        });
        arena.release(packet.payload);
        return;
    };

    let context =
        HandlerContext { connection: &entry.conn, packet: &packet, payload: &payload, now_ms };

    match handler(&context) {
        Ok(HandlerAction::NoReply) => {},
        Ok(HandlerAction::Reply(reply)) => match entry.conn.seal(reply, now_ms) {
            Ok(sealed) => actions.push(ServerAction::SendToConnection { id, packet: sealed }),
            Err(err) => actions.push(ServerAction::Log {
                level: LogLevel::Error,
                message: format!("connection {id}: reply encoding failed: {err}"),
            }),
        },
        Ok(HandlerAction::Close(reason)) => {
            for action in entry.conn.close(DisconnectReason::HandlerRequested(reason), now) {
                let ConnectionAction::Close { reason } = action;
                actions.push(ServerAction::CloseConnection { id, reason });
            }
        },
        Err(err) => {
            // Handler failures are reported; the connection stays Open.
            actions.push(ServerAction::Log {
                level: LogLevel::Error,
                message: format!("connection {id}: handler for {opcode:#06x} failed: {err}"),
            });
        },
    }

    drop(payload);
    arena.release(packet.payload);
}

impl<E> std::fmt::Debug for ServerDriver<E>
where
    E: Environment<Instant = Instant>,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerDriver")
            .field("connection_count", &self.connections.len())
            .field("handlers", &self.handlers)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use packline_proto::PacketHeader;

    use super::*;
    use crate::handlers::HandlerError;

    const NOW_MS: i64 = 1_722_000_000_321;

    #[derive(Clone)]
    struct TestEnv;

    impl Environment for TestEnv {
        type Instant = Instant;

        fn now(&self) -> Instant {
            Instant::now()
        }

        fn unix_millis(&self) -> i64 {
            NOW_MS
        }

        fn sleep(&self, _duration: Duration) -> impl std::future::Future<Output = ()> + Send {
            async {}
        }

        fn random_bytes(&self, buffer: &mut [u8]) {
            for (i, byte) in buffer.iter_mut().enumerate() {
                *byte = i as u8;
            }
        }
    }

    fn echo_registry() -> Arc<HandlerRegistry> {
        let mut registry = HandlerRegistry::new();
        registry
            .register(0x0001, |ctx| {
                let reply = ctx
                    .packet
                    .reply(ctx.payload.clone(), ctx.now_ms)
                    .map_err(|e| HandlerError(e.to_string()))?;
                Ok(HandlerAction::Reply(reply))
            })
            .unwrap();
        registry.register(0x0002, |_ctx| Ok(HandlerAction::Close("goodbye".into()))).unwrap();
        registry.register(0x0003, |_ctx| Err(HandlerError("boom".into()))).unwrap();
        Arc::new(registry)
    }

    fn test_driver() -> ServerDriver<TestEnv> {
        ServerDriver::new(
            TestEnv,
            echo_registry(),
            Arc::new(PayloadArena::default()),
            DriverConfig::default(),
        )
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:5000".parse().unwrap()
    }

    fn wire(opcode: u16, payload: &[u8]) -> Bytes {
        let packet = Packet::new(PacketHeader::new(opcode), payload.to_vec(), NOW_MS).unwrap();
        let mut buf = Vec::new();
        packet.encode(&mut buf, DEFAULT_MAX_PACKET_SIZE).unwrap();
        Bytes::from(buf)
    }

    #[test]
    fn accepts_and_counts_connections() {
        let mut driver = test_driver();

        let actions =
            driver.process_event(ServerEvent::ConnectionAccepted { id: 1, addr: peer() }).unwrap();
        assert_eq!(driver.connection_count(), 1);
        assert!(matches!(actions[0], ServerAction::Log { level: LogLevel::Debug, .. }));
    }

    #[test]
    fn rejects_when_at_capacity() {
        let mut driver = ServerDriver::new(
            TestEnv,
            echo_registry(),
            Arc::new(PayloadArena::default()),
            DriverConfig { max_connections: 1, ..DriverConfig::default() },
        );

        driver.process_event(ServerEvent::ConnectionAccepted { id: 1, addr: peer() }).unwrap();
        let actions =
            driver.process_event(ServerEvent::ConnectionAccepted { id: 2, addr: peer() }).unwrap();

        assert_eq!(driver.connection_count(), 1);
        assert!(matches!(
            actions[0],
            ServerAction::CloseConnection { id: 2, reason: DisconnectReason::Overloaded }
        ));
    }

    #[test]
    fn dispatches_to_echo_handler() {
        let mut driver = test_driver();
        driver.process_event(ServerEvent::ConnectionAccepted { id: 1, addr: peer() }).unwrap();

        let actions = driver
            .process_event(ServerEvent::BytesReceived { id: 1, bytes: wire(0x0001, b"hello") })
            .unwrap();

        let reply = actions
            .iter()
            .find_map(|a| match a {
                ServerAction::SendToConnection { id: 1, packet } => Some(packet.clone()),
                _ => None,
            })
            .expect("echo reply");
        assert_eq!(&reply.payload[..], b"hello");
        assert_eq!(reply.header.opcode(), 0x0001);
    }

    #[test]
    fn fragmented_bytes_produce_one_dispatch() {
        let mut driver = test_driver();
        driver.process_event(ServerEvent::ConnectionAccepted { id: 1, addr: peer() }).unwrap();

        let frame = wire(0x0001, b"hello");
        let mut sends = 0;
        for (start, end) in [(0usize, 1usize), (1, 2), (2, 22), (22, 27)] {
            let actions = driver
                .process_event(ServerEvent::BytesReceived { id: 1, bytes: frame.slice(start..end) })
                .unwrap();
            sends += actions
                .iter()
                .filter(|a| matches!(a, ServerAction::SendToConnection { .. }))
                .count();
        }
        assert_eq!(sends, 1);
    }

    #[test]
    fn unknown_opcode_drops_packet_keeps_connection() {
        let mut driver = test_driver();
        driver.process_event(ServerEvent::ConnectionAccepted { id: 1, addr: peer() }).unwrap();

        let actions = driver
            .process_event(ServerEvent::BytesReceived { id: 1, bytes: wire(0x7777, b"??") })
            .unwrap();

        assert!(actions.iter().any(|a| matches!(
            a,
            ServerAction::Log { level: LogLevel::Warn, .. }
        )));
        assert!(!actions.iter().any(|a| matches!(a, ServerAction::CloseConnection { .. })));
        assert_eq!(driver.connection_state(1), Some(ConnectionState::Open));
    }

    #[test]
    fn corrupt_frame_is_recoverable() {
        let mut driver = test_driver();
        driver.process_event(ServerEvent::ConnectionAccepted { id: 1, addr: peer() }).unwrap();

        let mut corrupt = wire(0x0001, b"hello").to_vec();
        corrupt[22] ^= 0xFF;
        corrupt.extend_from_slice(&wire(0x0001, b"clean"));

        let actions = driver
            .process_event(ServerEvent::BytesReceived { id: 1, bytes: Bytes::from(corrupt) })
            .unwrap();

        // The corrupt frame logs a violation; the clean one still echoes.
        assert!(actions.iter().any(|a| matches!(
            a,
            ServerAction::Log { level: LogLevel::Warn, .. }
        )));
        assert!(actions.iter().any(|a| matches!(a, ServerAction::SendToConnection { .. })));
        assert_eq!(driver.connection_state(1), Some(ConnectionState::Open));
    }

    #[test]
    fn undersized_length_prefix_closes_connection() {
        let mut driver = test_driver();
        driver.process_event(ServerEvent::ConnectionAccepted { id: 1, addr: peer() }).unwrap();

        let actions = driver
            .process_event(ServerEvent::BytesReceived {
                id: 1,
                bytes: Bytes::from_static(&[0x02, 0x00]),
            })
            .unwrap();

        assert!(actions.iter().any(|a| matches!(
            a,
            ServerAction::CloseConnection {
                id: 1,
                reason: DisconnectReason::ProtocolViolation(_)
            }
        )));
        assert_eq!(driver.connection_state(1), Some(ConnectionState::Closing));
    }

    #[test]
    fn handler_close_action_closes() {
        let mut driver = test_driver();
        driver.process_event(ServerEvent::ConnectionAccepted { id: 1, addr: peer() }).unwrap();

        let actions = driver
            .process_event(ServerEvent::BytesReceived { id: 1, bytes: wire(0x0002, b"") })
            .unwrap();

        assert!(actions.iter().any(|a| matches!(
            a,
            ServerAction::CloseConnection {
                id: 1,
                reason: DisconnectReason::HandlerRequested(_)
            }
        )));
    }

    #[test]
    fn handler_failure_keeps_connection_open() {
        let mut driver = test_driver();
        driver.process_event(ServerEvent::ConnectionAccepted { id: 1, addr: peer() }).unwrap();

        let actions = driver
            .process_event(ServerEvent::BytesReceived { id: 1, bytes: wire(0x0003, b"x") })
            .unwrap();

        assert!(actions.iter().any(|a| matches!(
            a,
            ServerAction::Log { level: LogLevel::Error, .. }
        )));
        assert_eq!(driver.connection_state(1), Some(ConnectionState::Open));
    }

    #[test]
    fn closed_event_removes_connection() {
        let mut driver = test_driver();
        driver.process_event(ServerEvent::ConnectionAccepted { id: 1, addr: peer() }).unwrap();

        let actions = driver
            .process_event(ServerEvent::ConnectionClosed {
                id: 1,
                reason: DisconnectReason::PeerClosed,
            })
            .unwrap();

        assert_eq!(driver.connection_count(), 0);
        assert!(matches!(actions[0], ServerAction::Log { level: LogLevel::Info, .. }));
    }

    #[test]
    fn bytes_for_unknown_connection_fail() {
        let mut driver = test_driver();
        let result = driver
            .process_event(ServerEvent::BytesReceived { id: 9, bytes: Bytes::from_static(b"x") });
        assert!(matches!(result, Err(ServerError::ConnectionNotFound(9))));
    }

    #[test]
    fn tick_closes_idle_connections() {
        let mut driver = ServerDriver::new(
            TestEnv,
            echo_registry(),
            Arc::new(PayloadArena::default()),
            DriverConfig {
                connection: ConnectionConfig {
                    idle_timeout: Duration::from_secs(0),
                    ..ConnectionConfig::default()
                },
                ..DriverConfig::default()
            },
        );
        driver.process_event(ServerEvent::ConnectionAccepted { id: 1, addr: peer() }).unwrap();

        // Zero idle window: any elapsed time exceeds it.
        std::thread::sleep(Duration::from_millis(5));
        let actions = driver.process_event(ServerEvent::Tick).unwrap();
        assert!(actions.iter().any(|a| matches!(
            a,
            ServerAction::CloseConnection { id: 1, reason: DisconnectReason::IdleTimeout }
        )));
    }
}
