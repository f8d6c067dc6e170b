//! Packline production server.
//!
//! Production runtime for the packet transport core: Tokio for async I/O,
//! plain TCP framing, system time and cryptographic RNG.
//!
//! # Architecture
//!
//! This crate provides production "glue" around the sans-IO logic. The
//! [`ServerDriver`] consumes events and produces actions (pure logic, no
//! I/O); [`Server`] executes those actions against real sockets:
//!
//! - one read task per connection feeding bytes into the driver
//! - one writer task per connection draining its bounded [`TxQueue`]
//! - timer tasks for admission purge, arena sweep, and lifecycle ticks
//!
//! Admission runs in the accept loop before a connection task ever spawns;
//! a rejected peer costs one socket close and nothing else.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod driver;
mod error;
mod handlers;
mod system_env;
mod transport;
mod txqueue;

use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use bytes::Bytes;
pub use config::{
    AdmissionSettings, ConnectionSettings, ListenerSettings, PacketSettings, RateLimitSettings,
    ServerConfig,
};
pub use driver::{DriverConfig, LogLevel, ServerAction, ServerDriver, ServerEvent};
pub use error::ServerError;
pub use handlers::{HandlerAction, HandlerContext, HandlerError, HandlerRegistry, PacketHandler};
use packline_core::{AdmissionStore, ConnectionConfig, DisconnectReason, Environment, PayloadArena};
pub use system_env::SystemEnv;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    sync::{Mutex, RwLock, watch},
    task::JoinSet,
};
pub use transport::TcpTransport;
pub use txqueue::{TxItem, TxQueue};

/// Deadline for draining connection tasks at shutdown before forcing.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

/// Interval between payload arena reclamation sweeps.
const ARENA_SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Interval between driver lifecycle ticks.
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Read buffer size for connection tasks.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Per-connection handles shared between the accept loop, timer tasks, and
/// connection tasks.
struct PeerHandle {
    /// Bounded send queue (writer task holds the receiver)
    queue: TxQueue,
    /// Close signal; carries the disconnect reason once set
    close: watch::Sender<Option<DisconnectReason>>,
}

/// Map of live connections by id.
#[derive(Default)]
struct SharedState {
    peers: RwLock<HashMap<u64, PeerHandle>>,
}

impl SharedState {
    /// Signal a connection to close with a reason. First reason wins.
    async fn signal_close(&self, id: u64, reason: DisconnectReason) {
        let peers = self.peers.read().await;
        if let Some(peer) = peers.get(&id) {
            peer.close.send_if_modified(|current| {
                if current.is_none() {
                    *current = Some(reason);
                    true
                } else {
                    false
                }
            });
        }
    }
}

/// Production Packline server.
///
/// Wraps [`ServerDriver`] with TCP transport, per-connection tasks, and the
/// timer-driven maintenance loops.
pub struct Server {
    transport: TcpTransport,
    driver: Arc<Mutex<ServerDriver<SystemEnv>>>,
    admission: Arc<AdmissionStore>,
    arena: Arc<PayloadArena>,
    env: SystemEnv,
    config: ServerConfig,
    shutdown: watch::Sender<bool>,
}

/// Handle for stopping a running server.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    shutdown: watch::Sender<bool>,
}

impl ServerHandle {
    /// Signal cancellation. Read tasks stop at their next suspension point
    /// and the listener drains within the shutdown deadline.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl Server {
    /// Bind the listener and assemble the runtime.
    ///
    /// The handler registry is frozen here; the admission store locks at
    /// its first check. Both are configuration after this point.
    pub async fn bind(
        config: ServerConfig,
        admission: Arc<AdmissionStore>,
        handlers: HandlerRegistry,
    ) -> Result<Self, ServerError> {
        let env = SystemEnv::new();
        let arena = Arc::new(PayloadArena::new(config.packet.heap_alloc_threshold));

        let driver_config = DriverConfig {
            max_connections: config.listener.max_connections,
            max_packet_size: config.packet.max_size,
            connection: config.connection_config(),
        };
        let driver = ServerDriver::new(
            env,
            Arc::new(handlers),
            Arc::clone(&arena),
            driver_config,
        );

        let transport = TcpTransport::bind(&config.listener.bind).await?;
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            transport,
            driver: Arc::new(Mutex::new(driver)),
            admission,
            arena,
            env,
            config,
            shutdown,
        })
    }

    /// Local address the server is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.transport.local_addr()
    }

    /// Handle for stopping the server from another task.
    #[must_use]
    pub fn handle(&self) -> ServerHandle {
        ServerHandle { shutdown: self.shutdown.clone() }
    }

    /// Run the server until stopped.
    ///
    /// Accepts connections, enforces admission, and spawns one task per
    /// admitted peer. Returns after a [`ServerHandle::stop`] once every
    /// connection task has drained or the shutdown deadline forced them.
    pub async fn run(self) -> Result<(), ServerError> {
        tracing::info!("server listening on {}", self.transport.local_addr()?);

        let shared = Arc::new(SharedState::default());
        let conn_config = self.config.connection_config();
        let mut shutdown_rx = self.shutdown.subscribe();

        self.spawn_timers(&shared);

        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,

                accepted = self.transport.accept() => {
                    let (socket, addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            tracing::error!("accept error: {}", e);
                            continue;
                        },
                    };

                    // Admission runs before anything else is spent on the
                    // peer; a refusal is an immediate socket close.
                    if let Err(e) = self.admission.check(addr.ip(), self.env.unix_millis()).await {
                        tracing::debug!("refused {}: {}", addr, e);
                        continue;
                    }

                    let id = self.env.random_u64();
                    let driver = Arc::clone(&self.driver);
                    let shared = Arc::clone(&shared);
                    let conn_config = conn_config.clone();
                    let shutdown_rx = self.shutdown.subscribe();

                    tasks.spawn(async move {
                        if let Err(e) = handle_connection(
                            socket, addr, id, driver, shared, conn_config, shutdown_rx,
                        )
                        .await
                        {
                            tracing::warn!("connection {} error: {}", id, e);
                        }
                    });
                },
            }
        }

        tracing::info!("shutting down, draining {} connection tasks", tasks.len());

        let drained = tokio::time::timeout(SHUTDOWN_DEADLINE, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            tracing::warn!("shutdown deadline passed, forcing {} tasks closed", tasks.len());
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }

        Ok(())
    }

    /// Spawn the purge, sweep, and tick timers. Each exits on shutdown.
    fn spawn_timers(&self, shared: &Arc<SharedState>) {
        let purge_interval =
            Duration::from_secs(self.config.admission.purge_interval_seconds.max(1));

        let admission = Arc::clone(&self.admission);
        let env = self.env;
        let mut shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(purge_interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = timer.tick() => {
                        let purged = admission.purge(env.unix_millis());
                        if purged > 0 {
                            tracing::debug!("admission purge dropped {} bans", purged);
                        }
                    },
                }
            }
        });

        let arena = Arc::clone(&self.arena);
        let mut shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(ARENA_SWEEP_INTERVAL);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = timer.tick() => {
                        let reclaimed = arena.sweep();
                        if reclaimed > 0 {
                            tracing::debug!("arena sweep reclaimed {} payloads", reclaimed);
                        }
                    },
                }
            }
        });

        let driver = Arc::clone(&self.driver);
        let shared = Arc::clone(shared);
        let mut shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(TICK_INTERVAL);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = timer.tick() => {
                        let actions = {
                            let mut driver = driver.lock().await;
                            driver.process_event(ServerEvent::Tick)
                        };
                        match actions {
                            Ok(actions) => execute_actions(actions, &shared).await,
                            Err(e) => tracing::error!("tick failed: {}", e),
                        }
                    },
                }
            }
        });
    }
}

/// Handle a single TCP connection: framed receive loop, backpressure, and
/// teardown ordering.
async fn handle_connection(
    socket: tokio::net::TcpStream,
    addr: SocketAddr,
    id: u64,
    driver: Arc<Mutex<ServerDriver<SystemEnv>>>,
    shared: Arc<SharedState>,
    conn_config: ConnectionConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(), ServerError> {
    let (mut read_half, mut write_half) = socket.into_split();

    let (queue, mut queue_rx) = TxQueue::new(conn_config.tx_highwater, conn_config.tx_lowwater);
    let (close_tx, mut close_rx) = watch::channel(None::<DisconnectReason>);

    {
        let mut peers = shared.peers.write().await;
        peers.insert(id, PeerHandle { queue: queue.clone(), close: close_tx });
    }

    // Writer task: single drain point per connection, so wire order equals
    // enqueue order. Outbound packets were already validated against the
    // configured limit at construction; the length field is the ceiling.
    let max_size = u16::MAX as usize;
    let writer = tokio::spawn(async move {
        while let Some(item) = queue_rx.recv().await {
            match item {
                TxItem::Packet(packet) => {
                    let mut buf = Vec::with_capacity(packet.frame_len());
                    if let Err(e) = packet.encode(&mut buf, max_size) {
                        tracing::error!("outbound encode failed: {}", e);
                        continue;
                    }
                    if write_half.write_all(&buf).await.is_err() {
                        break;
                    }
                },
                TxItem::Shutdown => break,
            }
        }
        let _ = write_half.shutdown().await;
    });

    {
        let mut driver = driver.lock().await;
        let actions = driver.process_event(ServerEvent::ConnectionAccepted { id, addr })?;
        drop(driver);
        execute_actions(actions, &shared).await;
    }

    let mut read_buf = vec![0u8; READ_BUFFER_SIZE];
    let reason = loop {
        // Backpressure: a full tx queue pauses this read task until the
        // writer drains to the low-water mark or the deadline passes.
        if queue.is_full()
            && queue.wait_for_lowwater(conn_config.drain_deadline).await.is_err()
        {
            break DisconnectReason::Backpressure;
        }

        tokio::select! {
            _ = shutdown_rx.changed() => break DisconnectReason::Shutdown,

            _ = close_rx.changed() => {
                break close_rx.borrow().clone().unwrap_or(DisconnectReason::PeerClosed);
            },

            read = tokio::time::timeout(conn_config.idle_timeout, read_half.read(&mut read_buf)) => {
                match read {
                    Err(_elapsed) => break DisconnectReason::IdleTimeout,
                    Ok(Ok(0)) => break DisconnectReason::PeerClosed,
                    Ok(Err(e)) => {
                        tracing::debug!("connection {} read error: {}", id, e);
                        break DisconnectReason::PeerClosed;
                    },
                    Ok(Ok(n)) => {
                        let result = {
                            let mut driver = driver.lock().await;
                            driver.process_event(ServerEvent::BytesReceived {
                                id,
                                bytes: Bytes::copy_from_slice(&read_buf[..n]),
                            })
                        };
                        match result {
                            Ok(actions) => execute_actions(actions, &shared).await,
                            Err(e) => {
                                tracing::error!("connection {} event failed: {}", id, e);
                                break DisconnectReason::PeerClosed;
                            },
                        }

                        // A close the driver requested for *this* connection
                        // surfaces through the close signal on the next loop.
                    },
                }
            },
        }
    };

    // Teardown: stop accepting sends, drain the writer, then report.
    {
        let mut peers = shared.peers.write().await;
        peers.remove(&id);
    }

    if !queue.close(conn_config.drain_deadline).await {
        writer.abort();
    }
    if tokio::time::timeout(conn_config.drain_deadline, writer).await.is_err() {
        tracing::debug!("connection {} writer forced closed", id);
    }

    {
        let mut driver = driver.lock().await;
        let actions =
            driver.process_event(ServerEvent::ConnectionClosed { id, reason: reason.clone() })?;
        drop(driver);
        execute_actions(actions, &shared).await;
    }

    tracing::debug!("connection {} from {} finished: {}", id, addr, reason);
    Ok(())
}

/// Execute driver actions against the shared connection map.
async fn execute_actions(actions: Vec<ServerAction>, shared: &SharedState) {
    for action in actions {
        match action {
            ServerAction::SendToConnection { id, packet } => {
                let queue = {
                    let peers = shared.peers.read().await;
                    peers.get(&id).map(|peer| peer.queue.clone())
                };

                match queue {
                    Some(queue) => {
                        if let Err(e) = queue.send(packet, SHUTDOWN_DEADLINE).await {
                            tracing::warn!("send to {} failed: {}", id, e);
                            shared.signal_close(id, DisconnectReason::Backpressure).await;
                        }
                    },
                    None => tracing::debug!("send to {}: connection gone", id),
                }
            },

            ServerAction::CloseConnection { id, reason } => {
                shared.signal_close(id, reason).await;
            },

            ServerAction::Log { level, message } => match level {
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
        }
    }
}
