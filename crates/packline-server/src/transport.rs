//! TCP transport.
//!
//! The packet port is plain TCP: frames are self-delimiting, so the
//! transport only has to hand the runtime connected sockets and peer
//! addresses. `TCP_NODELAY` is set on accepted sockets; the protocol is
//! request/response shaped and latency wins over coalescing.

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};

use crate::error::ServerError;

/// TCP listener wrapper.
pub struct TcpTransport {
    listener: TcpListener,
}

impl TcpTransport {
    /// Bind the listener to an endpoint string such as `0.0.0.0:9940`.
    pub async fn bind(address: &str) -> Result<Self, ServerError> {
        let addr: SocketAddr = address
            .parse()
            .map_err(|e| ServerError::Config(format!("invalid bind address '{address}': {e}")))?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Transport(format!("failed to bind {addr}: {e}")))?;

        tracing::info!("TCP transport bound to {}", addr);

        Ok(Self { listener })
    }

    /// Accept one peer connection.
    ///
    /// Blocks until a connection is available.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr), ServerError> {
        let (socket, addr) = self
            .listener
            .accept()
            .await
            .map_err(|e| ServerError::Transport(format!("accept failed: {e}")))?;

        if let Err(e) = socket.set_nodelay(true) {
            tracing::debug!("set_nodelay failed for {}: {}", addr, e);
        }

        Ok((socket, addr))
    }

    /// Local address the transport is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.listener
            .local_addr()
            .map_err(|e| ServerError::Transport(format!("failed to get local address: {e}")))
    }
}
