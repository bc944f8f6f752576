//! TCP listener and outbound dialer
//!
//! Accepts incoming peer sockets and keeps dialing temp nodes while there
//! is room in the active set. Every socket, either direction, gets the same
//! buffer sizes and then a reader task from the inbound pipeline.

use crate::config::P2pConfig;
use crate::network::context::NetContext;
use crate::network::inbound::spawn_reader;
use crate::network::node::Node;
use crate::network::outbound::Destination;
use crate::network::registry::{Connection, Direction};
use rand::Rng;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpSocket, TcpStream};

/// Outbound dial failures. Logged by the connector, never surfaced.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("Connect to {0} timed out")]
    Timeout(SocketAddr),
    #[error("Connect to {addr} failed: {source}")]
    Io {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("Registry refused {0}: {1}")]
    Refused(String, crate::network::registry::RegistryError),
}

/// TCP server for accepting peer connections
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Server {
    /// Bind the configured address with the configured backlog and buffers
    pub async fn bind(config: &P2pConfig) -> io::Result<Self> {
        let addr = SocketAddr::new(config.ip, config.port);
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        // Accepted sockets inherit these
        set_buffer_sizes(&socket, config.socket_buffer_size)?;
        socket.bind(addr)?;
        let listener = socket.listen(config.listen_backlog)?;
        let local_addr = listener.local_addr()?;
        log::info!("Server listening on {}", local_addr);

        Ok(Self {
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Get the listening port
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Accept incoming connections
    pub async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        self.listener.accept().await
    }

    /// Accept until shutdown, handing each socket to a reader
    pub async fn run(self, ctx: Arc<NetContext>) {
        loop {
            let accepted = tokio::select! {
                _ = ctx.shutdown.cancelled() => break,
                accepted = self.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer_addr)) => accept_socket(&ctx, stream, peer_addr),
                Err(e) => {
                    // Usually fd exhaustion; back off instead of spinning
                    log::warn!("Accept error: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
        log::debug!("Acceptor on {} stopped", self.local_addr);
    }
}

fn accept_socket(ctx: &Arc<NetContext>, stream: TcpStream, peer_addr: SocketAddr) {
    if let Err(e) = configure(&stream) {
        log::debug!("Failed to configure socket from {}: {}", peer_addr, e);
        return;
    }

    let (reader, writer) = stream.into_split();
    let conn_id = ctx.registry.next_conn_id();
    let cancel = ctx.shutdown.child_token();
    let conn = Connection::new(conn_id, peer_addr, Direction::Inbound, writer, cancel.clone());

    // The registry closes the socket when it refuses it
    if let Err(e) = ctx.registry.promote_to_inbound(conn) {
        log::debug!("Refusing inbound {}: {}", peer_addr, e);
        return;
    }
    log::debug!("Accepted connection {} from {}", conn_id, peer_addr);
    spawn_reader(
        ctx.clone(),
        conn_id,
        Direction::Inbound,
        peer_addr,
        reader,
        cancel,
        None,
    );
}

fn configure(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)
}

/// Same sizes as the listener hands its accepted sockets
fn set_buffer_sizes(socket: &TcpSocket, size: u32) -> io::Result<()> {
    socket.set_recv_buffer_size(size)?;
    socket.set_send_buffer_size(size)
}

/// Dial a node, register it as outbound and send our handshake request
pub async fn connect_to_peer(ctx: &Arc<NetContext>, node: Node) -> Result<(), ConnectError> {
    let addr = node.socket_addr();
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(|source| ConnectError::Io { addr, source })?;
    if let Err(e) = set_buffer_sizes(&socket, ctx.config.socket_buffer_size) {
        log::debug!("Failed to size buffers for {}: {}", addr, e);
    }

    let stream = tokio::time::timeout(ctx.config.connect_timeout(), socket.connect(addr))
        .await
        .map_err(|_| ConnectError::Timeout(addr))?
        .map_err(|source| ConnectError::Io { addr, source })?;
    stream
        .set_nodelay(true)
        .map_err(|source| ConnectError::Io { addr, source })?;

    let (reader, writer) = stream.into_split();
    let conn_id = ctx.registry.next_conn_id();
    let cancel = ctx.shutdown.child_token();
    let conn = Connection::new(conn_id, addr, Direction::Outbound, writer, cancel.clone());

    let display_id = node.display_id();
    ctx.registry
        .promote_to_outbound(node.clone(), conn)
        .map_err(|e| ConnectError::Refused(display_id.clone(), e))?;
    log::debug!("Connected to {} at {} ({})", display_id, addr, conn_id);

    spawn_reader(
        ctx.clone(),
        conn_id,
        Direction::Outbound,
        addr,
        reader,
        cancel,
        Some(node),
    );
    ctx.send_to(Destination::Outbound(conn_id), ctx.handshake_request());
    Ok(())
}

/// Keep dialing temp nodes while the active set has room
pub async fn run_connector(ctx: Arc<NetContext>) {
    let base = Duration::from_millis(ctx.config.connect_interval_ms);
    let max_active = ctx.config.max_active_nodes;

    loop {
        let jitter = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 4);
        tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            _ = tokio::time::sleep(base + Duration::from_millis(jitter)) => {}
        }

        loop {
            if !ctx.is_running() {
                return;
            }
            let counts = ctx.registry.counts();
            if counts.active + counts.outbound >= max_active {
                break;
            }
            let Some(node) = ctx.registry.take_temp(ctx.config.sync_seeds_only) else {
                let requeued = ctx.registry.requeue_boot_nodes();
                if requeued > 0 {
                    log::debug!("Temp pool empty, re-queued {} boot nodes", requeued);
                }
                break;
            };
            if !ctx.registry.validate_node(&node) {
                continue;
            }

            if let Err(e) = connect_to_peer(&ctx, node).await {
                log::debug!("{}", e);
            }
        }
    }
    log::debug!("Connector stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    fn local_config() -> P2pConfig {
        P2pConfig {
            ip: IpAddr::from([127, 0, 0, 1]),
            port: 0,
            ..P2pConfig::default()
        }
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let server = Server::bind(&local_config()).await.unwrap();
        assert_ne!(server.port(), 0);
        assert!(server.local_addr().ip().is_loopback());
    }

    #[tokio::test]
    async fn test_bind_conflict_fails() {
        let first = Server::bind(&local_config()).await.unwrap();
        let config = P2pConfig {
            port: first.port(),
            ..local_config()
        };
        // SO_REUSEADDR does not allow two listeners on one port
        assert!(Server::bind(&config).await.is_err());
    }

    #[tokio::test]
    async fn test_configure_accepted_socket() {
        let server = Server::bind(&local_config()).await.unwrap();
        let addr = server.local_addr();
        let client = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (stream, _) = server.accept().await.unwrap();
        configure(&stream).unwrap();
        assert!(stream.nodelay().unwrap());
        client.await.unwrap();
    }

    #[tokio::test]
    async fn test_dial_socket_buffer_sizes() {
        let socket = TcpSocket::new_v4().unwrap();
        set_buffer_sizes(&socket, 64 * 1024).unwrap();
        // The kernel may round up, never down below the request
        assert!(socket.recv_buffer_size().unwrap() >= 64 * 1024);
        assert!(socket.send_buffer_size().unwrap() >= 64 * 1024);
    }
}
