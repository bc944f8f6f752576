//! End-to-end scenarios over loopback TCP

use futures::StreamExt;
use p2p_core::config::P2pConfig;
use p2p_core::network::{
    ctrl, Frame, FrameCodec, Handler, HandlerError, HandlerHeader, HandshakeRequest,
    HandshakeResponse, Node, NodeId, P2pManager,
};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;

const LOCALHOST: [u8; 4] = [127, 0, 0, 1];
const CHAIN_ID: u32 = 256;

fn config() -> P2pConfig {
    P2pConfig {
        chain_id: CHAIN_ID,
        ip: IpAddr::from(LOCALHOST),
        port: 0,
        connect_interval_ms: 100,
        ..P2pConfig::default()
    }
}

async fn started(config: P2pConfig) -> P2pManager {
    let manager = P2pManager::new(config).unwrap();
    manager.run().await.unwrap();
    manager
}

async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

/// A bare socket that speaks just enough protocol to handshake
struct RawPeer {
    id: NodeId,
    frames: FramedRead<OwnedReadHalf, FrameCodec>,
    writer: OwnedWriteHalf,
}

impl RawPeer {
    async fn connect(addr: SocketAddr, id: NodeId) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, writer) = stream.into_split();
        Self {
            id,
            frames: FramedRead::new(reader, FrameCodec::new(1024 * 1024)),
            writer,
        }
    }

    /// Send a request; `Some(accepted)` or `None` if the socket was closed
    async fn handshake(&mut self, chain_id: u32) -> Option<bool> {
        let request = HandshakeRequest {
            id: self.id,
            chain_id,
            ip: IpAddr::from(LOCALHOST),
            port: 1,
            revision: "raw/1".into(),
            versions: vec![],
        };
        self.writer
            .write_all(&request.to_frame().to_bytes())
            .await
            .ok()?;
        let frame = self.next_frame().await?;
        Some(HandshakeResponse::decode(&frame.payload).ok()?.accepted)
    }

    async fn next_frame(&mut self) -> Option<Frame> {
        match tokio::time::timeout(Duration::from_secs(5), self.frames.next()).await {
            Ok(Some(Ok(frame))) => Some(frame),
            _ => None,
        }
    }

    /// True once the node has closed the socket
    async fn closed(&mut self) -> bool {
        loop {
            match tokio::time::timeout(Duration::from_secs(5), self.frames.next()).await {
                Err(_) => return false,
                Ok(None) | Ok(Some(Err(_))) => return true,
                // Gossip requests may arrive first
                Ok(Some(Ok(_))) => continue,
            }
        }
    }
}

struct Forward {
    header: HandlerHeader,
    tx: mpsc::UnboundedSender<(u32, Vec<u8>)>,
}

impl Handler for Forward {
    fn header(&self) -> HandlerHeader {
        self.header
    }

    fn receive(&self, id_hash: u32, _: &str, payload: &[u8]) -> Result<(), HandlerError> {
        self.tx.send((id_hash, payload.to_vec()))?;
        Ok(())
    }
}

fn dial_target(manager: &P2pManager) -> Node {
    let addr = manager.local_addr().unwrap();
    Node::new(manager.local_id(), addr.ip(), addr.port())
}

#[tokio::test]
async fn test_mutual_bootstrap_converges() {
    let a = started(config()).await;
    let b = started(config()).await;

    a.add_node(dial_target(&b)).unwrap();
    b.add_node(dial_target(&a)).unwrap();

    assert!(wait_until(|| a.active_count() == 1 && b.active_count() == 1).await);
    let a_sees = a.get_active_nodes();
    assert_eq!(a_sees[0].id, b.local_id());
    assert_eq!(b.get_active_nodes()[0].id, a.local_id());

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_handler_receives_sent_frame() {
    let header = HandlerHeader::new(1, ctrl::SYNC, 7);
    let (tx, mut rx) = mpsc::unbounded_channel();

    let a = P2pManager::new(config()).unwrap();
    let b = P2pManager::new(config()).unwrap();
    a.register(vec![Arc::new(Forward {
        header,
        tx: tx.clone(),
    })]);
    b.register(vec![Arc::new(Forward { header, tx })]);
    a.run().await.unwrap();
    b.run().await.unwrap();

    a.add_node(dial_target(&b)).unwrap();
    assert!(wait_until(|| a.active_count() == 1 && b.active_count() == 1).await);

    let b_hash = b.local_id().hash32();
    assert!(a.send(b_hash, Frame::new(1, ctrl::SYNC, 7, b"ping".to_vec())));

    let (from, payload) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(from, a.local_id().hash32());
    assert_eq!(payload, b"ping");

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_idle_pair_outlives_read_timeout() {
    let quick = || P2pConfig {
        read_timeout_ms: 1_000,
        ..config()
    };
    let a = started(quick()).await;
    let b = started(quick()).await;

    a.add_node(dial_target(&b)).unwrap();
    assert!(wait_until(|| a.active_count() == 1 && b.active_count() == 1).await);

    // No application traffic; keepalives carry the link
    tokio::time::sleep(Duration::from_millis(2_500)).await;
    assert_eq!(a.active_count(), 1);
    assert_eq!(b.active_count(), 1);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_oversized_send_refused_without_dropping_peer() {
    let small = || P2pConfig {
        max_frame_body: 1024,
        ..config()
    };
    let a = started(small()).await;
    let b = started(small()).await;

    a.add_node(dial_target(&b)).unwrap();
    assert!(wait_until(|| a.active_count() == 1 && b.active_count() == 1).await);

    let b_hash = b.local_id().hash32();
    let too_big = Frame::new(1, ctrl::SYNC, 0, vec![0u8; 1025]);
    assert!(!a.send(b_hash, too_big));
    assert_eq!(a.status().outbound.oversized, 1);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(a.active_count(), 1);
    assert_eq!(b.active_count(), 1);
    assert!(!b.is_banned(a.local_id().hash32()));

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_incompatible_versions_never_activate() {
    let (tx, _rx) = mpsc::unbounded_channel();
    let a = P2pManager::new(config()).unwrap();
    let b = P2pManager::new(config()).unwrap();
    a.register(vec![Arc::new(Forward {
        header: HandlerHeader::new(1, ctrl::SYNC, 0),
        tx: tx.clone(),
    })]);
    b.register(vec![Arc::new(Forward {
        header: HandlerHeader::new(2, ctrl::SYNC, 0),
        tx,
    })]);
    a.run().await.unwrap();
    b.run().await.unwrap();

    a.add_node(dial_target(&b)).unwrap();
    tokio::time::sleep(Duration::from_millis(1000)).await;
    assert_eq!(a.active_count(), 0);
    assert_eq!(b.active_count(), 0);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_capacity_rejects_extra_peer() {
    let node = started(P2pConfig {
        max_active_nodes: 1,
        ..config()
    })
    .await;
    let addr = node.local_addr().unwrap();

    let mut first = RawPeer::connect(addr, NodeId::generate()).await;
    assert_eq!(first.handshake(CHAIN_ID).await, Some(true));
    assert!(wait_until(|| node.active_count() == 1).await);

    let mut second = RawPeer::connect(addr, NodeId::generate()).await;
    assert_ne!(second.handshake(CHAIN_ID).await, Some(true));
    assert_eq!(node.active_count(), 1);

    node.shutdown().await;
}

#[tokio::test]
async fn test_wrong_chain_rejected() {
    let node = started(config()).await;
    let mut peer = RawPeer::connect(node.local_addr().unwrap(), NodeId::generate()).await;

    assert_eq!(peer.handshake(CHAIN_ID + 1).await, Some(false));
    assert!(peer.closed().await);
    assert_eq!(node.active_count(), 0);

    node.shutdown().await;
}

#[tokio::test]
async fn test_mid_frame_disconnect_is_contained() {
    let node = started(config()).await;
    let addr = node.local_addr().unwrap();

    let mut peer = RawPeer::connect(addr, NodeId::generate()).await;
    assert_eq!(peer.handshake(CHAIN_ID).await, Some(true));
    assert!(wait_until(|| node.active_count() == 1).await);

    let frame = Frame::new(1, ctrl::SYNC, 0, vec![7u8; 512]).to_bytes();
    peer.writer.write_all(&frame[..100]).await.unwrap();
    drop(peer);

    assert!(wait_until(|| node.active_count() == 0).await);

    // The node keeps serving other sockets
    let mut next = RawPeer::connect(addr, NodeId::generate()).await;
    assert_eq!(next.handshake(CHAIN_ID).await, Some(true));
    assert!(wait_until(|| node.active_count() == 1).await);

    node.shutdown().await;
}

#[tokio::test]
async fn test_error_tolerance_bans_peer() {
    let tolerance = 3;
    let node = started(P2pConfig {
        error_tolerance: tolerance,
        ..config()
    })
    .await;
    let addr = node.local_addr().unwrap();
    let id = NodeId::generate();

    let mut peer = RawPeer::connect(addr, id).await;
    assert_eq!(peer.handshake(CHAIN_ID).await, Some(true));
    assert!(wait_until(|| node.active_count() == 1).await);

    let banned: Vec<bool> = (0..=tolerance).map(|_| node.err_check(id.hash32())).collect();
    assert_eq!(banned.iter().filter(|b| **b).count(), 1);
    assert!(*banned.last().unwrap());
    assert!(node.is_banned(id.hash32()));
    assert_eq!(node.active_count(), 0);
    assert!(peer.closed().await);

    // Banned ids cannot come back
    let mut again = RawPeer::connect(addr, id).await;
    assert_eq!(again.handshake(CHAIN_ID).await, Some(false));

    node.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_closes_sockets_once() {
    let node = started(config()).await;
    let mut peer = RawPeer::connect(node.local_addr().unwrap(), NodeId::generate()).await;
    assert_eq!(peer.handshake(CHAIN_ID).await, Some(true));

    node.shutdown().await;
    node.shutdown().await;

    assert!(!node.is_running());
    assert!(peer.closed().await);
    assert_eq!(node.counts().active, 0);
}

#[tokio::test]
async fn test_status_reports_peers() {
    let node = started(config()).await;
    let mut peer = RawPeer::connect(node.local_addr().unwrap(), NodeId::generate()).await;
    assert_eq!(peer.handshake(CHAIN_ID).await, Some(true));
    assert!(wait_until(|| node.active_count() == 1).await);

    let status = node.status();
    assert!(status.running);
    assert_eq!(status.counts.active, 1);
    assert_eq!(status.local_addr, node.local_addr());
    assert!(serde_json::to_value(&status).is_ok());

    node.shutdown().await;
}
