//! Inbound pipeline
//!
//! One reader task per socket. It reassembles frames, drives the handshake
//! for its connection, answers core (`NET`) frames itself and queues
//! everything else for the dispatch workers. Any read or decode error ends
//! the task and removes the connection; it never affects other sockets.

use crate::network::codec::{CodecError, FrameCodec};
use crate::network::context::NetContext;
use crate::network::dispatch::InboundMessage;
use crate::network::handshake::{HandshakeError, HandshakeRequest, HandshakeResponse, HandshakeState};
use crate::network::message::{
    act, decode_active_nodes, encode_active_nodes, ActiveNodeEntry, Frame,
    MAX_ACTIVE_NODES_PER_MESSAGE,
};
use crate::network::node::Node;
use crate::network::outbound::Destination;
use crate::network::registry::{ConnId, Direction, RegistryError};
use bytes::Bytes;
use futures::StreamExt;
use rand::seq::SliceRandom;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

/// What the reader does after a frame
#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

/// Per-connection read state
struct Session {
    conn_id: ConnId,
    peer_addr: SocketAddr,
    state: HandshakeState,
    /// The node we dialed (outbound only)
    dialed: Option<Node>,
    opened_at: Instant,
    /// Set once active
    peer: Option<(u32, String)>,
}

/// Spawn the reader for a freshly registered socket
pub fn spawn_reader<R>(
    ctx: Arc<NetContext>,
    conn_id: ConnId,
    direction: Direction,
    peer_addr: SocketAddr,
    reader: R,
    cancel: CancellationToken,
    dialed: Option<Node>,
) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let session = Session {
        conn_id,
        peer_addr,
        state: HandshakeState::initial(direction == Direction::Outbound),
        dialed,
        opened_at: Instant::now(),
        peer: None,
    };
    tokio::spawn(read_loop(ctx, session, reader, cancel))
}

async fn read_loop<R>(ctx: Arc<NetContext>, mut session: Session, reader: R, cancel: CancellationToken)
where
    R: AsyncRead + Unpin,
{
    let mut frames = FramedRead::new(reader, FrameCodec::new(ctx.config.max_frame_body));
    let read_timeout = ctx.config.read_timeout();

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ctx.shutdown.cancelled() => break,
            next = tokio::time::timeout(read_timeout, frames.next()) => next,
        };

        match next {
            Err(_) => {
                log::debug!("Read timeout on {} ({})", session.conn_id, session.peer_addr);
                break;
            }
            Ok(None) => {
                log::debug!("Connection {} closed by {}", session.conn_id, session.peer_addr);
                break;
            }
            Ok(Some(Err(e))) => {
                on_read_error(&ctx, &session, &e);
                break;
            }
            Ok(Some(Ok(frame))) => {
                if session.on_frame(&ctx, frame).await == Flow::Close {
                    break;
                }
            }
        }
    }

    ctx.registry.remove_conn(session.conn_id);
}

fn on_read_error(ctx: &NetContext, session: &Session, error: &CodecError) {
    match (&session.peer, error) {
        // A bad frame from an authenticated peer is a protocol violation
        (Some((id_hash, display)), CodecError::Oversized { .. }) => {
            log::warn!("Bad frame from {}: {}", display, error);
            ctx.err_check(*id_hash, display);
        }
        _ => log::debug!(
            "Read error on {} ({}): {}",
            session.conn_id,
            session.peer_addr,
            error
        ),
    }
}

impl Session {
    async fn on_frame(&mut self, ctx: &NetContext, frame: Frame) -> Flow {
        if let Some((id_hash, _)) = &self.peer {
            ctx.registry.touch_active(*id_hash);
        }

        match (self.state, frame.is_net(), frame.action) {
            (HandshakeState::AwaitingRequest, true, act::REQ_HANDSHAKE) => {
                self.on_handshake_request(ctx, &frame.payload).await
            }
            (HandshakeState::AwaitingResponse, true, act::RES_HANDSHAKE) => {
                self.on_handshake_response(ctx, &frame.payload)
            }
            (HandshakeState::Active, true, _) => self.on_net_frame(ctx, frame),
            (HandshakeState::Active, false, _) => {
                if let Some((id_hash, display_id)) = &self.peer {
                    ctx.dispatcher.submit(InboundMessage {
                        id_hash: *id_hash,
                        display_id: display_id.clone(),
                        version: frame.version,
                        route: frame.route(),
                        payload: frame.payload,
                    });
                }
                Flow::Continue
            }
            (state, _, _) => {
                log::debug!(
                    "Unexpected {:?} on connection {} in state {:?}",
                    frame.route(),
                    self.conn_id,
                    state
                );
                self.state = HandshakeState::Rejected;
                Flow::Close
            }
        }
    }

    async fn on_handshake_request(&mut self, ctx: &NetContext, payload: &Bytes) -> Flow {
        let request = match HandshakeRequest::decode(payload) {
            Ok(request) => request,
            Err(e) => {
                log::debug!("Handshake from {} rejected: {}", self.peer_addr, e);
                self.state = HandshakeState::Rejected;
                return Flow::Close;
            }
        };

        let versions = ctx.handlers.versions();
        if let Err(e) = request.check_compatible(ctx.config.chain_id, &versions) {
            log::debug!("Handshake from {} rejected: {}", self.peer_addr, e);
            self.reject(ctx).await;
            return Flow::Close;
        }

        // Dial back on the socket's address, at the port the peer listens on
        let mut node = Node::new(request.id, self.peer_addr.ip(), request.port);
        node.bin_version = String::from_utf8_lossy(&request.revision).into_owned();
        let id_hash = node.id_hash;
        let display_id = node.display_id();
        self.state = HandshakeState::Validated;

        let Some((_, writer)) = ctx
            .registry
            .writer_for(&Destination::Inbound(self.conn_id))
        else {
            return Flow::Close;
        };
        // Hold the socket across promotion: anything queued for the new
        // active node is written after the accept
        let mut writer = writer.lock().await;
        if let Err(e) = ctx
            .registry
            .promote_to_active(self.conn_id, Direction::Inbound, node)
        {
            drop(writer);
            log::debug!("Inbound {} from {} refused: {}", display_id, self.peer_addr, e);
            self.reject(ctx).await;
            return Flow::Close;
        }
        self.activate(id_hash, display_id);

        let accept = ctx.handshake_accept();
        match write_direct(&mut **writer, &accept, ctx.config.write_timeout()).await {
            Ok(()) => Flow::Continue,
            Err(e) => {
                log::debug!("Failed to send accept to {}: {}", self.peer_addr, e);
                Flow::Close
            }
        }
    }

    fn on_handshake_response(&mut self, ctx: &NetContext, payload: &Bytes) -> Flow {
        let result = HandshakeResponse::decode(payload).and_then(|response| {
            if response.accepted {
                Ok(response)
            } else {
                Err(HandshakeError::Rejected)
            }
        });
        let response = match result {
            Ok(response) => response,
            Err(e) => {
                log::debug!("Handshake with {} failed: {}", self.peer_addr, e);
                self.state = HandshakeState::Rejected;
                return Flow::Close;
            }
        };

        let Some(mut node) = self.dialed.take() else {
            self.state = HandshakeState::Rejected;
            return Flow::Close;
        };
        node.bin_version = response.revision_string();
        let id_hash = node.id_hash;
        let display_id = node.display_id();
        self.state = HandshakeState::Validated;

        match ctx
            .registry
            .promote_to_active(self.conn_id, Direction::Outbound, node)
        {
            Ok(()) => {
                ctx.registry.update_latency(id_hash, self.opened_at.elapsed());
                self.activate(id_hash, display_id);
                Flow::Continue
            }
            Err(e) => {
                log::debug!("Outbound {} not promoted: {}", display_id, e);
                self.state = HandshakeState::Rejected;
                Flow::Close
            }
        }
    }

    fn activate(&mut self, id_hash: u32, display_id: String) {
        self.state = HandshakeState::Active;
        self.peer = Some((id_hash, display_id));
    }

    /// Answer a refused request directly on the socket; it is closed next
    async fn reject(&mut self, ctx: &NetContext) {
        self.state = HandshakeState::Rejected;
        let Some((_, writer)) = ctx
            .registry
            .writer_for(&Destination::Inbound(self.conn_id))
        else {
            return;
        };

        let reject = ctx.handshake_reject();
        let mut writer = writer.lock().await;
        if let Err(e) = write_direct(&mut **writer, &reject, ctx.config.write_timeout()).await {
            log::debug!("Failed to send reject to {}: {}", self.peer_addr, e);
        }
    }

    fn on_net_frame(&mut self, ctx: &NetContext, frame: Frame) -> Flow {
        let Some((id_hash, display_id)) = self.peer.clone() else {
            return Flow::Close;
        };

        match frame.action {
            act::PING => {
                ctx.send_to(
                    Destination::Active(id_hash),
                    Frame::net(act::PONG, Bytes::new()),
                );
            }
            // Receiving it already reset the read timeout
            act::PONG => {}
            act::REQ_ACTIVE_NODES => {
                let entries = active_node_entries(ctx, id_hash);
                ctx.send_to(
                    Destination::Active(id_hash),
                    Frame::net(act::RES_ACTIVE_NODES, encode_active_nodes(&entries)),
                );
            }
            act::RES_ACTIVE_NODES => match decode_active_nodes(&frame.payload) {
                Ok(entries) => {
                    if let Some(latency) = ctx.take_gossip_latency(id_hash) {
                        ctx.registry.update_latency(id_hash, latency);
                    }
                    let added = ingest_active_nodes(ctx, entries);
                    log::debug!("{} new temp nodes from {}", added, display_id);
                }
                Err(e) => {
                    log::debug!("Bad active nodes from {}: {}", display_id, e);
                    ctx.err_check(id_hash, &display_id);
                }
            },
            act::REQ_HANDSHAKE | act::RES_HANDSHAKE => {
                log::debug!("Repeated handshake from {}", display_id);
                ctx.err_check(id_hash, &display_id);
            }
            other => {
                log::debug!("Unknown net action {} from {}", other, display_id);
                ctx.err_check(id_hash, &display_id);
            }
        }
        Flow::Continue
    }
}

/// Write a handshake reply on the socket itself, bypassing the lanes
async fn write_direct<W>(writer: &mut W, frame: &Frame, timeout: Duration) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let bytes = frame.to_bytes();
    let write = async {
        writer.write_all(&bytes).await?;
        writer.flush().await
    };
    tokio::time::timeout(timeout, write)
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "write timed out"))?
}

/// Our active nodes, minus the requester, as gossip tuples
fn active_node_entries(ctx: &NetContext, requester: u32) -> Vec<ActiveNodeEntry> {
    let mut nodes: Vec<Node> = ctx
        .registry
        .get_active_nodes_snapshot()
        .into_values()
        .filter(|n| n.id_hash != requester)
        .collect();
    nodes.shuffle(&mut rand::thread_rng());
    nodes.truncate(MAX_ACTIVE_NODES_PER_MESSAGE);

    nodes
        .into_iter()
        .map(|n| ActiveNodeEntry {
            id: n.id,
            ip: n.ip,
            port: n.port,
            bin_version: n.bin_version,
            best_block_number: n.best_block_number,
            total_difficulty: n.total_difficulty,
        })
        .collect()
}

/// Feed gossip tuples into the temp pool; returns how many were queued
fn ingest_active_nodes(ctx: &NetContext, entries: Vec<ActiveNodeEntry>) -> usize {
    let mut added = 0;
    for entry in entries {
        let mut node = Node::new(entry.id, entry.ip, entry.port);
        node.bin_version = entry.bin_version;
        node.best_block_number = entry.best_block_number;
        node.total_difficulty = entry.total_difficulty;

        match ctx.registry.add_temp(node) {
            Ok(()) => added += 1,
            Err(RegistryError::Full) => break,
            Err(_) => {}
        }
    }
    added
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::P2pConfig;
    use crate::network::context::test_context;
    use crate::network::node::NodeId;
    use crate::network::registry::Connection;
    use std::net::IpAddr;
    use std::time::Duration;
    use tokio::io::{AsyncWriteExt, DuplexStream};

    const CHAIN: u32 = 256;

    fn context() -> (Arc<NetContext>, CancellationToken) {
        let ctx = test_context(P2pConfig {
            chain_id: CHAIN,
            error_tolerance: 3,
            ..P2pConfig::default()
        });
        let shutdown = ctx.shutdown.clone();
        (ctx, shutdown)
    }

    /// Registers an inbound connection and starts its reader; returns the
    /// remote end of both directions
    fn accept(ctx: &Arc<NetContext>) -> (ConnId, DuplexStream, DuplexStream) {
        let (to_peer, from_us) = tokio::io::duplex(4096);
        let (to_us, from_peer) = tokio::io::duplex(4096);
        let conn_id = ctx.registry.next_conn_id();
        let cancel = CancellationToken::new();
        let addr: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let conn = Connection::new(conn_id, addr, Direction::Inbound, to_peer, cancel.clone());
        ctx.registry.promote_to_inbound(conn).unwrap();
        spawn_reader(
            ctx.clone(),
            conn_id,
            Direction::Inbound,
            addr,
            from_peer,
            cancel,
            None,
        );
        (conn_id, from_us, to_us)
    }

    fn request(chain_id: u32) -> HandshakeRequest {
        HandshakeRequest {
            id: NodeId::generate(),
            chain_id,
            ip: IpAddr::from([127, 0, 0, 1]),
            port: 30400,
            revision: Bytes::from_static(b"peer/1"),
            versions: vec![],
        }
    }

    async fn read_frame(stream: DuplexStream) -> Frame {
        let mut frames = FramedRead::new(stream, FrameCodec::new(1024));
        tokio::time::timeout(Duration::from_secs(5), frames.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap()
    }

    async fn next_frame(frames: &mut FramedRead<DuplexStream, FrameCodec>) -> Frame {
        tokio::time::timeout(Duration::from_secs(5), frames.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap()
    }

    async fn wait_for(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..100 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_inbound_handshake_accepted() {
        let (ctx, shutdown) = context();
        let (_, from_us, mut to_us) = accept(&ctx);
        let req = request(CHAIN);

        to_us.write_all(&req.to_frame().to_bytes()).await.unwrap();
        let reply = read_frame(from_us).await;
        let response = HandshakeResponse::decode(&reply.payload).unwrap();
        assert!(response.accepted);

        let node = ctx.registry.get_active(req.id.hash32()).unwrap();
        assert_eq!(node.port, 30400);
        assert_eq!(node.bin_version, "peer/1");
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_wrong_chain_rejected() {
        let (ctx, shutdown) = context();
        let (_, from_us, mut to_us) = accept(&ctx);

        to_us
            .write_all(&request(CHAIN + 1).to_frame().to_bytes())
            .await
            .unwrap();
        let reply = read_frame(from_us).await;
        assert!(!HandshakeResponse::decode(&reply.payload).unwrap().accepted);

        assert!(wait_for(|| ctx.registry.counts().inbound == 0).await);
        assert_eq!(ctx.registry.counts().active, 0);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_app_frame_before_handshake_closes() {
        let (ctx, shutdown) = context();
        let (_, _from_us, mut to_us) = accept(&ctx);

        let frame = Frame::new(1, crate::network::message::ctrl::SYNC, 0, vec![1u8]);
        to_us.write_all(&frame.to_bytes()).await.unwrap();

        assert!(wait_for(|| ctx.registry.counts().inbound == 0).await);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_disconnect_mid_frame_removes_active() {
        let (ctx, shutdown) = context();
        let (_, from_us, mut to_us) = accept(&ctx);
        let req = request(CHAIN);
        to_us.write_all(&req.to_frame().to_bytes()).await.unwrap();
        read_frame(from_us).await;
        assert_eq!(ctx.registry.counts().active, 1);

        let partial = Frame::new(1, 1, 0, vec![0u8; 100]).to_bytes();
        to_us.write_all(&partial[..20]).await.unwrap();
        drop(to_us);

        assert!(wait_for(|| ctx.registry.counts().active == 0).await);
        shutdown.cancel();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_accept_precedes_frames_queued_on_promotion() {
        let (ctx, shutdown) = context();
        let (_, from_us, mut to_us) = accept(&ctx);
        let req = request(CHAIN);
        let id_hash = req.id.hash32();

        // Queue a frame for the node the moment it turns active
        let sender = {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                while ctx.registry.get_active(id_hash).is_none() {
                    tokio::task::yield_now().await;
                }
                ctx.send_to(
                    Destination::Active(id_hash),
                    Frame::net(act::REQ_ACTIVE_NODES, Bytes::new()),
                )
            })
        };
        to_us.write_all(&req.to_frame().to_bytes()).await.unwrap();
        let queued = tokio::time::timeout(Duration::from_secs(5), sender)
            .await
            .unwrap()
            .unwrap();
        assert!(queued);

        let mut frames = FramedRead::new(from_us, FrameCodec::new(1024));
        let first = next_frame(&mut frames).await;
        assert_eq!(first.action, act::RES_HANDSHAKE);
        assert!(HandshakeResponse::decode(&first.payload).unwrap().accepted);
        let second = next_frame(&mut frames).await;
        assert_eq!(second.action, act::REQ_ACTIVE_NODES);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_ping_answered_with_pong() {
        let (ctx, shutdown) = context();
        let (_, from_us, mut to_us) = accept(&ctx);
        let req = request(CHAIN);
        to_us.write_all(&req.to_frame().to_bytes()).await.unwrap();

        let mut frames = FramedRead::new(from_us, FrameCodec::new(1024));
        next_frame(&mut frames).await;

        let ping = Frame::net(act::PING, Bytes::new());
        to_us.write_all(&ping.to_bytes()).await.unwrap();
        let reply = next_frame(&mut frames).await;
        assert!(reply.is_net());
        assert_eq!(reply.action, act::PONG);

        // A pong needs no answer and is not an error
        let pong = Frame::net(act::PONG, Bytes::new());
        to_us.write_all(&pong.to_bytes()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ctx.errors.count(req.id.hash32()), 0);
        assert_eq!(ctx.registry.counts().active, 1);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_active_nodes_exchange() {
        let (ctx, shutdown) = context();
        let (_, from_us, mut to_us) = accept(&ctx);
        let req = request(CHAIN);
        to_us.write_all(&req.to_frame().to_bytes()).await.unwrap();

        let mut frames = FramedRead::new(from_us, FrameCodec::new(64 * 1024));
        frames.next().await.unwrap().unwrap();

        // The peer gossips one node to us, then asks for ours
        let gossip = ActiveNodeEntry {
            id: NodeId::generate(),
            ip: IpAddr::from([10, 1, 1, 1]),
            port: 30303,
            bin_version: "x".to_string(),
            best_block_number: 5,
            total_difficulty: 9,
        };
        let res = Frame::net(act::RES_ACTIVE_NODES, encode_active_nodes(&[gossip]));
        to_us.write_all(&res.to_bytes()).await.unwrap();
        assert!(wait_for(|| ctx.registry.counts().temp == 1).await);

        let ask = Frame::net(act::REQ_ACTIVE_NODES, Bytes::new());
        to_us.write_all(&ask.to_bytes()).await.unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(5), frames.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(reply.action, act::RES_ACTIVE_NODES);
        // Only the requester is active, and it is excluded
        assert!(decode_active_nodes(&reply.payload).unwrap().is_empty());
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_malformed_gossip_counts_errors() {
        let (ctx, shutdown) = context();
        let (_, from_us, mut to_us) = accept(&ctx);
        let req = request(CHAIN);
        let id_hash = req.id.hash32();
        to_us.write_all(&req.to_frame().to_bytes()).await.unwrap();
        read_frame(from_us).await;

        let bad = Frame::net(act::RES_ACTIVE_NODES, vec![1u8, 2, 3]);
        for _ in 0..4 {
            to_us.write_all(&bad.to_bytes()).await.unwrap();
        }

        // Tolerance is 3: the fourth error bans and drops
        assert!(wait_for(|| ctx.registry.is_banned(id_hash)).await);
        assert!(ctx.registry.not_active_node(id_hash));
        shutdown.cancel();
    }
}
