//! Node registry
//!
//! Owns every known peer and is the only writer of set membership:
//! - temp: discovered, not connected
//! - outbound: dialed, handshake pending
//! - inbound: accepted, handshake pending
//! - active: handshake complete
//!
//! A node id appears in at most one of {outbound, inbound, active}. All
//! state sits behind a single lock, so every query is a consistent
//! snapshot. Callers get clones and re-resolve by id on every access.

use crate::config::P2pConfig;
use crate::network::node::{Node, NodeId};
use crate::network::outbound::Destination;
use parking_lot::RwLock;
use rand::seq::IteratorRandom;
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

/// Stable handle of one socket
pub type ConnId = u64;

/// Write half of a socket, shared between the registry and writer lanes
pub type SharedWriter = Arc<tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

/// Registry errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Registry full")]
    Full,
    #[error("Node is self")]
    IsSelf,
    #[error("Node is banned")]
    Banned,
    #[error("Node already known")]
    AlreadyKnown,
    #[error("Node already active")]
    AlreadyActive,
    #[error("Node already connected")]
    AlreadyConnected,
    #[error("Connection {0} not found")]
    NotFound(ConnId),
    #[error("Not a seed node")]
    NotSeed,
}

/// Which side opened the socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Which set a node is in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeSet {
    Temp,
    Outbound,
    Inbound,
    Active,
}

/// An open socket
pub struct Connection {
    pub id: ConnId,
    pub peer_addr: SocketAddr,
    pub direction: Direction,
    pub opened_at: Instant,
    writer: SharedWriter,
    cancel: CancellationToken,
}

impl Connection {
    pub fn new<W>(
        id: ConnId,
        peer_addr: SocketAddr,
        direction: Direction,
        writer: W,
        cancel: CancellationToken,
    ) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            id,
            peer_addr,
            direction,
            opened_at: Instant::now(),
            writer: Arc::new(tokio::sync::Mutex::new(Box::new(writer))),
            cancel,
        }
    }

    pub fn writer(&self) -> SharedWriter {
        Arc::clone(&self.writer)
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Idempotent teardown: stops the reader task and shuts the write half.
    /// Errors are logged, never returned.
    pub fn close(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        log::debug!("Closing connection {} ({})", self.id, self.peer_addr);

        let writer = Arc::clone(&self.writer);
        let id = self.id;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = writer.lock().await.shutdown().await {
                    log::debug!("Error shutting down connection {}: {}", id, e);
                }
            });
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("direction", &self.direction)
            .finish()
    }
}

/// Our own identity, used for self-exclusion
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    pub id: NodeId,
    pub id_hash: u32,
    pub ip: IpAddr,
    pub port: u16,
}

impl LocalIdentity {
    pub fn new(id: NodeId, ip: IpAddr, port: u16) -> Self {
        Self {
            id,
            id_hash: id.hash32(),
            ip,
            port,
        }
    }
}

/// Capacity and expiry limits
#[derive(Debug, Clone)]
pub struct RegistryLimits {
    pub max_temp_nodes: usize,
    pub max_active_nodes: usize,
    pub ban_duration: Duration,
    pub temp_node_ttl: Duration,
    pub handshake_timeout: Duration,
}

impl RegistryLimits {
    pub fn from_config(config: &P2pConfig) -> Self {
        Self {
            max_temp_nodes: config.max_temp_nodes,
            max_active_nodes: config.max_active_nodes,
            ban_duration: config.ban_duration(),
            temp_node_ttl: config.temp_node_ttl(),
            handshake_timeout: config.handshake_timeout(),
        }
    }
}

/// Set sizes at one instant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct RegistryCounts {
    pub temp: usize,
    pub outbound: usize,
    pub inbound: usize,
    pub active: usize,
    pub banned: usize,
}

/// What one eviction pass removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionStats {
    pub temp: usize,
    pub handshakes: usize,
    pub bans: usize,
}

struct Pending {
    conn: Connection,
    /// Known for outbound dials, learned from the request for inbound
    node: Option<Node>,
}

struct Active {
    node: Node,
    conn: Connection,
}

#[derive(Default)]
struct RegistryState {
    temp: VecDeque<Node>,
    outbound: HashMap<ConnId, Pending>,
    inbound: HashMap<ConnId, Pending>,
    active: HashMap<u32, Active>,
    banned: HashMap<u32, Instant>,
    boot_nodes: Vec<Node>,
    seed_ips: HashSet<IpAddr>,
}

impl RegistryState {
    fn in_temp(&self, id_hash: u32) -> bool {
        self.temp.iter().any(|n| n.id_hash == id_hash)
    }

    fn outbound_conn_of(&self, id_hash: u32) -> Option<ConnId> {
        self.outbound
            .iter()
            .find(|(_, p)| p.node.as_ref().map(|n| n.id_hash) == Some(id_hash))
            .map(|(id, _)| *id)
    }

    fn is_banned(&self, id_hash: u32, now: Instant) -> bool {
        self.banned.get(&id_hash).is_some_and(|until| *until > now)
    }

    fn active_conn(&self, conn_id: ConnId) -> Option<u32> {
        self.active
            .iter()
            .find(|(_, a)| a.conn.id == conn_id)
            .map(|(hash, _)| *hash)
    }
}

/// Thread-safe store of peer sets
pub struct NodeRegistry {
    local: RwLock<LocalIdentity>,
    limits: RegistryLimits,
    next_conn: AtomicU64,
    state: RwLock<RegistryState>,
}

impl NodeRegistry {
    pub fn new(local: LocalIdentity, limits: RegistryLimits) -> Self {
        Self {
            local: RwLock::new(local),
            limits,
            next_conn: AtomicU64::new(1),
            state: RwLock::new(RegistryState::default()),
        }
    }

    pub fn local(&self) -> LocalIdentity {
        self.local.read().clone()
    }

    /// Record the port actually bound (when configured as 0)
    pub fn set_local_port(&self, port: u16) {
        self.local.write().port = port;
    }

    pub fn limits(&self) -> &RegistryLimits {
        &self.limits
    }

    pub fn next_conn_id(&self) -> ConnId {
        self.next_conn.fetch_add(1, Ordering::Relaxed)
    }

    // =========================================================================
    // Validation
    // =========================================================================

    /// Matches self by id, by id-hash + port, or by ip + port
    pub fn is_self(&self, node: &Node) -> bool {
        let local = self.local.read();
        if node.id == local.id {
            return true;
        }
        if node.id_hash == local.id_hash && node.port == local.port {
            return true;
        }
        node.ip == local.ip && node.port == local.port && !local.ip.is_unspecified()
    }

    /// True when the node may be dialed or accepted: not self, not banned,
    /// not active and not already being dialed
    pub fn validate_node(&self, node: &Node) -> bool {
        if self.is_self(node) {
            return false;
        }
        let state = self.state.read();
        !state.is_banned(node.id_hash, Instant::now())
            && !state.active.contains_key(&node.id_hash)
            && state.outbound_conn_of(node.id_hash).is_none()
    }

    pub fn not_active_node(&self, id_hash: u32) -> bool {
        !self.state.read().active.contains_key(&id_hash)
    }

    pub fn not_at_outbound_list(&self, id_hash: u32) -> bool {
        self.state.read().outbound_conn_of(id_hash).is_none()
    }

    pub fn is_banned(&self, id_hash: u32) -> bool {
        self.state.read().is_banned(id_hash, Instant::now())
    }

    pub fn is_seed(&self, ip: &IpAddr) -> bool {
        self.state.read().seed_ips.contains(ip)
    }

    /// Every set the node id is currently in
    pub fn membership(&self, id_hash: u32) -> Vec<NodeSet> {
        let state = self.state.read();
        let mut sets = Vec::new();
        if state.in_temp(id_hash) {
            sets.push(NodeSet::Temp);
        }
        if state.outbound_conn_of(id_hash).is_some() {
            sets.push(NodeSet::Outbound);
        }
        if state
            .inbound
            .values()
            .any(|p| p.node.as_ref().map(|n| n.id_hash) == Some(id_hash))
        {
            sets.push(NodeSet::Inbound);
        }
        if state.active.contains_key(&id_hash) {
            sets.push(NodeSet::Active);
        }
        sets
    }

    // =========================================================================
    // Temp pool
    // =========================================================================

    /// Queue a discovered node. Reject-new when full.
    pub fn add_temp(&self, node: Node) -> Result<(), RegistryError> {
        if self.is_self(&node) {
            return Err(RegistryError::IsSelf);
        }

        let mut state = self.state.write();
        if state.is_banned(node.id_hash, Instant::now()) {
            return Err(RegistryError::Banned);
        }
        if state.in_temp(node.id_hash)
            || state.active.contains_key(&node.id_hash)
            || state.outbound_conn_of(node.id_hash).is_some()
        {
            return Err(RegistryError::AlreadyKnown);
        }
        if state.temp.len() >= self.limits.max_temp_nodes {
            return Err(RegistryError::Full);
        }

        let mut node = node;
        node.since = Instant::now();
        node.conn = None;
        state.temp.push_back(node);
        Ok(())
    }

    /// Remember boot nodes and their IPs as seeds, and queue them
    pub fn add_boot_nodes(&self, nodes: Vec<Node>) -> usize {
        {
            let mut state = self.state.write();
            for node in &nodes {
                state.seed_ips.insert(node.ip);
            }
            state.boot_nodes = nodes.clone();
        }
        nodes
            .into_iter()
            .filter(|node| self.add_temp(node.clone()).is_ok())
            .count()
    }

    /// Re-queue boot nodes that are not connected
    pub fn requeue_boot_nodes(&self) -> usize {
        let boot = self.state.read().boot_nodes.clone();
        boot.into_iter()
            .filter(|node| self.add_temp(node.clone()).is_ok())
            .count()
    }

    /// Oldest temp node still worth dialing. Stale candidates are discarded.
    pub fn take_temp(&self, seeds_only: bool) -> Option<Node> {
        loop {
            let node = self.state.write().temp.pop_front()?;
            if seeds_only && !self.is_seed(&node.ip) {
                log::debug!("Skipping non-seed node {}", node.display_id());
                continue;
            }
            if self.validate_node(&node) {
                return Some(node);
            }
        }
    }

    // =========================================================================
    // Membership moves
    // =========================================================================

    /// Track a dialed socket. On error the connection is closed.
    pub fn promote_to_outbound(&self, node: Node, conn: Connection) -> Result<(), RegistryError> {
        let result = self.insert_outbound(node, conn);
        if let Err((e, conn)) = result {
            conn.close();
            return Err(e);
        }
        Ok(())
    }

    fn insert_outbound(
        &self,
        mut node: Node,
        conn: Connection,
    ) -> Result<(), (RegistryError, Connection)> {
        if self.is_self(&node) {
            return Err((RegistryError::IsSelf, conn));
        }

        let mut state = self.state.write();
        if state.is_banned(node.id_hash, Instant::now()) {
            return Err((RegistryError::Banned, conn));
        }
        if state.active.contains_key(&node.id_hash) {
            return Err((RegistryError::AlreadyActive, conn));
        }
        if state.outbound_conn_of(node.id_hash).is_some() {
            return Err((RegistryError::AlreadyConnected, conn));
        }
        if state.active.len() + state.outbound.len() >= self.limits.max_active_nodes {
            return Err((RegistryError::Full, conn));
        }

        node.conn = Some(conn.id);
        node.since = Instant::now();
        state.temp.retain(|n| n.id_hash != node.id_hash);
        state.outbound.insert(conn.id, Pending { conn, node: Some(node) });
        Ok(())
    }

    /// Track an accepted socket. On error the connection is closed.
    pub fn promote_to_inbound(&self, conn: Connection) -> Result<(), RegistryError> {
        let mut state = self.state.write();
        if state.active.len() + state.inbound.len() >= self.limits.max_active_nodes {
            drop(state);
            conn.close();
            return Err(RegistryError::Full);
        }
        state.inbound.insert(conn.id, Pending { conn, node: None });
        Ok(())
    }

    /// Move a handshaking connection to the active set.
    ///
    /// On error the connection stays where it was; the caller decides
    /// whether to answer before calling `remove_conn`.
    ///
    /// When an inbound request comes from a node we are dialing at the same
    /// time, the side with the larger id hash keeps the inbound socket.
    pub fn promote_to_active(
        &self,
        conn_id: ConnId,
        direction: Direction,
        peer: Node,
    ) -> Result<(), RegistryError> {
        if self.is_self(&peer) {
            return Err(RegistryError::IsSelf);
        }
        let local_hash = self.local.read().id_hash;

        let mut state = self.state.write();
        let source = match direction {
            Direction::Inbound => &state.inbound,
            Direction::Outbound => &state.outbound,
        };
        if !source.contains_key(&conn_id) {
            log::warn!("promote_to_active: connection {} not found", conn_id);
            return Err(RegistryError::NotFound(conn_id));
        }
        if state.is_banned(peer.id_hash, Instant::now()) {
            return Err(RegistryError::Banned);
        }
        if state.active.contains_key(&peer.id_hash) {
            return Err(RegistryError::AlreadyActive);
        }
        if state.active.len() >= self.limits.max_active_nodes {
            return Err(RegistryError::Full);
        }

        if direction == Direction::Inbound {
            if let Some(dialing) = state.outbound_conn_of(peer.id_hash) {
                if local_hash > peer.id_hash {
                    if let Some(pending) = state.outbound.remove(&dialing) {
                        log::debug!(
                            "Dropping concurrent dial {} to {}",
                            dialing,
                            peer.display_id()
                        );
                        pending.conn.close();
                    }
                } else {
                    return Err(RegistryError::AlreadyConnected);
                }
            }
        }

        let pending = match direction {
            Direction::Inbound => state.inbound.remove(&conn_id),
            Direction::Outbound => state.outbound.remove(&conn_id),
        };
        let Some(pending) = pending else {
            return Err(RegistryError::NotFound(conn_id));
        };

        // Gossip-learned chain info survives the move
        let mut node = peer;
        if let Some(known) = pending.node {
            node.from_boot_list |= known.from_boot_list;
            node.best_block_number = node.best_block_number.max(known.best_block_number);
            node.total_difficulty = node.total_difficulty.max(known.total_difficulty);
        }
        node.conn = Some(conn_id);
        node.since = Instant::now();
        node.touch();
        state.temp.retain(|n| n.id_hash != node.id_hash);

        log::info!(
            "Node {} active ({:?}, {}:{}, {})",
            node.display_id(),
            direction,
            node.ip,
            node.port,
            node.bin_version
        );
        state.active.insert(
            node.id_hash,
            Active {
                node,
                conn: pending.conn,
            },
        );
        Ok(())
    }

    /// Remove an active node and close its socket
    pub fn drop_active(&self, id_hash: u32, reason: &str) -> bool {
        let removed = self.state.write().active.remove(&id_hash);
        match removed {
            Some(active) => {
                log::info!("Dropped node {}: {}", active.node.display_id(), reason);
                active.conn.close();
                true
            }
            None => false,
        }
    }

    /// Remove whatever entry owns this socket and close it
    pub fn remove_conn(&self, conn_id: ConnId) -> bool {
        let mut state = self.state.write();
        let pending = state
            .inbound
            .remove(&conn_id)
            .or_else(|| state.outbound.remove(&conn_id));
        if let Some(pending) = pending {
            drop(state);
            pending.conn.close();
            return true;
        }

        let Some(id_hash) = state.active_conn(conn_id) else {
            return false;
        };
        if let Some(active) = state.active.remove(&id_hash) {
            drop(state);
            log::info!("Node {} disconnected", active.node.display_id());
            active.conn.close();
            return true;
        }
        false
    }

    pub fn ban(&self, id_hash: u32) {
        let until = Instant::now() + self.limits.ban_duration;
        self.state.write().banned.insert(id_hash, until);
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn get_random_active(&self) -> Option<Node> {
        let state = self.state.read();
        state
            .active
            .values()
            .choose(&mut rand::thread_rng())
            .map(|a| a.node.clone())
    }

    pub fn get_active_nodes_snapshot(&self) -> HashMap<u32, Node> {
        self.state
            .read()
            .active
            .iter()
            .map(|(hash, a)| (*hash, a.node.clone()))
            .collect()
    }

    pub fn get_active(&self, id_hash: u32) -> Option<Node> {
        self.state.read().active.get(&id_hash).map(|a| a.node.clone())
    }

    /// Id hash of the active node on this socket
    pub fn active_hash_of(&self, conn_id: ConnId) -> Option<u32> {
        self.state.read().active_conn(conn_id)
    }

    pub fn counts(&self) -> RegistryCounts {
        let state = self.state.read();
        let now = Instant::now();
        RegistryCounts {
            temp: state.temp.len(),
            outbound: state.outbound.len(),
            inbound: state.inbound.len(),
            active: state.active.len(),
            banned: state.banned.values().filter(|until| **until > now).count(),
        }
    }

    /// Mean of measured latencies over active nodes
    pub fn average_latency_ms(&self) -> Option<u64> {
        let state = self.state.read();
        let samples: Vec<u64> = state
            .active
            .values()
            .filter_map(|a| a.node.latency_ms)
            .collect();
        if samples.is_empty() {
            return None;
        }
        Some(samples.iter().sum::<u64>() / samples.len() as u64)
    }

    /// Resolve the socket for a destination
    pub fn writer_for(&self, dest: &Destination) -> Option<(ConnId, SharedWriter)> {
        let state = self.state.read();
        let conn = match dest {
            Destination::Active(id_hash) => state.active.get(id_hash).map(|a| &a.conn),
            Destination::Inbound(conn_id) => state.inbound.get(conn_id).map(|p| &p.conn),
            Destination::Outbound(conn_id) => state.outbound.get(conn_id).map(|p| &p.conn),
        }?;
        if conn.is_closed() {
            return None;
        }
        Some((conn.id, conn.writer()))
    }

    // =========================================================================
    // Liveness updates
    // =========================================================================

    pub fn touch_active(&self, id_hash: u32) {
        if let Some(active) = self.state.write().active.get_mut(&id_hash) {
            active.node.touch();
        }
    }

    /// Active nodes we have not heard from for at least `idle`
    pub fn silent_active(&self, now: Instant, idle: Duration) -> Vec<u32> {
        self.state
            .read()
            .active
            .iter()
            .filter(|(_, a)| now.saturating_duration_since(a.node.last_seen) >= idle)
            .map(|(hash, _)| *hash)
            .collect()
    }

    pub fn update_chain_info(&self, id_hash: u32, best_block_number: u64, total_difficulty: u128) {
        if let Some(active) = self.state.write().active.get_mut(&id_hash) {
            active.node.best_block_number = best_block_number;
            active.node.total_difficulty = total_difficulty;
        }
    }

    pub fn update_latency(&self, id_hash: u32, latency: Duration) {
        if let Some(active) = self.state.write().active.get_mut(&id_hash) {
            active.node.latency_ms = Some(latency.as_millis() as u64);
        }
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Drop expired temp nodes, timed-out handshakes and expired bans
    pub fn evict_expired(&self, now: Instant) -> EvictionStats {
        let mut stats = EvictionStats::default();
        let mut closing = Vec::new();
        {
            let mut state = self.state.write();

            let before = state.temp.len();
            let ttl = self.limits.temp_node_ttl;
            state
                .temp
                .retain(|n| now.saturating_duration_since(n.since) < ttl);
            stats.temp = before - state.temp.len();

            let timeout = self.limits.handshake_timeout;
            let expired = |p: &Pending| now.saturating_duration_since(p.conn.opened_at) >= timeout;
            let stale_in: Vec<ConnId> = state
                .inbound
                .iter()
                .filter(|(_, p)| expired(p))
                .map(|(id, _)| *id)
                .collect();
            let stale_out: Vec<ConnId> = state
                .outbound
                .iter()
                .filter(|(_, p)| expired(p))
                .map(|(id, _)| *id)
                .collect();
            for id in stale_in {
                closing.extend(state.inbound.remove(&id));
            }
            for id in stale_out {
                closing.extend(state.outbound.remove(&id));
            }
            stats.handshakes = closing.len();

            let before = state.banned.len();
            state.banned.retain(|_, until| *until > now);
            stats.bans = before - state.banned.len();
        }

        for pending in closing {
            log::debug!("Handshake timed out on connection {}", pending.conn.id);
            pending.conn.close();
        }
        stats
    }

    /// Close every socket and clear all connection sets
    pub fn close_all(&self) -> usize {
        let (pending, active) = {
            let mut guard = self.state.write();
            let state = &mut *guard;
            let pending: Vec<Pending> = state
                .inbound
                .drain()
                .chain(state.outbound.drain())
                .map(|(_, p)| p)
                .collect();
            let active: Vec<Active> = state.active.drain().map(|(_, a)| a).collect();
            state.temp.clear();
            (pending, active)
        };

        let closed = pending.len() + active.len();
        for p in pending {
            p.conn.close();
        }
        for a in active {
            a.conn.close();
        }
        closed
    }
}
