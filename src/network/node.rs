//! Peer identity and per-node state
//!
//! A `Node` is a remote peer candidate or connection. The registry owns
//! every `Node`; other components only see clones.

use crate::network::registry::ConnId;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Instant;
use thiserror::Error;

/// Length of a node id in bytes
pub const NODE_ID_LEN: usize = 36;

/// Length of the short display id
pub const DISPLAY_ID_LEN: usize = 6;

const BOOT_SCHEME: &str = "p2p://";

/// Errors parsing node ids and boot node URIs
#[derive(Error, Debug, PartialEq)]
pub enum NodeParseError {
    #[error("Node id must be {NODE_ID_LEN} bytes, got {0}")]
    BadIdLength(usize),
    #[error("Boot node must start with {BOOT_SCHEME}: {0}")]
    MissingScheme(String),
    #[error("Boot node is missing '@': {0}")]
    MissingAt(String),
    #[error("Invalid socket address: {0}")]
    BadAddress(String),
}

/// 36-byte self-assigned node identity
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId([u8; NODE_ID_LEN]);

impl NodeId {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, NodeParseError> {
        let arr: [u8; NODE_ID_LEN] = bytes
            .try_into()
            .map_err(|_| NodeParseError::BadIdLength(bytes.len()))?;
        Ok(Self(arr))
    }

    /// Fresh random id (hyphenated uuid v4 text is exactly 36 bytes)
    pub fn generate() -> Self {
        let text = uuid::Uuid::new_v4().hyphenated().to_string();
        let mut arr = [0u8; NODE_ID_LEN];
        arr.copy_from_slice(text.as_bytes());
        Self(arr)
    }

    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }

    /// Stable 32-bit hash used as the map key (FNV-1a)
    pub fn hash32(&self) -> u32 {
        let mut hash: u32 = 0x811c_9dc5;
        for byte in self.0 {
            hash ^= byte as u32;
            hash = hash.wrapping_mul(0x0100_0193);
        }
        hash
    }

    /// First six bytes, for logs
    pub fn display_id(&self) -> String {
        String::from_utf8_lossy(&self.0[..DISPLAY_ID_LEN]).into_owned()
    }
}

impl FromStr for NodeId {
    type Err = NodeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_slice(s.as_bytes())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

/// A remote peer
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub id_hash: u32,
    pub ip: IpAddr,
    pub port: u16,
    /// Came from the configured boot list
    pub from_boot_list: bool,
    pub last_seen: Instant,
    /// When the node entered its current set
    pub since: Instant,
    pub best_block_number: u64,
    pub total_difficulty: u128,
    pub bin_version: String,
    /// Last measured request round trip
    pub latency_ms: Option<u64>,
    /// Open connection, if any
    pub conn: Option<ConnId>,
}

impl Node {
    pub fn new(id: NodeId, ip: IpAddr, port: u16) -> Self {
        let now = Instant::now();
        Self {
            id,
            id_hash: id.hash32(),
            ip,
            port,
            from_boot_list: false,
            last_seen: now,
            since: now,
            best_block_number: 0,
            total_difficulty: 0,
            bin_version: String::new(),
            latency_ms: None,
            conn: None,
        }
    }

    /// Parse `p2p://<id>@<ip>:<port>`
    pub fn parse_boot(uri: &str) -> Result<Self, NodeParseError> {
        let rest = uri
            .trim()
            .strip_prefix(BOOT_SCHEME)
            .ok_or_else(|| NodeParseError::MissingScheme(uri.to_string()))?;
        let (id, addr) = rest
            .split_once('@')
            .ok_or_else(|| NodeParseError::MissingAt(uri.to_string()))?;
        let id: NodeId = id.parse()?;
        let addr: SocketAddr = addr
            .parse()
            .map_err(|_| NodeParseError::BadAddress(addr.to_string()))?;

        let mut node = Self::new(id, addr.ip(), addr.port());
        node.from_boot_list = true;
        Ok(node)
    }

    pub fn display_id(&self) -> String {
        self.id.display_id()
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }
}
