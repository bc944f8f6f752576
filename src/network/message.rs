//! Wire message types
//!
//! Every message after the TCP connect is a `Frame`: an 8-byte header
//! (version u16, control u8, action u8, length u32, big endian) followed by
//! an opaque payload. Control `NET` is reserved for the core itself
//! (handshake, keepalive and active-node gossip); every other route goes to
//! registered handlers.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use thiserror::Error;

use crate::network::node::{NodeId, NODE_ID_LEN};

/// Frame header length in bytes
pub const HEADER_LEN: usize = 8;

/// Version used by core (`NET`) frames
pub const NET_VERSION: u16 = 0;

/// Longest revision string accepted in handshakes and gossip
pub const MAX_REVISION_LEN: usize = 64;

/// Most tuples carried by one active-nodes response
pub const MAX_ACTIVE_NODES_PER_MESSAGE: usize = 40;

/// Control codes
pub mod ctrl {
    pub const NET: u8 = 0;
    pub const SYNC: u8 = 1;
}

/// `NET` action codes
pub mod act {
    pub const REQ_HANDSHAKE: u8 = 0;
    pub const RES_HANDSHAKE: u8 = 1;
    pub const PING: u8 = 2;
    pub const PONG: u8 = 3;
    pub const REQ_ACTIVE_NODES: u8 = 4;
    pub const RES_ACTIVE_NODES: u8 = 5;
}

/// Errors decoding structured payloads
#[derive(Error, Debug, PartialEq)]
pub enum PayloadError {
    #[error("Payload truncated while reading {0}")]
    Truncated(&'static str),
    #[error("Invalid IP length {0}")]
    BadIpLength(usize),
    #[error("Varint overflow")]
    VarintOverflow,
    #[error("{field} too long: {len}")]
    TooLong { field: &'static str, len: usize },
    #[error("Trailing bytes after payload: {0}")]
    Trailing(usize),
}

/// Dispatch key: `(control << 8) | action`
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Route(u16);

impl Route {
    pub const fn new(ctrl: u8, action: u8) -> Self {
        Self(((ctrl as u16) << 8) | action as u16)
    }

    pub fn ctrl(self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub fn action(self) -> u8 {
        self.0 as u8
    }

    pub fn as_u16(self) -> u16 {
        self.0
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Route({}/{})", self.ctrl(), self.action())
    }
}

/// Decoded frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u16,
    pub ctrl: u8,
    pub action: u8,
    pub len: u32,
}

impl Header {
    pub fn route(&self) -> Route {
        Route::new(self.ctrl, self.action)
    }

    pub fn write(&self, dst: &mut BytesMut) {
        dst.put_u16(self.version);
        dst.put_u8(self.ctrl);
        dst.put_u8(self.action);
        dst.put_u32(self.len);
    }

    /// Reads a header from the first `HEADER_LEN` bytes without consuming them
    pub fn peek(src: &[u8]) -> Option<Self> {
        if src.len() < HEADER_LEN {
            return None;
        }
        Some(Self {
            version: u16::from_be_bytes([src[0], src[1]]),
            ctrl: src[2],
            action: src[3],
            len: u32::from_be_bytes([src[4], src[5], src[6], src[7]]),
        })
    }
}

/// One wire message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub version: u16,
    pub ctrl: u8,
    pub action: u8,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(version: u16, ctrl: u8, action: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            version,
            ctrl,
            action,
            payload: payload.into(),
        }
    }

    /// A core-protocol frame
    pub fn net(action: u8, payload: impl Into<Bytes>) -> Self {
        Self::new(NET_VERSION, ctrl::NET, action, payload)
    }

    pub fn route(&self) -> Route {
        Route::new(self.ctrl, self.action)
    }

    pub fn header(&self) -> Header {
        Header {
            version: self.version,
            ctrl: self.ctrl,
            action: self.action,
            // Bodies over u32::MAX are refused before encoding; saturate
            // rather than wrap if one slips through
            len: u32::try_from(self.payload.len()).unwrap_or(u32::MAX),
        }
    }

    pub fn is_net(&self) -> bool {
        self.ctrl == ctrl::NET
    }

    /// Encoded length on the wire
    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.wire_len());
        self.header().write(&mut buf);
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}

// =============================================================================
// Payload primitives
// =============================================================================

pub(crate) fn put_varint(dst: &mut BytesMut, mut value: u64) {
    while value >= 0x80 {
        dst.put_u8((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    dst.put_u8(value as u8);
}

pub(crate) fn get_varint(src: &mut Bytes) -> Result<u64, PayloadError> {
    let mut value: u64 = 0;
    for shift in (0..64).step_by(7) {
        if !src.has_remaining() {
            return Err(PayloadError::Truncated("varint"));
        }
        let byte = src.get_u8();
        value |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(PayloadError::VarintOverflow)
}

pub(crate) fn put_ip(dst: &mut BytesMut, ip: &IpAddr) {
    match ip {
        IpAddr::V4(v4) => {
            dst.put_u8(4);
            dst.put_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            dst.put_u8(16);
            dst.put_slice(&v6.octets());
        }
    }
}

pub(crate) fn get_ip(src: &mut Bytes) -> Result<IpAddr, PayloadError> {
    let len = get_u8(src, "ip length")? as usize;
    match len {
        4 => {
            let mut octets = [0u8; 4];
            take_into(src, &mut octets, "ipv4")?;
            Ok(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        16 => {
            let mut octets = [0u8; 16];
            take_into(src, &mut octets, "ipv6")?;
            Ok(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        other => Err(PayloadError::BadIpLength(other)),
    }
}

/// u8 length prefix, at most `MAX_REVISION_LEN` bytes
pub(crate) fn put_short_bytes(dst: &mut BytesMut, bytes: &[u8]) {
    let len = bytes.len().min(MAX_REVISION_LEN);
    dst.put_u8(len as u8);
    dst.put_slice(&bytes[..len]);
}

pub(crate) fn get_short_bytes(
    src: &mut Bytes,
    field: &'static str,
) -> Result<Bytes, PayloadError> {
    let len = get_u8(src, field)? as usize;
    if len > MAX_REVISION_LEN {
        return Err(PayloadError::TooLong { field, len });
    }
    if src.remaining() < len {
        return Err(PayloadError::Truncated(field));
    }
    Ok(src.split_to(len))
}

pub(crate) fn get_node_id(src: &mut Bytes) -> Result<NodeId, PayloadError> {
    if src.remaining() < NODE_ID_LEN {
        return Err(PayloadError::Truncated("node id"));
    }
    let bytes = src.split_to(NODE_ID_LEN);
    NodeId::from_slice(&bytes).map_err(|_| PayloadError::Truncated("node id"))
}

pub(crate) fn get_u8(src: &mut Bytes, field: &'static str) -> Result<u8, PayloadError> {
    if src.remaining() < 1 {
        return Err(PayloadError::Truncated(field));
    }
    Ok(src.get_u8())
}

pub(crate) fn get_u16(src: &mut Bytes, field: &'static str) -> Result<u16, PayloadError> {
    if src.remaining() < 2 {
        return Err(PayloadError::Truncated(field));
    }
    Ok(src.get_u16())
}

fn take_into(src: &mut Bytes, out: &mut [u8], field: &'static str) -> Result<(), PayloadError> {
    if src.remaining() < out.len() {
        return Err(PayloadError::Truncated(field));
    }
    src.copy_to_slice(out);
    Ok(())
}

pub(crate) fn expect_end(src: &Bytes) -> Result<(), PayloadError> {
    if src.has_remaining() {
        return Err(PayloadError::Trailing(src.remaining()));
    }
    Ok(())
}

// =============================================================================
// Active-node gossip
// =============================================================================

/// One tuple of an active-nodes response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveNodeEntry {
    pub id: NodeId,
    pub ip: IpAddr,
    pub port: u16,
    pub bin_version: String,
    pub best_block_number: u64,
    pub total_difficulty: u128,
}

/// Encode a `RES_ACTIVE_NODES` payload (extra entries are cut off)
pub fn encode_active_nodes(entries: &[ActiveNodeEntry]) -> Bytes {
    let entries = &entries[..entries.len().min(MAX_ACTIVE_NODES_PER_MESSAGE)];
    let mut buf = BytesMut::with_capacity(1 + entries.len() * 96);
    buf.put_u8(entries.len() as u8);
    for entry in entries {
        buf.put_slice(entry.id.as_bytes());
        put_ip(&mut buf, &entry.ip);
        buf.put_u16(entry.port);
        put_short_bytes(&mut buf, entry.bin_version.as_bytes());
        buf.put_u64(entry.best_block_number);
        buf.put_u128(entry.total_difficulty);
    }
    buf.freeze()
}

/// Decode a `RES_ACTIVE_NODES` payload
pub fn decode_active_nodes(payload: &Bytes) -> Result<Vec<ActiveNodeEntry>, PayloadError> {
    let mut src = payload.clone();
    let count = get_u8(&mut src, "node count")? as usize;
    if count > MAX_ACTIVE_NODES_PER_MESSAGE {
        return Err(PayloadError::TooLong {
            field: "active nodes",
            len: count,
        });
    }

    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        let id = get_node_id(&mut src)?;
        let ip = get_ip(&mut src)?;
        let port = get_u16(&mut src, "port")?;
        let bin_version = get_short_bytes(&mut src, "bin version")?;
        if src.remaining() < 8 + 16 {
            return Err(PayloadError::Truncated("chain info"));
        }
        let best_block_number = src.get_u64();
        let total_difficulty = src.get_u128();
        entries.push(ActiveNodeEntry {
            id,
            ip,
            port,
            bin_version: String::from_utf8_lossy(&bin_version).into_owned(),
            best_block_number,
            total_difficulty,
        });
    }
    expect_end(&src)?;
    Ok(entries)
}
