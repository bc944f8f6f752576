//! Handshake sub-protocol
//!
//! The dialing side sends a request carrying its identity and supported
//! versions; the accepting side validates it and answers with a response.
//! Both messages are built once from the manager's identity and cloned per
//! use.
//!
//! Request payload:
//! `id[36] | chain_id varint | ip (u8 len + 4/16 bytes) | port u16 |
//!  revision (u8 len + bytes) | versions (u8 count + u16 each)`
//!
//! Response payload: `accepted u8 | revision (u8 len + bytes)`

use crate::network::message::{
    act, expect_end, get_ip, get_node_id, get_short_bytes, get_u16, get_u8, get_varint, put_ip,
    put_short_bytes, put_varint, Frame, PayloadError,
};
use crate::network::node::NodeId;
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::BTreeSet;
use std::net::IpAddr;
use thiserror::Error;

/// Most versions a request may list
pub const MAX_VERSIONS: usize = 16;

/// Handshake failures. None of these count towards a ban.
#[derive(Error, Debug, PartialEq)]
pub enum HandshakeError {
    #[error("Malformed handshake: {0}")]
    Malformed(#[from] PayloadError),
    #[error("Chain id mismatch: ours {ours}, theirs {theirs}")]
    ChainMismatch { ours: u32, theirs: u32 },
    #[error("No common protocol version")]
    NoCommonVersion,
    #[error("Too many versions: {0}")]
    TooManyVersions(usize),
    #[error("Peer rejected the handshake")]
    Rejected,
    #[error("Unexpected {0} while handshaking")]
    Unexpected(&'static str),
}

/// Per-connection handshake progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Inbound socket waiting for the peer's request
    AwaitingRequest,
    /// Outbound socket waiting for the peer's response
    AwaitingResponse,
    /// Peer accepted by validation, not yet in the active set
    Validated,
    Active,
    /// Terminal; the socket is closed
    Rejected,
}

impl HandshakeState {
    pub fn initial(outbound: bool) -> Self {
        if outbound {
            Self::AwaitingResponse
        } else {
            Self::AwaitingRequest
        }
    }

    pub fn is_active(self) -> bool {
        self == Self::Active
    }
}

/// Handshake request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    pub id: NodeId,
    pub chain_id: u32,
    pub ip: IpAddr,
    pub port: u16,
    pub revision: Bytes,
    pub versions: Vec<u16>,
}

impl HandshakeRequest {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64 + self.revision.len() + self.versions.len() * 2);
        buf.put_slice(self.id.as_bytes());
        put_varint(&mut buf, self.chain_id as u64);
        put_ip(&mut buf, &self.ip);
        buf.put_u16(self.port);
        put_short_bytes(&mut buf, &self.revision);
        let versions = &self.versions[..self.versions.len().min(MAX_VERSIONS)];
        buf.put_u8(versions.len() as u8);
        for version in versions {
            buf.put_u16(*version);
        }
        buf.freeze()
    }

    pub fn decode(payload: &Bytes) -> Result<Self, HandshakeError> {
        let mut src = payload.clone();
        let id = get_node_id(&mut src)?;
        let chain_id = get_varint(&mut src)?;
        let chain_id = u32::try_from(chain_id).map_err(|_| PayloadError::VarintOverflow)?;
        let ip = get_ip(&mut src)?;
        let port = get_u16(&mut src, "port")?;
        let revision = get_short_bytes(&mut src, "revision")?;

        let count = get_u8(&mut src, "version count")? as usize;
        if count > MAX_VERSIONS {
            return Err(HandshakeError::TooManyVersions(count));
        }
        let mut versions = Vec::with_capacity(count);
        for _ in 0..count {
            versions.push(get_u16(&mut src, "version")?);
        }
        expect_end(&src)?;

        Ok(Self {
            id,
            chain_id,
            ip,
            port,
            revision,
            versions,
        })
    }

    pub fn to_frame(&self) -> Frame {
        Frame::net(act::REQ_HANDSHAKE, self.encode())
    }

    /// Checks chain id and version overlap. Identity checks belong to the
    /// registry.
    pub fn check_compatible(
        &self,
        chain_id: u32,
        supported: &BTreeSet<u16>,
    ) -> Result<(), HandshakeError> {
        if self.chain_id != chain_id {
            return Err(HandshakeError::ChainMismatch {
                ours: chain_id,
                theirs: self.chain_id,
            });
        }
        // A peer with no app protocols is only useful for gossip; allow it
        // when we have none either.
        if supported.is_empty() && self.versions.is_empty() {
            return Ok(());
        }
        if !self.versions.iter().any(|v| supported.contains(v)) {
            return Err(HandshakeError::NoCommonVersion);
        }
        Ok(())
    }
}

/// Handshake response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResponse {
    pub accepted: bool,
    pub revision: Bytes,
}

impl HandshakeResponse {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(2 + self.revision.len());
        buf.put_u8(self.accepted as u8);
        put_short_bytes(&mut buf, &self.revision);
        buf.freeze()
    }

    pub fn decode(payload: &Bytes) -> Result<Self, HandshakeError> {
        let mut src = payload.clone();
        let accepted = match get_u8(&mut src, "accepted")? {
            0 => false,
            1 => true,
            _ => return Err(HandshakeError::Unexpected("accept flag")),
        };
        let revision = get_short_bytes(&mut src, "revision")?;
        expect_end(&src)?;
        Ok(Self { accepted, revision })
    }

    pub fn to_frame(&self) -> Frame {
        Frame::net(act::RES_HANDSHAKE, self.encode())
    }

    /// Revision text as advertised by the responder
    pub fn revision_string(&self) -> String {
        String::from_utf8_lossy(&self.revision).into_owned()
    }
}

/// Cached handshake frames built from the manager's identity
#[derive(Debug, Clone)]
pub struct HandshakeTemplates {
    pub request: Frame,
    pub accept: Frame,
    pub reject: Frame,
}

impl HandshakeTemplates {
    pub fn build(
        id: NodeId,
        chain_id: u32,
        ip: IpAddr,
        port: u16,
        revision: &str,
        versions: &BTreeSet<u16>,
    ) -> Self {
        let revision = Bytes::copy_from_slice(revision.as_bytes());
        let request = HandshakeRequest {
            id,
            chain_id,
            ip,
            port,
            revision: revision.clone(),
            versions: versions.iter().copied().collect(),
        };
        let accept = HandshakeResponse {
            accepted: true,
            revision: revision.clone(),
        };
        let reject = HandshakeResponse {
            accepted: false,
            revision,
        };

        Self {
            request: request.to_frame(),
            accept: accept.to_frame(),
            reject: reject.to_frame(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(versions: Vec<u16>) -> HandshakeRequest {
        HandshakeRequest {
            id: NodeId::generate(),
            chain_id: 256,
            ip: IpAddr::from([10, 1, 2, 3]),
            port: 30303,
            revision: Bytes::from_static(b"p2p-core/0.1.0"),
            versions,
        }
    }

    #[test]
    fn test_request_versions_survive_decode() {
        let req = request(vec![1, 2, 3]);
        let decoded = HandshakeRequest::decode(&req.encode()).unwrap();
        assert_eq!(decoded.versions, vec![1, 2, 3]);
        assert_eq!(decoded, req);
    }

    #[test]
    fn test_request_ipv6() {
        let mut req = request(vec![1]);
        req.ip = "2001:db8::7".parse().unwrap();
        assert_eq!(HandshakeRequest::decode(&req.encode()).unwrap().ip, req.ip);
    }

    #[test]
    fn test_response_accept_flag() {
        let yes = HandshakeResponse {
            accepted: true,
            revision: Bytes::from_static(b"r1"),
        };
        let no = HandshakeResponse {
            accepted: false,
            revision: Bytes::from_static(b"r1"),
        };
        assert!(HandshakeResponse::decode(&yes.encode()).unwrap().accepted);
        assert!(!HandshakeResponse::decode(&no.encode()).unwrap().accepted);
    }

    #[test]
    fn test_malformed_request() {
        let bytes = request(vec![1, 2]).encode();
        let cut = bytes.slice(..bytes.len() - 1);
        assert!(matches!(
            HandshakeRequest::decode(&cut),
            Err(HandshakeError::Malformed(PayloadError::Truncated(_)))
        ));
        assert!(HandshakeRequest::decode(&Bytes::from_static(b"tiny")).is_err());
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = BytesMut::from(&request(vec![1]).encode()[..]);
        bytes.put_u8(9);
        assert!(matches!(
            HandshakeRequest::decode(&bytes.freeze()),
            Err(HandshakeError::Malformed(PayloadError::Trailing(1)))
        ));
    }

    #[test]
    fn test_compatibility() {
        let supported: BTreeSet<u16> = [2, 5].into_iter().collect();
        assert!(request(vec![1, 2]).check_compatible(256, &supported).is_ok());
        assert_eq!(
            request(vec![1, 3]).check_compatible(256, &supported),
            Err(HandshakeError::NoCommonVersion)
        );
        assert!(matches!(
            request(vec![2]).check_compatible(1, &supported),
            Err(HandshakeError::ChainMismatch { ours: 1, theirs: 256 })
        ));
        assert!(request(vec![]).check_compatible(256, &BTreeSet::new()).is_ok());
    }

    #[test]
    fn test_templates() {
        let versions: BTreeSet<u16> = [1, 2].into_iter().collect();
        let id = NodeId::generate();
        let templates =
            HandshakeTemplates::build(id, 7, IpAddr::from([1, 2, 3, 4]), 9, "rev", &versions);

        let req = HandshakeRequest::decode(&templates.request.payload).unwrap();
        assert_eq!(req.id, id);
        assert_eq!(req.versions, vec![1, 2]);
        assert_eq!(templates.accept.action, act::RES_HANDSHAKE);
        assert!(!HandshakeResponse::decode(&templates.reject.payload).unwrap().accepted);
    }

    #[test]
    fn test_initial_state() {
        assert_eq!(HandshakeState::initial(true), HandshakeState::AwaitingResponse);
        assert_eq!(HandshakeState::initial(false), HandshakeState::AwaitingRequest);
        assert!(!HandshakeState::Validated.is_active());
    }
}
