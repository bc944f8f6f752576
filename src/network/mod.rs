//! P2P Networking module
//!
//! TCP transport for a blockchain node: peer discovery, a handshake with
//! version negotiation, framed messages routed to registered handlers, and
//! per-peer error tolerance with bans.
//!
//! # Layout
//! - `registry`: temp, outbound, inbound and active node sets
//! - `handshake`, `message`, `codec`: wire formats
//! - `server`: listener and outbound dialer
//! - `inbound`, `dispatch`: read side and handler workers
//! - `outbound`: send queue and writer lanes
//! - `tasks`, `upnp`: periodic maintenance
//! - `manager`: the facade the rest of the node uses

pub mod codec;
pub mod context;
pub mod dispatch;
pub mod handshake;
pub mod inbound;
pub mod manager;
pub mod message;
pub mod node;
pub mod outbound;
pub mod registry;
pub mod server;
pub mod tasks;
pub mod upnp;

pub use codec::{CodecError, FrameCodec};
pub use dispatch::{Handler, HandlerError, HandlerHeader, InboundMessage};
pub use handshake::{HandshakeError, HandshakeRequest, HandshakeResponse, HandshakeState};
pub use manager::{P2pError, P2pManager, P2pStatus};
pub use message::{
    act, ctrl, ActiveNodeEntry, Frame, Header, Route, HEADER_LEN, MAX_ACTIVE_NODES_PER_MESSAGE,
    MAX_REVISION_LEN, NET_VERSION,
};
pub use node::{Node, NodeId, NodeParseError, NODE_ID_LEN};
pub use outbound::{Destination, OutboundStats};
pub use registry::{ConnId, Direction, NodeRegistry, NodeSet, RegistryCounts, RegistryError};
pub use server::{connect_to_peer, Server};
pub use upnp::{UpnpError, UpnpManager, UpnpStatus};
