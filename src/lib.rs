//! p2p-core: the peer-to-peer networking core of a blockchain node
//!
//! Discovers peers, authenticates them with a versioned handshake, and
//! exchanges length-prefixed binary frames over TCP. Application protocols
//! plug in as [`network::Handler`]s keyed by `(version, ctrl, action)`.
//!
//! # Example
//!
//! ```no_run
//! use p2p_core::config::P2pConfig;
//! use p2p_core::network::{Frame, P2pManager};
//!
//! # async fn example() -> Result<(), p2p_core::network::P2pError> {
//! let manager = P2pManager::new(P2pConfig::default())?;
//! manager.run().await?;
//!
//! // Send to whoever is connected
//! if let Some(peer) = manager.get_random_active() {
//!     manager.send(peer.id_hash, Frame::new(1, 1, 0, b"hello".to_vec()));
//! }
//!
//! manager.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod network;

pub use config::{BindFailurePolicy, ConfigError, P2pConfig};
pub use network::{Handler, HandlerHeader, P2pError, P2pManager};
