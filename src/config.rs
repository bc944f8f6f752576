//! Networking core configuration
//!
//! The host node owns config loading; this is the surface the core consumes.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// What `run()` does when the listening socket cannot be bound
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindFailurePolicy {
    /// Return the bind error to the caller; nothing is started
    Fail,
    /// Keep running without a listener; outbound dialing still works
    Degrade,
}

/// P2P configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct P2pConfig {
    /// Chain / network identifier; peers on other chains are rejected
    pub chain_id: u32,
    /// Self node id (36 bytes); generated when empty
    pub node_id: String,
    /// IP to bind and to advertise in the handshake
    pub ip: IpAddr,
    /// Port to listen on (0 picks an ephemeral port)
    pub port: u16,
    /// Boot nodes, `p2p://<id>@<ip>:<port>`
    pub boot_nodes: Vec<String>,
    /// Software revision advertised in handshakes
    pub revision: String,
    /// Try to map the listen port on the local router
    pub upnp_enabled: bool,
    /// Only talk to seed (boot list) nodes, no gossip
    pub sync_seeds_only: bool,
    pub max_temp_nodes: usize,
    pub max_active_nodes: usize,
    /// Post-handshake protocol violations tolerated before a ban
    pub error_tolerance: u32,
    /// Distinct peers whose error counters are remembered
    pub error_counter_capacity: usize,
    pub bind_failure_policy: BindFailurePolicy,

    pub writer_lanes: usize,
    pub dispatch_lanes: usize,
    /// Capacity of the shared send queue
    pub send_queue_capacity: usize,
    /// Capacity of each writer lane queue
    pub lane_queue_capacity: usize,
    /// Capacity of each lane's pending socket writes
    pub write_backlog: usize,
    /// Capacity of each dispatch lane queue
    pub receive_queue_capacity: usize,
    pub listen_backlog: u32,
    pub socket_buffer_size: u32,
    pub max_frame_body: usize,

    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    pub ban_duration_ms: u64,
    pub temp_node_ttl_ms: u64,

    pub connect_interval_ms: u64,
    pub status_interval_ms: u64,
    pub active_nodes_interval_ms: u64,
    pub eviction_interval_ms: u64,
    pub upnp_interval_ms: u64,
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            chain_id: 256,
            node_id: String::new(),
            ip: IpAddr::from([0, 0, 0, 0]),
            port: 30303,
            boot_nodes: Vec::new(),
            revision: format!("p2p-core/{}", env!("CARGO_PKG_VERSION")),
            upnp_enabled: false,
            sync_seeds_only: false,
            max_temp_nodes: 128,
            max_active_nodes: 128,
            error_tolerance: 50,
            error_counter_capacity: 1024,
            bind_failure_policy: BindFailurePolicy::Degrade,

            writer_lanes: 32,
            dispatch_lanes: 8,
            send_queue_capacity: 4096,
            lane_queue_capacity: 1024,
            write_backlog: 256,
            receive_queue_capacity: 1024,
            listen_backlog: 1024,
            socket_buffer_size: 8 * 1024 * 1024,
            max_frame_body: 2 * 1024 * 1024,

            connect_timeout_ms: 5_000,
            read_timeout_ms: 120_000,
            write_timeout_ms: 10_000,
            handshake_timeout_ms: 10_000,
            ban_duration_ms: 10 * 60 * 1000,
            temp_node_ttl_ms: 5 * 60 * 1000,

            connect_interval_ms: 1_000,
            status_interval_ms: 10_000,
            active_nodes_interval_ms: 5_000,
            eviction_interval_ms: 5_000,
            upnp_interval_ms: 50 * 60 * 1000,
        }
    }
}

impl P2pConfig {
    /// Parse a JSON config; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the core cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("writer_lanes", self.writer_lanes),
            ("dispatch_lanes", self.dispatch_lanes),
            ("send_queue_capacity", self.send_queue_capacity),
            ("lane_queue_capacity", self.lane_queue_capacity),
            ("write_backlog", self.write_backlog),
            ("receive_queue_capacity", self.receive_queue_capacity),
            ("error_counter_capacity", self.error_counter_capacity),
            ("max_active_nodes", self.max_active_nodes),
            ("max_frame_body", self.max_frame_body),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }

        let intervals = [
            ("read_timeout_ms", self.read_timeout_ms),
            ("connect_interval_ms", self.connect_interval_ms),
            ("status_interval_ms", self.status_interval_ms),
            ("active_nodes_interval_ms", self.active_nodes_interval_ms),
            ("eviction_interval_ms", self.eviction_interval_ms),
            ("upnp_interval_ms", self.upnp_interval_ms),
        ];
        for (field, value) in intervals {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "interval must be greater than zero".to_string(),
                });
            }
        }

        // The header carries the body length as a u32
        if u32::try_from(self.max_frame_body).is_err() {
            return Err(ConfigError::Invalid {
                field: "max_frame_body",
                reason: "does not fit the 32-bit length field".to_string(),
            });
        }

        if !self.node_id.is_empty() && self.node_id.len() != crate::network::NODE_ID_LEN {
            return Err(ConfigError::Invalid {
                field: "node_id",
                reason: format!(
                    "expected {} bytes, got {}",
                    crate::network::NODE_ID_LEN,
                    self.node_id.len()
                ),
            });
        }

        if self.revision.len() > crate::network::MAX_REVISION_LEN {
            return Err(ConfigError::Invalid {
                field: "revision",
                reason: "too long".to_string(),
            });
        }

        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn ban_duration(&self) -> Duration {
        Duration::from_millis(self.ban_duration_ms)
    }

    pub fn temp_node_ttl(&self) -> Duration {
        Duration::from_millis(self.temp_node_ttl_ms)
    }
}
