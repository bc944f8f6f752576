//! P2P manager
//!
//! Owns the registry, handler table and every background task. The rest of
//! the node talks to the network only through this type.

use crate::config::{BindFailurePolicy, ConfigError, P2pConfig};
use crate::network::context::{ErrorCounters, NetContext};
use crate::network::dispatch::{Handler, HandlerTable};
use crate::network::handshake::HandshakeTemplates;
use crate::network::message::Frame;
use crate::network::node::{Node, NodeId, NodeParseError};
use crate::network::outbound::{Destination, OutboundStats};
use crate::network::registry::{LocalIdentity, NodeRegistry, RegistryCounts, RegistryError, RegistryLimits};
use crate::network::server::{run_connector, Server};
use crate::network::tasks::spawn_maintenance;
use crate::network::upnp::{UpnpManager, UpnpStatus};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How long shutdown waits for each background task
const TASK_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum P2pError {
    #[error("Invalid config: {0}")]
    Config(#[from] ConfigError),
    #[error("Invalid node id: {0}")]
    NodeId(NodeParseError),
    #[error("Invalid boot node {uri}: {source}")]
    BootNode {
        uri: String,
        #[source]
        source: NodeParseError,
    },
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to start dispatch threads: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("Manager already shut down")]
    ShutDown,
}

/// Read-only view for status and RPC reporting
#[derive(Debug, Clone, Serialize)]
pub struct P2pStatus {
    pub node_id: String,
    pub chain_id: u32,
    pub running: bool,
    pub local_addr: Option<SocketAddr>,
    pub counts: RegistryCounts,
    pub average_latency_ms: Option<u64>,
    pub outbound: OutboundStats,
    pub receive_dropped: u64,
    pub upnp: UpnpStatus,
}

/// Set once `run()` has started the network
struct Started {
    ctx: Arc<NetContext>,
    local_addr: Option<SocketAddr>,
    tasks: Vec<JoinHandle<()>>,
}

pub struct P2pManager {
    config: P2pConfig,
    local_id: NodeId,
    registry: Arc<NodeRegistry>,
    handlers: Arc<HandlerTable>,
    templates: Arc<RwLock<HandshakeTemplates>>,
    errors: Arc<ErrorCounters>,
    upnp: Arc<UpnpManager>,
    running: Arc<AtomicBool>,
    shutdown: CancellationToken,
    starting: AtomicBool,
    stopped: AtomicBool,
    started: Mutex<Option<Started>>,
}

impl P2pManager {
    /// Validate the config, settle our identity and queue the boot nodes.
    /// Nothing touches the network until `run()`.
    pub fn new(config: P2pConfig) -> Result<Self, P2pError> {
        config.validate()?;

        let local_id = if config.node_id.is_empty() {
            NodeId::generate()
        } else {
            config.node_id.parse().map_err(P2pError::NodeId)?
        };
        let boot_nodes = config
            .boot_nodes
            .iter()
            .map(|uri| {
                Node::parse_boot(uri).map_err(|source| P2pError::BootNode {
                    uri: uri.clone(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let local = LocalIdentity::new(local_id, config.ip, config.port);
        let registry = Arc::new(NodeRegistry::new(local, RegistryLimits::from_config(&config)));
        let queued = registry.add_boot_nodes(boot_nodes);

        let handlers = Arc::new(HandlerTable::new());
        let templates = HandshakeTemplates::build(
            local_id,
            config.chain_id,
            config.ip,
            config.port,
            &config.revision,
            &handlers.versions(),
        );
        let errors = Arc::new(ErrorCounters::new(
            config.error_tolerance,
            config.error_counter_capacity,
        ));
        let upnp = Arc::new(UpnpManager::new(
            config.upnp_enabled,
            Duration::from_millis(config.upnp_interval_ms),
        ));

        log::info!(
            "P2P node {} on chain {} ({} boot nodes queued)",
            local_id.display_id(),
            config.chain_id,
            queued
        );

        Ok(Self {
            config,
            local_id,
            registry,
            handlers,
            templates: Arc::new(RwLock::new(templates)),
            errors,
            upnp,
            running: Arc::new(AtomicBool::new(false)),
            shutdown: CancellationToken::new(),
            starting: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            started: Mutex::new(None),
        })
    }

    /// Add handlers and refresh the advertised protocol versions
    pub fn register(&self, handlers: Vec<Arc<dyn Handler>>) {
        let versions = self.handlers.register(handlers);
        log::info!(
            "Handlers registered: {} routes, versions {:?}",
            self.handlers.route_count(),
            versions
        );
        self.rebuild_templates();
    }

    fn rebuild_templates(&self) {
        let local = self.registry.local();
        *self.templates.write() = HandshakeTemplates::build(
            local.id,
            self.config.chain_id,
            local.ip,
            local.port,
            &self.config.revision,
            &self.handlers.versions(),
        );
    }

    /// Bind, then start every pipeline and task. Calling it again is a
    /// no-op.
    pub async fn run(&self) -> Result<(), P2pError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(P2pError::ShutDown);
        }
        if self.starting.swap(true, Ordering::SeqCst) {
            log::debug!("P2P manager already running");
            return Ok(());
        }

        let server = match Server::bind(&self.config).await {
            Ok(server) => Some(server),
            Err(source) => {
                let addr = SocketAddr::new(self.config.ip, self.config.port);
                log::error!("Failed to bind {}: {}", addr, source);
                match self.config.bind_failure_policy {
                    BindFailurePolicy::Fail => {
                        self.starting.store(false, Ordering::SeqCst);
                        return Err(P2pError::Bind { addr, source });
                    }
                    BindFailurePolicy::Degrade => {
                        log::warn!("Continuing without a listener; outbound dialing only");
                        None
                    }
                }
            }
        };

        let local_addr = server.as_ref().map(Server::local_addr);
        if let Some(addr) = local_addr {
            if addr.port() != self.registry.local().port {
                self.registry.set_local_port(addr.port());
                self.rebuild_templates();
            }
        }

        let (ctx, mut tasks) = match NetContext::start(
            self.config.clone(),
            self.registry.clone(),
            self.handlers.clone(),
            self.templates.clone(),
            self.errors.clone(),
            self.running.clone(),
            self.shutdown.clone(),
        ) {
            Ok(started) => started,
            Err(e) => {
                log::error!("Failed to start dispatch threads: {}", e);
                self.starting.store(false, Ordering::SeqCst);
                return Err(P2pError::Spawn(e));
            }
        };
        self.running.store(true, Ordering::SeqCst);

        if let Some(server) = server {
            tasks.push(tokio::spawn(server.run(ctx.clone())));
        }
        tasks.push(tokio::spawn(run_connector(ctx.clone())));
        tasks.extend(spawn_maintenance(&ctx));

        if let (true, Some(addr)) = (self.upnp.is_enabled(), local_addr) {
            tasks.push(self.upnp.clone().spawn_refresh(
                addr.port(),
                Duration::from_millis(self.config.upnp_interval_ms),
                self.shutdown.clone(),
            ));
        }

        log::info!(
            "P2P manager running ({} tasks, listening on {})",
            tasks.len(),
            local_addr.map_or_else(|| "nothing".to_string(), |a| a.to_string())
        );
        *self.started.lock() = Some(Started {
            ctx,
            local_addr,
            tasks,
        });
        Ok(())
    }

    fn context(&self) -> Option<Arc<NetContext>> {
        self.started.lock().as_ref().map(|s| s.ctx.clone())
    }

    /// Queue a frame for an active node. Delivery is best effort; false
    /// means it was dropped before reaching the send queue, which includes
    /// bodies over `max_frame_body`.
    pub fn send(&self, id_hash: u32, frame: Frame) -> bool {
        if frame.is_net() {
            log::warn!("Refusing to send reserved route {:?}", frame.route());
            return false;
        }
        match self.context() {
            Some(ctx) if ctx.is_running() => ctx.send_to(Destination::Active(id_hash), frame),
            _ => false,
        }
    }

    /// Send to every active node; returns how many were queued
    pub fn broadcast(&self, frame: Frame) -> usize {
        self.registry
            .get_active_nodes_snapshot()
            .into_keys()
            .filter(|id_hash| self.send(*id_hash, frame.clone()))
            .count()
    }

    /// Count a protocol error against a node; true when it was banned
    pub fn err_check(&self, id_hash: u32) -> bool {
        let display_id = self
            .registry
            .get_active(id_hash)
            .map(|n| n.display_id())
            .unwrap_or_else(|| format!("{:08x}", id_hash));
        self.errors.err_check(&self.registry, id_hash, &display_id)
    }

    /// Queue a node to be dialed
    pub fn add_node(&self, node: Node) -> Result<(), RegistryError> {
        self.registry.add_temp(node)
    }

    pub fn update_chain_info(&self, id_hash: u32, best_block_number: u64, total_difficulty: u128) {
        self.registry
            .update_chain_info(id_hash, best_block_number, total_difficulty);
    }

    pub fn get_active_nodes(&self) -> Vec<Node> {
        self.registry
            .get_active_nodes_snapshot()
            .into_values()
            .collect()
    }

    pub fn get_random_active(&self) -> Option<Node> {
        self.registry.get_random_active()
    }

    pub fn active_count(&self) -> usize {
        self.registry.counts().active
    }

    pub fn counts(&self) -> RegistryCounts {
        self.registry.counts()
    }

    pub fn average_latency_ms(&self) -> Option<u64> {
        self.registry.average_latency_ms()
    }

    pub fn is_banned(&self, id_hash: u32) -> bool {
        self.registry.is_banned(id_hash)
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    /// Listening address, once bound
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.started.lock().as_ref().and_then(|s| s.local_addr)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> P2pStatus {
        let ctx = self.context();
        P2pStatus {
            node_id: self.local_id.to_string(),
            chain_id: self.config.chain_id,
            running: self.is_running(),
            local_addr: self.local_addr(),
            counts: self.registry.counts(),
            average_latency_ms: self.registry.average_latency_ms(),
            outbound: ctx.as_ref().map(|c| c.outbound.stats()).unwrap_or_default(),
            receive_dropped: ctx.as_ref().map_or(0, |c| c.dispatcher.dropped()),
            upnp: self.upnp.status(),
        }
    }

    /// Stop everything and release every socket. Later calls do nothing.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("Shutting down P2P manager");

        self.running.store(false, Ordering::SeqCst);
        self.shutdown.cancel();
        self.handlers.shut_down_all();
        let closed = self.registry.close_all();

        let started = self.started.lock().take();
        if let Some(started) = started {
            if started.local_addr.is_some() {
                self.upnp.unmap().await;
            }
            for mut task in started.tasks {
                if tokio::time::timeout(TASK_JOIN_TIMEOUT, &mut task)
                    .await
                    .is_err()
                {
                    task.abort();
                }
            }
        }
        log::info!("P2P manager stopped ({} connections closed)", closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::dispatch::{HandlerError, HandlerHeader};
    use crate::network::handshake::HandshakeRequest;
    use crate::network::message::ctrl;
    use std::net::IpAddr;
    use std::sync::atomic::AtomicUsize;

    fn local_config() -> P2pConfig {
        P2pConfig {
            ip: IpAddr::from([127, 0, 0, 1]),
            port: 0,
            ..P2pConfig::default()
        }
    }

    struct CountingHandler {
        header: HandlerHeader,
        shut_down: Arc<AtomicUsize>,
    }

    impl Handler for CountingHandler {
        fn header(&self) -> HandlerHeader {
            self.header
        }

        fn receive(&self, _: u32, _: &str, _: &[u8]) -> Result<(), HandlerError> {
            Ok(())
        }

        fn shut_down(&self) {
            self.shut_down.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_bad_boot_node_rejected() {
        let config = P2pConfig {
            boot_nodes: vec!["tcp://1.2.3.4:30303".to_string()],
            ..local_config()
        };
        assert!(matches!(
            P2pManager::new(config),
            Err(P2pError::BootNode { .. })
        ));
    }

    #[test]
    fn test_boot_nodes_queued() {
        let id = NodeId::generate();
        let config = P2pConfig {
            boot_nodes: vec![format!("p2p://{}@10.0.0.7:30303", id)],
            ..local_config()
        };
        let manager = P2pManager::new(config).unwrap();
        assert_eq!(manager.counts().temp, 1);
    }

    #[test]
    fn test_configured_node_id_used() {
        let id = NodeId::generate();
        let config = P2pConfig {
            node_id: id.to_string(),
            ..local_config()
        };
        assert_eq!(P2pManager::new(config).unwrap().local_id(), id);
    }

    #[test]
    fn test_register_updates_handshake_versions() {
        let manager = P2pManager::new(local_config()).unwrap();
        let shut_down = Arc::new(AtomicUsize::new(0));
        manager.register(vec![
            Arc::new(CountingHandler {
                header: HandlerHeader::new(2, ctrl::SYNC, 0),
                shut_down: shut_down.clone(),
            }),
            Arc::new(CountingHandler {
                header: HandlerHeader::new(3, ctrl::SYNC, 1),
                shut_down,
            }),
        ]);

        let request = manager.templates.read().request.clone();
        let decoded = HandshakeRequest::decode(&request.payload).unwrap();
        assert_eq!(decoded.versions, vec![2, 3]);
        assert_eq!(decoded.id, manager.local_id());
    }

    #[tokio::test]
    async fn test_run_is_idempotent_and_advertises_bound_port() {
        let manager = P2pManager::new(local_config()).unwrap();
        manager.run().await.unwrap();
        let addr = manager.local_addr().unwrap();
        manager.run().await.unwrap();
        assert_eq!(manager.local_addr(), Some(addr));

        let request = manager.templates.read().request.clone();
        let decoded = HandshakeRequest::decode(&request.payload).unwrap();
        assert_eq!(decoded.port, addr.port());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_bind_failure_policy() {
        let first = P2pManager::new(local_config()).unwrap();
        first.run().await.unwrap();
        let taken = first.local_addr().unwrap().port();

        let failing = P2pManager::new(P2pConfig {
            port: taken,
            bind_failure_policy: BindFailurePolicy::Fail,
            ..local_config()
        })
        .unwrap();
        assert!(matches!(failing.run().await, Err(P2pError::Bind { .. })));
        assert!(!failing.is_running());

        let degraded = P2pManager::new(P2pConfig {
            port: taken,
            bind_failure_policy: BindFailurePolicy::Degrade,
            ..local_config()
        })
        .unwrap();
        degraded.run().await.unwrap();
        assert!(degraded.is_running());
        assert!(degraded.local_addr().is_none());

        degraded.shutdown().await;
        first.shutdown().await;
    }

    #[tokio::test]
    async fn test_send_refuses_reserved_route() {
        let manager = P2pManager::new(local_config()).unwrap();
        manager.run().await.unwrap();
        assert!(!manager.send(1, Frame::net(0, vec![1u8])));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_send_before_run_dropped() {
        let manager = P2pManager::new(local_config()).unwrap();
        assert!(!manager.send(1, Frame::new(1, ctrl::SYNC, 0, vec![1u8])));
    }

    #[tokio::test]
    async fn test_shutdown_twice_calls_handlers_once() {
        let manager = P2pManager::new(local_config()).unwrap();
        let shut_down = Arc::new(AtomicUsize::new(0));
        manager.register(vec![Arc::new(CountingHandler {
            header: HandlerHeader::new(1, ctrl::SYNC, 0),
            shut_down: shut_down.clone(),
        })]);
        manager.run().await.unwrap();

        manager.shutdown().await;
        manager.shutdown().await;
        assert_eq!(shut_down.load(Ordering::SeqCst), 1);
        assert!(!manager.is_running());
        assert!(matches!(manager.run().await, Err(P2pError::ShutDown)));
    }

    #[test]
    fn test_status_before_run() {
        let manager = P2pManager::new(local_config()).unwrap();
        let status = manager.status();
        assert!(!status.running);
        assert!(status.local_addr.is_none());
        assert_eq!(status.outbound, OutboundStats::default());
        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"chain_id\""));
    }
}
