//! State shared by the connection tasks
//!
//! Built once by `P2pManager::run()` and handed to the acceptor, connector,
//! readers and maintenance tasks as an `Arc`.

use crate::config::P2pConfig;
use crate::network::dispatch::{Dispatcher, HandlerTable};
use crate::network::handshake::HandshakeTemplates;
use crate::network::message::Frame;
use crate::network::outbound::{Destination, Outbound, OutboundMessage, OutboundSettings};
use crate::network::registry::NodeRegistry;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::io;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Per-node protocol error counters.
///
/// Bounded LRU so that peer churn cannot grow it without limit.
pub struct ErrorCounters {
    tolerance: u32,
    counters: Mutex<LruCache<u32, u32>>,
}

impl ErrorCounters {
    pub fn new(tolerance: u32, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            tolerance,
            counters: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Count one error; true when the tolerance is crossed, which also
    /// resets the counter
    pub fn record(&self, id_hash: u32) -> bool {
        let mut counters = self.counters.lock();
        let count = match counters.get_mut(&id_hash) {
            Some(count) => {
                *count += 1;
                *count
            }
            None => {
                counters.put(id_hash, 1);
                1
            }
        };
        if count > self.tolerance {
            counters.pop(&id_hash);
            return true;
        }
        false
    }

    pub fn count(&self, id_hash: u32) -> u32 {
        self.counters.lock().peek(&id_hash).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.counters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Count an error and ban + drop the node once it crosses the tolerance
    pub fn err_check(&self, registry: &NodeRegistry, id_hash: u32, display_id: &str) -> bool {
        if !self.record(id_hash) {
            return false;
        }
        log::warn!(
            "Node {} exceeded error tolerance ({}), banning",
            display_id,
            self.tolerance
        );
        registry.ban(id_hash);
        registry.drop_active(id_hash, "error tolerance exceeded");
        true
    }
}

/// Everything a connection task needs
pub struct NetContext {
    pub config: P2pConfig,
    pub registry: Arc<NodeRegistry>,
    pub handlers: Arc<HandlerTable>,
    pub templates: Arc<RwLock<HandshakeTemplates>>,
    pub errors: Arc<ErrorCounters>,
    pub outbound: Outbound,
    pub dispatcher: Arc<Dispatcher>,
    pub running: Arc<AtomicBool>,
    pub shutdown: CancellationToken,
    /// Outstanding active-node requests, for latency
    pub gossip_requests: Mutex<HashMap<u32, Instant>>,
}

impl NetContext {
    /// Spawn the outbound and dispatch pipelines and wrap them in a context.
    /// Fails only if a dispatch thread cannot be started.
    pub fn start(
        config: P2pConfig,
        registry: Arc<NodeRegistry>,
        handlers: Arc<HandlerTable>,
        templates: Arc<RwLock<HandshakeTemplates>>,
        errors: Arc<ErrorCounters>,
        running: Arc<AtomicBool>,
        shutdown: CancellationToken,
    ) -> io::Result<(Arc<Self>, Vec<JoinHandle<()>>)> {
        let (dispatcher, dispatch_handle) = Dispatcher::spawn(
            config.dispatch_lanes,
            config.receive_queue_capacity,
            handlers.clone(),
            shutdown.clone(),
        )?;
        let (outbound, mut handles) = Outbound::spawn(
            OutboundSettings::from_config(&config),
            registry.clone(),
            shutdown.clone(),
        );
        handles.push(dispatch_handle);

        let ctx = Arc::new(Self {
            config,
            registry,
            handlers,
            templates,
            errors,
            outbound,
            dispatcher,
            running,
            shutdown,
            gossip_requests: Mutex::new(HashMap::new()),
        });
        Ok((ctx, handles))
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) && !self.shutdown.is_cancelled()
    }

    pub fn err_check(&self, id_hash: u32, display_id: &str) -> bool {
        self.errors.err_check(&self.registry, id_hash, display_id)
    }

    pub fn send_to(&self, dest: Destination, frame: Frame) -> bool {
        self.outbound.send(OutboundMessage::new(dest, frame))
    }

    pub fn handshake_request(&self) -> Frame {
        self.templates.read().request.clone()
    }

    pub fn handshake_accept(&self) -> Frame {
        self.templates.read().accept.clone()
    }

    pub fn handshake_reject(&self) -> Frame {
        self.templates.read().reject.clone()
    }

    /// Round trip of an outstanding active-nodes request, if any
    pub fn take_gossip_latency(&self, id_hash: u32) -> Option<Duration> {
        self.gossip_requests
            .lock()
            .remove(&id_hash)
            .map(|sent| sent.elapsed())
    }

    /// Forget requests that were never answered
    pub fn prune_gossip_requests(&self, max_age: Duration) -> usize {
        let mut requests = self.gossip_requests.lock();
        let before = requests.len();
        requests.retain(|_, sent| sent.elapsed() < max_age);
        before - requests.len()
    }
}

/// A started context on a loopback identity, for unit tests
#[cfg(test)]
pub(crate) fn test_context(config: P2pConfig) -> Arc<NetContext> {
    use crate::network::node::NodeId;
    use crate::network::registry::{LocalIdentity, RegistryLimits};
    use std::collections::BTreeSet;
    use std::net::IpAddr;

    let local = LocalIdentity::new(NodeId::generate(), IpAddr::from([127, 0, 0, 1]), 30303);
    let templates = HandshakeTemplates::build(
        local.id,
        config.chain_id,
        local.ip,
        local.port,
        &config.revision,
        &BTreeSet::new(),
    );
    let registry = Arc::new(NodeRegistry::new(local, RegistryLimits::from_config(&config)));
    let errors = Arc::new(ErrorCounters::new(
        config.error_tolerance,
        config.error_counter_capacity,
    ));
    let (ctx, _handles) = NetContext::start(
        config,
        registry,
        Arc::new(HandlerTable::new()),
        Arc::new(RwLock::new(templates)),
        errors,
        Arc::new(AtomicBool::new(true)),
        CancellationToken::new(),
    )
    .unwrap();
    ctx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::node::{Node, NodeId};
    use crate::network::registry::{Connection, Direction, LocalIdentity, RegistryLimits};
    use std::net::IpAddr;

    fn active_registry() -> (NodeRegistry, Node) {
        let local = LocalIdentity::new(NodeId::generate(), IpAddr::from([10, 0, 0, 1]), 1);
        let registry = NodeRegistry::new(
            local,
            RegistryLimits {
                max_temp_nodes: 8,
                max_active_nodes: 8,
                ban_duration: Duration::from_secs(60),
                temp_node_ttl: Duration::from_secs(60),
                handshake_timeout: Duration::from_secs(60),
            },
        );
        let node = Node::new(NodeId::generate(), IpAddr::from([10, 0, 0, 2]), 2);
        let conn = Connection::new(
            registry.next_conn_id(),
            "10.0.0.2:2".parse().unwrap(),
            Direction::Outbound,
            tokio::io::sink(),
            CancellationToken::new(),
        );
        let conn_id = conn.id;
        registry.promote_to_outbound(node.clone(), conn).unwrap();
        registry
            .promote_to_active(conn_id, Direction::Outbound, node.clone())
            .unwrap();
        (registry, node)
    }

    #[test]
    fn test_ban_after_tolerance() {
        let (registry, node) = active_registry();
        let tolerance = 3;
        let errors = ErrorCounters::new(tolerance, 16);

        let mut bans = 0;
        for _ in 0..=tolerance {
            if errors.err_check(&registry, node.id_hash, "test") {
                bans += 1;
            }
        }

        assert_eq!(bans, 1);
        assert_eq!(errors.count(node.id_hash), 0);
        assert!(registry.is_banned(node.id_hash));
        assert!(registry.not_active_node(node.id_hash));
    }

    #[test]
    fn test_below_tolerance_no_ban() {
        let (registry, node) = active_registry();
        let errors = ErrorCounters::new(3, 16);
        for _ in 0..3 {
            assert!(!errors.err_check(&registry, node.id_hash, "test"));
        }
        assert_eq!(errors.count(node.id_hash), 3);
        assert!(!registry.not_active_node(node.id_hash));
    }

    #[test]
    fn test_counters_bounded() {
        let errors = ErrorCounters::new(10, 4);
        for id in 0..100 {
            errors.record(id);
        }
        assert_eq!(errors.len(), 4);
        assert_eq!(errors.count(0), 0);
        assert_eq!(errors.count(99), 1);
    }
}
