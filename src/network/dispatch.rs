//! Handler registration and dispatch workers
//!
//! Decoded application frames are routed to a dispatch lane chosen with the
//! same hash the writer lanes use, so every handler sees one peer's messages
//! in arrival order. Each handler call is isolated: an error or panic in one
//! handler is logged and the next handler and the next message still run.
//!
//! Handlers are synchronous and may block, so every lane drains on its own
//! OS thread rather than on the runtime. The lane's queue take is the only
//! place a worker waits.

use crate::network::message::{ctrl, Route};
use crate::network::outbound::lane_for;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Error type handlers may return
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// The route and protocol version a handler serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerHeader {
    pub version: u16,
    pub ctrl: u8,
    pub action: u8,
}

impl HandlerHeader {
    pub const fn new(version: u16, ctrl: u8, action: u8) -> Self {
        Self {
            version,
            ctrl,
            action,
        }
    }

    pub fn route(&self) -> Route {
        Route::new(self.ctrl, self.action)
    }
}

/// Application message handler.
///
/// `receive` runs on a dispatch lane thread. Blocking there delays only the
/// peers that share the lane.
pub trait Handler: Send + Sync {
    fn header(&self) -> HandlerHeader;

    fn receive(&self, id_hash: u32, display_id: &str, payload: &[u8]) -> Result<(), HandlerError>;

    /// Called once when the manager shuts down
    fn shut_down(&self) {}
}

/// A decoded frame waiting for dispatch
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub id_hash: u32,
    pub display_id: String,
    pub version: u16,
    pub route: Route,
    pub payload: Bytes,
}

/// Handlers by route; read-mostly after registration
#[derive(Default)]
pub struct HandlerTable {
    routes: RwLock<HashMap<Route, Vec<Arc<dyn Handler>>>>,
    versions: RwLock<BTreeSet<u16>>,
    registered: Mutex<Vec<Arc<dyn Handler>>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge handlers into the table and return the supported versions.
    /// Handlers on the reserved `NET` control are refused.
    pub fn register(&self, handlers: Vec<Arc<dyn Handler>>) -> BTreeSet<u16> {
        let mut routes = self.routes.write();
        let mut versions = self.versions.write();
        let mut registered = self.registered.lock();

        for handler in handlers {
            let header = handler.header();
            if header.ctrl == ctrl::NET {
                log::warn!("Refusing handler on reserved route {:?}", header.route());
                continue;
            }
            versions.insert(header.version);
            routes
                .entry(header.route())
                .or_default()
                .push(Arc::clone(&handler));
            registered.push(handler);
        }

        versions.clone()
    }

    pub fn versions(&self) -> BTreeSet<u16> {
        self.versions.read().clone()
    }

    pub fn handlers_for(&self, route: Route) -> Vec<Arc<dyn Handler>> {
        self.routes.read().get(&route).cloned().unwrap_or_default()
    }

    pub fn route_count(&self) -> usize {
        self.routes.read().len()
    }

    /// Invoke every handler for the message's route and version.
    /// Returns how many handlers were called.
    pub fn dispatch(&self, msg: &InboundMessage) -> usize {
        let mut called = 0;
        for handler in self.handlers_for(msg.route) {
            if handler.header().version != msg.version {
                continue;
            }
            called += 1;
            let result = catch_unwind(AssertUnwindSafe(|| {
                handler.receive(msg.id_hash, &msg.display_id, &msg.payload)
            }));
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::warn!(
                    "Handler {:?} failed for {}: {}",
                    msg.route,
                    msg.display_id,
                    e
                ),
                Err(_) => log::error!("Handler {:?} panicked for {}", msg.route, msg.display_id),
            }
        }
        if called == 0 {
            log::debug!(
                "No handler for {:?} v{} from {}",
                msg.route,
                msg.version,
                msg.display_id
            );
        }
        called
    }

    /// Call `shut_down` on every registered handler, once
    pub fn shut_down_all(&self) {
        let handlers = std::mem::take(&mut *self.registered.lock());
        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler.shut_down())).is_err() {
                log::error!("Handler {:?} panicked on shutdown", handler.header().route());
            }
        }
    }
}

/// Fixed pool of dispatch lanes
pub struct Dispatcher {
    /// Emptied on shutdown, which ends the lane threads
    lanes: RwLock<Vec<mpsc::Sender<InboundMessage>>>,
    dropped: AtomicU64,
}

impl Dispatcher {
    /// Start one thread per lane. The returned task closes the lanes on
    /// shutdown and finishes once every lane thread has exited.
    pub fn spawn(
        lanes: usize,
        capacity: usize,
        table: Arc<HandlerTable>,
        shutdown: CancellationToken,
    ) -> io::Result<(Arc<Self>, JoinHandle<()>)> {
        let mut senders = Vec::with_capacity(lanes);
        let mut threads = Vec::with_capacity(lanes);

        for lane in 0..lanes {
            let (tx, rx) = mpsc::channel(capacity);
            let table = table.clone();
            let stop = shutdown.clone();
            // On error the senders drop here and the lanes already started exit
            let thread = thread::Builder::new()
                .name(format!("p2p-dispatch-{}", lane))
                .spawn(move || run_worker(lane, rx, table, stop))?;
            senders.push(tx);
            threads.push(thread);
        }

        let dispatcher = Arc::new(Self {
            lanes: RwLock::new(senders),
            dropped: AtomicU64::new(0),
        });

        let closer = dispatcher.clone();
        let handle = tokio::spawn(async move {
            shutdown.cancelled().await;
            closer.close();
            // Joining would park a runtime thread behind a stuck handler
            while !threads.iter().all(|t| t.is_finished()) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            log::debug!("Dispatch lanes stopped");
        });
        Ok((dispatcher, handle))
    }

    /// Queue a message on its peer's lane; drops it when the lane is full
    pub fn submit(&self, msg: InboundMessage) -> bool {
        let lanes = self.lanes.read();
        if lanes.is_empty() {
            return false;
        }
        let lane = lane_for(msg.id_hash, lanes.len());
        match lanes[lane].try_send(msg) {
            Ok(()) => true,
            Err(TrySendError::Full(msg)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "Receive queue {} full, dropping {:?} from {}",
                    lane,
                    msg.route,
                    msg.display_id
                );
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Stop accepting messages; lane threads exit once their queue drains
    /// or they see the shutdown token
    pub fn close(&self) {
        self.lanes.write().clear();
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

fn run_worker(
    lane: usize,
    mut rx: mpsc::Receiver<InboundMessage>,
    table: Arc<HandlerTable>,
    shutdown: CancellationToken,
) {
    while let Some(msg) = rx.blocking_recv() {
        if shutdown.is_cancelled() {
            break;
        }
        table.dispatch(&msg);
    }
    log::debug!("Dispatch lane {} stopped", lane);
}
