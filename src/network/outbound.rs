//! Outbound pipeline
//!
//! `send()` pushes onto one shared bounded queue. A distributor moves each
//! message onto a writer lane chosen by hashing the destination, so all
//! traffic to one peer goes through one lane in FIFO order. Each lane hands
//! the actual socket write to its own writer task through a bounded
//! backlog, so a slow socket never stalls the lane's dequeue loop.
//!
//! Drops are deliberate and never block: full queues, full backlogs and
//! messages older than the write timeout are logged and discarded. Frames
//! the peer's codec would refuse never reach the queue.

use crate::config::P2pConfig;
use crate::network::message::Frame;
use crate::network::registry::{ConnId, NodeRegistry, SharedWriter};
use bytes::Bytes;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Which registry set a message is addressed to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    /// Active node by id hash
    Active(u32),
    /// Handshaking inbound socket
    Inbound(ConnId),
    /// Handshaking outbound socket
    Outbound(ConnId),
}

impl Destination {
    fn lane_key(&self) -> u32 {
        match self {
            Destination::Active(id_hash) => *id_hash,
            Destination::Inbound(conn) | Destination::Outbound(conn) => {
                (*conn ^ (*conn >> 32)) as u32
            }
        }
    }
}

/// A queued outgoing frame
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub dest: Destination,
    pub frame: Frame,
    pub enqueued_at: Instant,
}

impl OutboundMessage {
    pub fn new(dest: Destination, frame: Frame) -> Self {
        Self {
            dest,
            frame,
            enqueued_at: Instant::now(),
        }
    }

    pub fn is_stale(&self, now: Instant, write_timeout: Duration) -> bool {
        now.saturating_duration_since(self.enqueued_at) > write_timeout
    }

    pub fn lane(&self, lanes: usize) -> usize {
        lane_for(self.dest.lane_key(), lanes)
    }
}

/// murmur3 finalizer
fn mix32(mut h: u32) -> u32 {
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h
}

/// Lane index for a key; stable for the life of the process
pub fn lane_for(key: u32, lanes: usize) -> usize {
    mix32(key) as usize % lanes.max(1)
}

/// Outbound settings
#[derive(Debug, Clone)]
pub struct OutboundSettings {
    pub lanes: usize,
    pub send_queue_capacity: usize,
    pub lane_queue_capacity: usize,
    pub write_backlog: usize,
    pub write_timeout: Duration,
    /// Largest payload a peer accepts
    pub max_frame_body: usize,
}

impl OutboundSettings {
    pub fn from_config(config: &P2pConfig) -> Self {
        Self {
            lanes: config.writer_lanes,
            send_queue_capacity: config.send_queue_capacity,
            lane_queue_capacity: config.lane_queue_capacity,
            write_backlog: config.write_backlog,
            write_timeout: config.write_timeout(),
            max_frame_body: config.max_frame_body,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    written: AtomicU64,
    stale: AtomicU64,
    queue_full: AtomicU64,
    backlog_full: AtomicU64,
    no_channel: AtomicU64,
    failed: AtomicU64,
    oversized: AtomicU64,
}

/// Outbound counters at one instant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutboundStats {
    pub written: u64,
    pub stale: u64,
    pub queue_full: u64,
    pub backlog_full: u64,
    pub no_channel: u64,
    pub failed: u64,
    pub oversized: u64,
}

struct WriteJob {
    conn_id: ConnId,
    writer: SharedWriter,
    bytes: Bytes,
}

/// Handle to the running pipeline
#[derive(Clone)]
pub struct Outbound {
    tx: mpsc::Sender<OutboundMessage>,
    counters: Arc<Counters>,
    max_frame_body: usize,
}

impl Outbound {
    /// Spawn the distributor, lanes and writers
    pub fn spawn(
        settings: OutboundSettings,
        registry: Arc<NodeRegistry>,
        shutdown: CancellationToken,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let counters = Arc::new(Counters::default());
        let (tx, rx) = mpsc::channel(settings.send_queue_capacity);
        let mut handles = Vec::with_capacity(1 + settings.lanes * 2);
        let mut lane_txs = Vec::with_capacity(settings.lanes);

        for lane in 0..settings.lanes {
            let (lane_tx, lane_rx) = mpsc::channel(settings.lane_queue_capacity);
            let (job_tx, job_rx) = mpsc::channel(settings.write_backlog);
            lane_txs.push(lane_tx);

            handles.push(tokio::spawn(run_lane(
                lane,
                lane_rx,
                job_tx,
                registry.clone(),
                counters.clone(),
                settings.write_timeout,
                shutdown.clone(),
            )));
            handles.push(tokio::spawn(run_writer(
                job_rx,
                registry.clone(),
                counters.clone(),
                settings.write_timeout,
                shutdown.clone(),
            )));
        }

        handles.push(tokio::spawn(distribute(
            rx,
            lane_txs,
            counters.clone(),
            shutdown,
        )));

        let outbound = Self {
            tx,
            counters,
            max_frame_body: settings.max_frame_body,
        };
        (outbound, handles)
    }

    /// Non-blocking enqueue; returns false if the message was dropped
    pub fn send(&self, msg: OutboundMessage) -> bool {
        // The receiver would count it as a protocol violation against us
        if msg.frame.payload.len() > self.max_frame_body {
            self.counters.oversized.fetch_add(1, Ordering::Relaxed);
            log::warn!(
                "Dropping {:?} to {:?}: {} byte body exceeds limit of {}",
                msg.frame.route(),
                msg.dest,
                msg.frame.payload.len(),
                self.max_frame_body
            );
            return false;
        }
        match self.tx.try_send(msg) {
            Ok(()) => true,
            Err(TrySendError::Full(msg)) => {
                self.counters.queue_full.fetch_add(1, Ordering::Relaxed);
                log::warn!("Send queue full, dropping message to {:?}", msg.dest);
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub fn stats(&self) -> OutboundStats {
        let c = &self.counters;
        OutboundStats {
            written: c.written.load(Ordering::Relaxed),
            stale: c.stale.load(Ordering::Relaxed),
            queue_full: c.queue_full.load(Ordering::Relaxed),
            backlog_full: c.backlog_full.load(Ordering::Relaxed),
            no_channel: c.no_channel.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            oversized: c.oversized.load(Ordering::Relaxed),
        }
    }
}

async fn distribute(
    mut rx: mpsc::Receiver<OutboundMessage>,
    lanes: Vec<mpsc::Sender<OutboundMessage>>,
    counters: Arc<Counters>,
    shutdown: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            _ = shutdown.cancelled() => break,
            msg = rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        let lane = msg.lane(lanes.len());
        if let Err(TrySendError::Full(msg)) = lanes[lane].try_send(msg) {
            counters.queue_full.fetch_add(1, Ordering::Relaxed);
            log::warn!("Lane {} full, dropping message to {:?}", lane, msg.dest);
        }
    }
}

async fn run_lane(
    lane: usize,
    mut rx: mpsc::Receiver<OutboundMessage>,
    jobs: mpsc::Sender<WriteJob>,
    registry: Arc<NodeRegistry>,
    counters: Arc<Counters>,
    write_timeout: Duration,
    shutdown: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            _ = shutdown.cancelled() => break,
            msg = rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        if msg.is_stale(Instant::now(), write_timeout) {
            counters.stale.fetch_add(1, Ordering::Relaxed);
            log::debug!(
                "Lane {}: dropping stale {:?} to {:?}",
                lane,
                msg.frame.route(),
                msg.dest
            );
            continue;
        }

        let Some((conn_id, writer)) = registry.writer_for(&msg.dest) else {
            counters.no_channel.fetch_add(1, Ordering::Relaxed);
            log::debug!("Lane {}: no live channel for {:?}", lane, msg.dest);
            continue;
        };

        let job = WriteJob {
            conn_id,
            writer,
            bytes: msg.frame.to_bytes(),
        };
        if let Err(TrySendError::Full(job)) = jobs.try_send(job) {
            counters.backlog_full.fetch_add(1, Ordering::Relaxed);
            log::warn!(
                "Lane {}: write backlog full, dropping write to connection {}",
                lane,
                job.conn_id
            );
        }
    }
}

async fn run_writer(
    mut jobs: mpsc::Receiver<WriteJob>,
    registry: Arc<NodeRegistry>,
    counters: Arc<Counters>,
    write_timeout: Duration,
    shutdown: CancellationToken,
) {
    loop {
        let job = tokio::select! {
            _ = shutdown.cancelled() => break,
            job = jobs.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        let write = async {
            let mut writer = job.writer.lock().await;
            writer.write_all(&job.bytes).await?;
            writer.flush().await
        };

        match tokio::time::timeout(write_timeout, write).await {
            Ok(Ok(())) => {
                counters.written.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(e)) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                log::debug!("Write to connection {} failed: {}", job.conn_id, e);
                registry.remove_conn(job.conn_id);
            }
            Err(_) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                log::debug!("Write to connection {} timed out", job.conn_id);
                registry.remove_conn(job.conn_id);
            }
        }
    }
}
