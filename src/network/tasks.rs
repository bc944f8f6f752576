//! Periodic maintenance
//!
//! Status reporting, keepalive pings, active-node gossip requests and
//! eviction. Each job runs on its own interval and stops with the shutdown
//! token.

use crate::network::context::NetContext;
use crate::network::message::{act, Frame};
use crate::network::outbound::Destination;
use bytes::Bytes;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Run `job` every `period` until shutdown
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    shutdown: CancellationToken,
    mut job: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires at once
        interval.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => job().await,
            }
        }
        log::debug!("{} task stopped", name);
    })
}

/// Spawn status, keepalive, gossip and eviction tasks
pub fn spawn_maintenance(ctx: &Arc<NetContext>) -> Vec<JoinHandle<()>> {
    let config = &ctx.config;
    let mut handles = Vec::with_capacity(4);

    let status_ctx = ctx.clone();
    handles.push(spawn_periodic(
        "status",
        Duration::from_millis(config.status_interval_ms),
        ctx.shutdown.clone(),
        move || {
            report_status(&status_ctx);
            async {}
        },
    ));

    let keepalive_ctx = ctx.clone();
    let idle = keepalive_period(config.read_timeout());
    handles.push(spawn_periodic(
        "keepalive",
        idle,
        ctx.shutdown.clone(),
        move || {
            ping_silent(&keepalive_ctx, Instant::now(), idle);
            async {}
        },
    ));

    if config.sync_seeds_only {
        log::info!("Seeds-only mode, active node gossip disabled");
    } else {
        let gossip_ctx = ctx.clone();
        handles.push(spawn_periodic(
            "active nodes",
            Duration::from_millis(config.active_nodes_interval_ms),
            ctx.shutdown.clone(),
            move || {
                request_active_nodes(&gossip_ctx);
                async {}
            },
        ));
    }

    let evict_ctx = ctx.clone();
    handles.push(spawn_periodic(
        "eviction",
        Duration::from_millis(config.eviction_interval_ms),
        ctx.shutdown.clone(),
        move || {
            evict(&evict_ctx, Instant::now());
            async {}
        },
    ));

    handles
}

/// Log node counts, latency and drop counters. Read-only.
pub fn report_status(ctx: &NetContext) {
    let counts = ctx.registry.counts();
    let latency = ctx
        .registry
        .average_latency_ms()
        .map(|ms| format!("{}ms", ms))
        .unwrap_or_else(|| "n/a".to_string());
    let outbound = ctx.outbound.stats();

    log::info!(
        "P2P status: active={} inbound={} outbound={} temp={} banned={} latency={}",
        counts.active,
        counts.inbound,
        counts.outbound,
        counts.temp,
        counts.banned,
        latency
    );
    let dropped =
        outbound.stale + outbound.queue_full + outbound.backlog_full + outbound.oversized;
    if dropped > 0 || ctx.dispatcher.dropped() > 0 {
        log::info!(
            "P2P drops: send={} (stale={}) receive={}",
            dropped,
            outbound.stale,
            ctx.dispatcher.dropped()
        );
    }
}

/// Ping period for a read timeout. A link is pinged at most two periods
/// after it went quiet, well inside the timeout.
pub fn keepalive_period(read_timeout: Duration) -> Duration {
    (read_timeout / 4).max(Duration::from_millis(1))
}

/// Ping every active node silent for at least `idle`; returns how many
pub fn ping_silent(ctx: &NetContext, now: Instant, idle: Duration) -> usize {
    ctx.registry
        .silent_active(now, idle)
        .into_iter()
        .filter(|id_hash| {
            ctx.send_to(
                Destination::Active(*id_hash),
                Frame::net(act::PING, Bytes::new()),
            )
        })
        .count()
}

/// Ask one random active node for its active nodes. Returns the target.
pub fn request_active_nodes(ctx: &NetContext) -> Option<u32> {
    let node = ctx.registry.get_random_active()?;
    ctx.gossip_requests.lock().insert(node.id_hash, Instant::now());
    let frame = Frame::net(act::REQ_ACTIVE_NODES, Bytes::new());
    if !ctx.send_to(Destination::Active(node.id_hash), frame) {
        ctx.gossip_requests.lock().remove(&node.id_hash);
        return None;
    }
    log::debug!("Requested active nodes from {}", node.display_id());
    Some(node.id_hash)
}

/// Drop expired temp nodes, stuck handshakes, old bans and unanswered
/// gossip requests
pub fn evict(ctx: &NetContext, now: Instant) {
    let stats = ctx.registry.evict_expired(now);
    // An answer later than the read timeout is not a latency sample
    let unanswered = ctx.prune_gossip_requests(ctx.config.read_timeout());
    if stats.temp + stats.handshakes + stats.bans + unanswered > 0 {
        log::debug!(
            "Evicted {} temp, {} handshakes, {} bans, {} gossip requests",
            stats.temp,
            stats.handshakes,
            stats.bans,
            unanswered
        );
    }
}
