//! UPnP port mapping
//!
//! Optional: maps the listening port on the local router and keeps the
//! lease alive. Failures are logged and never stop the node.

use parking_lot::Mutex;
use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const MAPPING_DESCRIPTION: &str = "p2p-core";

/// Lease never shorter than this, so a slow refresh cannot lapse it
const MIN_LEASE_SECS: u32 = 600;

#[derive(Error, Debug)]
pub enum UpnpError {
    #[error("UPnP disabled")]
    Disabled,
    #[error("No routable local IPv4 address")]
    NoLocalAddress,
    #[error("UPnP gateway not found: {0}")]
    Gateway(String),
    #[error("Port mapping failed: {0}")]
    Mapping(String),
    #[error("UPnP task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Snapshot for status reporting
#[derive(Debug, Clone, Default, Serialize)]
pub struct UpnpStatus {
    pub enabled: bool,
    pub gateway: Option<SocketAddr>,
    pub external_ip: Option<IpAddr>,
    pub mapped_port: Option<u16>,
}

#[derive(Debug, Default)]
struct Mapping {
    local_addr: Option<SocketAddrV4>,
    gateway: Option<SocketAddr>,
    external_ip: Option<IpAddr>,
}

/// Router port mapper. Blocking igd calls run on the blocking pool.
pub struct UpnpManager {
    enabled: bool,
    lease_secs: u32,
    mapping: Mutex<Mapping>,
}

impl UpnpManager {
    /// `refresh` is how often the mapping is renewed; the lease covers two
    /// refresh periods
    pub fn new(enabled: bool, refresh: Duration) -> Self {
        Self {
            enabled,
            lease_secs: lease_for(refresh),
            mapping: Mutex::new(Mapping::default()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn lease_secs(&self) -> u32 {
        self.lease_secs
    }

    pub fn status(&self) -> UpnpStatus {
        let mapping = self.mapping.lock();
        UpnpStatus {
            enabled: self.enabled,
            gateway: mapping.gateway,
            external_ip: mapping.external_ip,
            mapped_port: mapping.local_addr.map(|a| a.port()),
        }
    }

    /// Find the gateway and map `port` to this host
    pub async fn map_port(&self, port: u16) -> Result<IpAddr, UpnpError> {
        if !self.enabled {
            return Err(UpnpError::Disabled);
        }
        let local_ip = get_local_ip().ok_or(UpnpError::NoLocalAddress)?;
        let local_addr = SocketAddrV4::new(local_ip, port);
        let lease = self.lease_secs;

        let (gateway, external_ip) = tokio::task::spawn_blocking(move || {
            use igd_next::{search_gateway, PortMappingProtocol, SearchOptions};

            let gateway = search_gateway(SearchOptions::default())
                .map_err(|e| UpnpError::Gateway(e.to_string()))?;
            let external_ip = gateway
                .get_external_ip()
                .map_err(|e| UpnpError::Gateway(e.to_string()))?;
            gateway
                .add_port(
                    PortMappingProtocol::TCP,
                    port,
                    SocketAddr::V4(local_addr),
                    lease,
                    MAPPING_DESCRIPTION,
                )
                .map_err(|e| UpnpError::Mapping(e.to_string()))?;
            Ok::<_, UpnpError>((gateway.addr, external_ip))
        })
        .await??;

        let mut mapping = self.mapping.lock();
        let renewed = mapping.local_addr == Some(local_addr);
        *mapping = Mapping {
            local_addr: Some(local_addr),
            gateway: Some(gateway),
            external_ip: Some(external_ip),
        };
        if renewed {
            log::debug!("Renewed UPnP mapping {}:{}", external_ip, port);
        } else {
            log::info!(
                "UPnP mapped {}:{} -> {} via {}",
                external_ip,
                port,
                local_addr,
                gateway
            );
        }
        Ok(external_ip)
    }

    /// Remove our mapping, if any
    pub async fn unmap(&self) {
        let port = {
            let mut mapping = self.mapping.lock();
            let port = mapping.local_addr.map(|a| a.port());
            *mapping = Mapping::default();
            port
        };
        let Some(port) = port else {
            return;
        };

        let result = tokio::task::spawn_blocking(move || {
            use igd_next::{search_gateway, PortMappingProtocol, SearchOptions};

            let gateway = search_gateway(SearchOptions::default())
                .map_err(|e| UpnpError::Gateway(e.to_string()))?;
            gateway
                .remove_port(PortMappingProtocol::TCP, port)
                .map_err(|e| UpnpError::Mapping(e.to_string()))
        })
        .await;

        match result {
            Ok(Ok(())) => log::info!("Removed UPnP mapping for port {}", port),
            Ok(Err(e)) => log::warn!("Failed to remove UPnP mapping: {}", e),
            Err(e) => log::warn!("UPnP cleanup task failed: {}", e),
        }
    }

    /// Map now, then keep re-mapping every `period` until shutdown
    pub fn spawn_refresh(
        self: Arc<Self>,
        port: u16,
        period: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if let Err(e) = self.map_port(port).await {
                    log::warn!("UPnP: {}", e);
                }
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(period) => {}
                }
            }
            log::debug!("UPnP refresh stopped");
        })
    }
}

fn lease_for(refresh: Duration) -> u32 {
    let secs = refresh.as_secs().saturating_mul(2);
    u32::try_from(secs).unwrap_or(u32::MAX).max(MIN_LEASE_SECS)
}

/// Local IPv4 address of the default route
///
/// Connecting a UDP socket sends nothing; it only selects the route.
pub fn get_local_ip() -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:53").ok()?;

    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(ip) if !ip.is_unspecified() => Some(ip),
        _ => None,
    }
}
