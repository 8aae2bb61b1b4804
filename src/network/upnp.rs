//! UPnP NAT traversal
//!
//! Maps the listening port on the gateway and reports the external address
//! so it can be advertised to peers.

use crate::network::endpoint::{Endpoint, ServiceFlags};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

/// Port mapping lease (1 hour)
const PORT_MAPPING_LEASE: u32 = 3600;

/// How often to renew the mapping (50 minutes)
const RENEWAL_INTERVAL: Duration = Duration::from_secs(50 * 60);

const MAPPING_DESCRIPTION: &str = "mini-p2p";

#[derive(Error, Debug)]
pub enum UpnpError {
    #[error("UPnP gateway not found: {0}")]
    GatewayNotFound(String),
    #[error("Failed to get external IP: {0}")]
    ExternalIpError(String),
    #[error("Failed to add port mapping: {0}")]
    PortMappingError(String),
    #[error("Invalid local address")]
    InvalidLocalAddress,
    #[error("UPnP task failed: {0}")]
    TaskFailed(String),
}

/// An active port mapping on the gateway
pub struct UpnpMapping {
    local_addr: SocketAddrV4,
    external_ip: Ipv4Addr,
}

impl UpnpMapping {
    /// Find the gateway, map `port` to this host and learn the external IP.
    /// igd-next is blocking, so the work runs on the blocking pool.
    pub async fn setup(port: u16) -> Result<Self, UpnpError> {
        let local_ip = get_local_ip().ok_or(UpnpError::InvalidLocalAddress)?;
        let local_addr = SocketAddrV4::new(local_ip, port);

        log::info!("Searching for UPnP gateway...");
        let external_ip = tokio::task::spawn_blocking(move || add_mapping(local_addr))
            .await
            .map_err(|e| UpnpError::TaskFailed(e.to_string()))??;

        log::info!(
            "Added UPnP port mapping: {}:{} -> {}",
            external_ip,
            port,
            local_addr
        );
        Ok(Self {
            local_addr,
            external_ip,
        })
    }

    /// Our endpoint as seen from outside the NAT
    pub fn external_endpoint(&self) -> Endpoint {
        Endpoint::new(
            self.external_ip,
            self.local_addr.port(),
            ServiceFlags::NODE_NETWORK.bits(),
        )
    }

    /// Renew the mapping periodically until the task is aborted
    pub fn start_renewal_task(&self) -> JoinHandle<()> {
        let local_addr = self.local_addr;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(RENEWAL_INTERVAL).await;
                match tokio::task::spawn_blocking(move || add_mapping(local_addr)).await {
                    Ok(Ok(_)) => log::debug!("Renewed UPnP port mapping"),
                    Ok(Err(e)) => log::warn!("Failed to renew UPnP port mapping: {}", e),
                    Err(e) => log::warn!("UPnP renewal task failed: {}", e),
                }
            }
        })
    }

    /// Remove the port mapping
    pub async fn cleanup(self) {
        let port = self.local_addr.port();
        let _ = tokio::task::spawn_blocking(move || {
            use igd_next::{search_gateway, PortMappingProtocol};

            if let Ok(gateway) = search_gateway(Default::default()) {
                match gateway.remove_port(PortMappingProtocol::TCP, port) {
                    Ok(()) => log::info!("Removed UPnP port mapping for port {}", port),
                    Err(e) => log::debug!("Failed to remove UPnP mapping: {}", e),
                }
            }
        })
        .await;
    }
}

fn add_mapping(local_addr: SocketAddrV4) -> Result<Ipv4Addr, UpnpError> {
    use igd_next::{search_gateway, PortMappingProtocol};

    let gateway = search_gateway(Default::default())
        .map_err(|e| UpnpError::GatewayNotFound(e.to_string()))?;
    log::debug!("Found UPnP gateway: {}", gateway.addr);

    let external_ip = match gateway
        .get_external_ip()
        .map_err(|e| UpnpError::ExternalIpError(e.to_string()))?
    {
        IpAddr::V4(ip) => ip,
        IpAddr::V6(_) => {
            return Err(UpnpError::ExternalIpError("IPv6 not supported".to_string()))
        }
    };

    gateway
        .add_port(
            PortMappingProtocol::TCP,
            local_addr.port(),
            SocketAddr::V4(local_addr),
            PORT_MAPPING_LEASE,
            MAPPING_DESCRIPTION,
        )
        .map_err(|e| UpnpError::PortMappingError(e.to_string()))?;

    Ok(external_ip)
}

/// Local IP address of the default route. Connecting a UDP socket sends
/// nothing; it only selects the outgoing interface.
pub fn get_local_ip() -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:53").ok()?;

    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(ip) => Some(ip),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_local_ip() {
        // May be None without a default route
        if let Some(ip) = get_local_ip() {
            assert!(!ip.is_loopback());
        }
    }

    #[test]
    fn test_external_endpoint() {
        let mapping = UpnpMapping {
            local_addr: SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 5), 8333),
            external_ip: Ipv4Addr::new(8, 8, 4, 4),
        };
        let endpoint = mapping.external_endpoint();
        assert_eq!(endpoint.to_string(), "8.8.4.4:8333");
        assert!(endpoint.is_routable());
    }
}
