use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use serde::Serialize;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::error::{ClientError, Result};

pub const DISCOVERY_PORT: u16 = 58899;
pub const DISCOVERY_PROBE: &[u8] = b"WIFIKIT-214028-READ";
pub const DEFAULT_DISCOVERY_WAIT: Duration = Duration::from_secs(5);

pub async fn discover_device(wait: Duration) -> Result<Ipv4Addr> {
    let target = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, DISCOVERY_PORT));
    discover_device_at(target, wait).await
}

pub async fn discover_device_at(target: SocketAddr, wait: Duration) -> Result<Ipv4Addr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.set_broadcast(true)?;
    socket.send_to(DISCOVERY_PROBE, target).await?;
    debug!(%target, "sent discovery probe");

    let mut buf = [0_u8; 512];
    let (len, from) = match timeout(wait, socket.recv_from(&mut buf)).await {
        Ok(received) => received?,
        Err(_) => return Err(ClientError::DiscoveryFailure),
    };

    let device = parse_probe_reply(&buf[..len], from);
    info!(%device, %from, "inverter answered discovery probe");
    Ok(device)
}

/// Replies look like `ip,mac,name`; the datagram source is the fallback.
fn parse_probe_reply(reply: &[u8], from: SocketAddr) -> Ipv4Addr {
    let text = String::from_utf8_lossy(reply);
    let advertised = text
        .split(',')
        .next()
        .and_then(|ip| ip.trim().parse::<Ipv4Addr>().ok());

    match (advertised, from.ip()) {
        (Some(ip), _) => ip,
        (None, IpAddr::V4(ip)) => ip,
        (None, IpAddr::V6(ip)) => ip.to_ipv4_mapped().unwrap_or(Ipv4Addr::UNSPECIFIED),
    }
}

/// The local interface address the OS would use to reach `toward`.
///
/// Connecting a UDP socket only selects a route, nothing is sent.
pub async fn resolve_local_address(toward: Ipv4Addr) -> Result<Ipv4Addr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket
        .connect((toward, 80))
        .await
        .map_err(|err| ClientError::connection(format!("no route toward {toward}: {err}")))?;

    match socket.local_addr()? {
        SocketAddr::V4(addr) => Ok(*addr.ip()),
        SocketAddr::V6(addr) => Err(ClientError::connection(format!(
            "resolved non-IPv4 local address {addr}"
        ))),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Endpoints {
    pub inverter: Ipv4Addr,
    pub local: Ipv4Addr,
}

impl Endpoints {
    pub async fn resolve(
        inverter: Option<Ipv4Addr>,
        local: Option<Ipv4Addr>,
        wait: Duration,
    ) -> Result<Self> {
        let inverter = match inverter {
            Some(ip) => ip,
            None => discover_device(wait).await?,
        };
        let local = match local {
            Some(ip) => ip,
            None => resolve_local_address(inverter).await?,
        };
        Ok(Self { inverter, local })
    }
}
