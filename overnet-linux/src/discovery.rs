//! LAN discovery: a UDP multicast beacon announcing this node's mesh port.
//! Every beacon heard from another node starts a nub handshake with it.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use overnet_core::{NodeId, PacketNub, PROTOCOL_VERSION};
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tracing::{debug, trace};

const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 60, 60);
const BEACON_INTERVAL: Duration = Duration::from_secs(4);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Beacon {
    version: u8,
    node: NodeId,
    udp_port: u16,
}

impl Beacon {
    fn encode(&self) -> bincode::Result<Vec<u8>> {
        bincode::serialize(self)
    }
}

/// Mesh address announced by a beacon, unless it is ours or from another
/// protocol version.
fn beacon_address(own: NodeId, from: SocketAddr, bytes: &[u8]) -> Option<SocketAddr> {
    let beacon: Beacon = bincode::deserialize(bytes).ok()?;
    if beacon.version != PROTOCOL_VERSION || beacon.node == own {
        return None;
    }
    Some(SocketAddr::new(from.ip(), beacon.udp_port))
}

pub async fn run_discovery(
    nub: PacketNub<SocketAddr>,
    discovery_port: u16,
    udp_port: u16,
) -> anyhow::Result<()> {
    let socket = make_multicast_socket(discovery_port)?;
    let beacon = Beacon {
        version: PROTOCOL_VERSION,
        node: nub.endpoint().node_id(),
        udp_port,
    }
    .encode()?;
    let dest = SocketAddr::from((MULTICAST_GROUP, discovery_port));
    tokio::try_join!(
        beacon_loop(&socket, &beacon, dest),
        recv_loop(&socket, &nub)
    )?;
    Ok(())
}

fn make_multicast_socket(discovery_port: u16) -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, discovery_port))?;
    std_sock.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    std_sock.set_multicast_ttl_v4(1)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

async fn beacon_loop(socket: &UdpSocket, beacon: &[u8], dest: SocketAddr) -> anyhow::Result<()> {
    loop {
        if let Err(e) = socket.send_to(beacon, dest).await {
            debug!(error = %e, "beacon not sent");
        }
        tokio::time::sleep(BEACON_INTERVAL).await;
    }
}

async fn recv_loop(socket: &UdpSocket, nub: &PacketNub<SocketAddr>) -> anyhow::Result<()> {
    let own = nub.endpoint().node_id();
    let mut buf = vec![0u8; 1500];
    loop {
        let (n, from) = socket.recv_from(&mut buf).await?;
        let Some(addr) = beacon_address(own, from, &buf[..n]) else {
            trace!(%from, "ignoring datagram on discovery port");
            continue;
        };
        if nub.peer_at(&addr).is_some() {
            continue;
        }
        debug!(%addr, "beacon heard");
        if let Err(e) = nub.initiate(addr) {
            debug!(%addr, error = %e, "handshake not started");
        }
    }
}
