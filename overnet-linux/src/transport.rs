//! UDP datagrams as mesh links: the socket feeds the packet nub, and the nub
//! sends through the same socket.

use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use overnet_core::{PacketNub, PacketSender, Status, Timer};
use tokio::net::UdpSocket;
use tracing::{debug, info};

const EXPIRE_PERIOD: Duration = Duration::from_secs(5);

pub struct UdpSender {
    socket: Rc<UdpSocket>,
}

impl UdpSender {
    pub fn new(socket: Rc<UdpSocket>) -> Self {
        Self { socket }
    }
}

impl PacketSender<SocketAddr> for UdpSender {
    // Never waits: a full socket buffer drops the datagram and the stream
    // layer retransmits.
    fn send_to(&self, addr: &SocketAddr, packet: &[u8]) -> Result<(), Status> {
        self.socket
            .try_send_to(packet, *addr)
            .map(|_| ())
            .map_err(Status::from)
    }
}

pub async fn bind(port: u16) -> io::Result<Rc<UdpSocket>> {
    let socket = UdpSocket::bind(("0.0.0.0", port)).await?;
    info!(addr = %socket.local_addr()?, "mesh transport listening");
    Ok(Rc::new(socket))
}

/// Hand every received datagram to the nub until the socket fails.
pub async fn receive_loop(socket: Rc<UdpSocket>, nub: PacketNub<SocketAddr>) -> io::Result<()> {
    let timer = nub.endpoint().timer();
    let mut buf = vec![0u8; 65536];
    loop {
        let (n, from) = socket.recv_from(&mut buf).await?;
        nub.process(timer.now(), from, &buf[..n]);
    }
}

pub async fn expire_loop(nub: PacketNub<SocketAddr>) {
    loop {
        tokio::time::sleep(EXPIRE_PERIOD).await;
        nub.expire_idle();
        debug!(pending = nub.pending_handshakes(), "idle links expired");
    }
}
