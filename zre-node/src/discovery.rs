//! LAN discovery: UDP broadcast beacons announcing our id and inbox port.
//!
//! Beacon layout (22 bytes): `Z R E 0x01`, 16-byte node id, inbox port as
//! u16 big-endian. Port 0 announces that the node is leaving.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use zre_core::{DiscoveryEvent, PeerId};

const BEACON_PREFIX: [u8; 4] = [b'Z', b'R', b'E', 0x01];
pub const BEACON_LEN: usize = 4 + 16 + 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Beacon {
    pub peer: PeerId,
    /// Inbox TCP port; 0 means the node is leaving.
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BeaconError {
    #[error("beacon is {0} bytes, expected 22")]
    WrongSize(usize),
    #[error("not a ZRE beacon")]
    BadPrefix,
}

impl Beacon {
    pub fn encode(&self) -> [u8; BEACON_LEN] {
        let mut out = [0u8; BEACON_LEN];
        out[..4].copy_from_slice(&BEACON_PREFIX);
        out[4..20].copy_from_slice(self.peer.as_bytes());
        out[20..].copy_from_slice(&self.port.to_be_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, BeaconError> {
        if bytes.len() != BEACON_LEN {
            return Err(BeaconError::WrongSize(bytes.len()));
        }
        if bytes[..4] != BEACON_PREFIX {
            return Err(BeaconError::BadPrefix);
        }
        let mut id = [0u8; 16];
        id.copy_from_slice(&bytes[4..20]);
        Ok(Self {
            peer: PeerId::from_bytes(id),
            port: u16::from_be_bytes([bytes[20], bytes[21]]),
        })
    }
}

/// Broadcast-capable UDP socket on `port`, shareable with other nodes on the host.
pub fn bind_socket(port: u16) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    socket.bind(&SockAddr::from(addr))?;
    UdpSocket::from_std(socket.into())
}

/// Running beacon tasks.
pub struct Beaconing {
    socket: Arc<UdpSocket>,
    dest: SocketAddr,
    id: PeerId,
    tasks: Vec<JoinHandle<()>>,
}

impl Beaconing {
    /// Start broadcasting `beacon` every `interval` on `discovery_port`, and
    /// report beacons from other nodes to `tx`.
    pub fn publish(
        beacon: Beacon,
        discovery_port: u16,
        interval: Duration,
        tx: mpsc::UnboundedSender<DiscoveryEvent>,
    ) -> std::io::Result<Self> {
        let socket = Arc::new(bind_socket(discovery_port)?);
        let dest = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, discovery_port));
        tracing::info!(port = discovery_port, "beaconing started");
        Ok(Self::spawn(beacon, socket, dest, interval, tx))
    }

    fn spawn(
        beacon: Beacon,
        socket: Arc<UdpSocket>,
        dest: SocketAddr,
        interval: Duration,
        tx: mpsc::UnboundedSender<DiscoveryEvent>,
    ) -> Self {
        let send_socket = socket.clone();
        let recv_socket = socket.clone();
        let id = beacon.peer;
        let tasks = vec![
            tokio::spawn(async move { beacon_loop(send_socket, beacon, dest, interval).await }),
            tokio::spawn(async move { recv_loop(recv_socket, id, tx).await }),
        ];
        Self {
            socket,
            dest,
            id,
            tasks,
        }
    }

    /// Stop the tasks without announcing anything.
    pub fn abort(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }

    /// Stop the tasks and tell the network we are leaving.
    pub async fn withdraw(self) {
        self.abort();
        let withdraw = Beacon {
            peer: self.id,
            port: 0,
        };
        if let Err(e) = self.socket.send_to(&withdraw.encode(), self.dest).await {
            tracing::debug!(error = %e, "withdraw beacon not sent");
        }
    }
}

async fn beacon_loop(
    socket: Arc<UdpSocket>,
    beacon: Beacon,
    dest: SocketAddr,
    interval: Duration,
) {
    let frame = beacon.encode();
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        if let Err(e) = socket.send_to(&frame, dest).await {
            tracing::debug!(error = %e, "beacon send failed");
        }
    }
}

/// Turn beacons heard on `socket` into discovery events until the receiver
/// goes away.
pub async fn recv_loop(
    socket: Arc<UdpSocket>,
    own_id: PeerId,
    tx: mpsc::UnboundedSender<DiscoveryEvent>,
) {
    let mut buf = [0u8; 512];
    loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "beacon socket failed");
                return;
            }
        };
        let beacon = match Beacon::decode(&buf[..n]) {
            Ok(b) => b,
            Err(e) => {
                tracing::trace!(%from, error = %e, "ignoring datagram");
                continue;
            }
        };
        if beacon.peer == own_id {
            continue;
        }
        let event = if beacon.port == 0 {
            DiscoveryEvent::Lost { peer: beacon.peer }
        } else {
            DiscoveryEvent::Found {
                peer: beacon.peer,
                endpoint: format!("tcp://{}:{}", from.ip(), beacon.port),
            }
        };
        if tx.send(event).is_err() {
            return;
        }
    }
}
