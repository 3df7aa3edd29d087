//! UDP discovery listener.
//!
//! Matrices announce themselves with a single UDP datagram on port 52000:
//!
//! ```text
//! "MXPD" | proto u8 | reserved u8 | tcp_port u16 BE | name (NUL-trimmed UTF-8)
//! ```
//!
//! The listener parses announcements and fans them out on a broadcast
//! channel. Malformed datagrams are dropped.

use crate::error::ClientError;
use crate::DISCOVERY_PORT;
use std::net::IpAddr;
use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Magic prefix of a discovery announcement.
pub const DISCOVERY_MAGIC: [u8; 4] = *b"MXPD";

/// Smallest valid announcement: magic, version, reserved byte, TCP port.
pub const MIN_ANNOUNCEMENT_LEN: usize = 8;

const ANNOUNCE_CHANNEL_CAPACITY: usize = 64;

/// A matrix seen on the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredMatrix {
    /// Address the announcement came from.
    pub addr: IpAddr,
    /// TCP control port the matrix advertises.
    pub tcp_port: u16,
    /// Protocol sub-version the matrix speaks.
    pub proto_version: u8,
    /// Advertised device name; may be empty.
    pub name: String,
}

/// Parses one announcement datagram. Returns `None` for anything that is
/// not a well-formed announcement, including non-UTF-8 names.
pub fn parse_announcement(addr: IpAddr, datagram: &[u8]) -> Option<DiscoveredMatrix> {
    if datagram.len() < MIN_ANNOUNCEMENT_LEN || datagram[..4] != DISCOVERY_MAGIC {
        return None;
    }
    let proto_version = datagram[4];
    let tcp_port = u16::from_be_bytes([datagram[6], datagram[7]]);
    let name = std::str::from_utf8(&datagram[8..])
        .ok()?
        .trim_end_matches('\0')
        .to_string();
    Some(DiscoveredMatrix {
        addr,
        tcp_port,
        proto_version,
        name,
    })
}

/// Background UDP listener for matrix announcements.
pub struct Discovery {
    local_port: u16,
    announce_tx: broadcast::Sender<DiscoveredMatrix>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Discovery {
    /// Binds the standard discovery port on all interfaces and starts
    /// listening.
    pub async fn bind() -> Result<Self, ClientError> {
        Self::bind_to(("0.0.0.0", DISCOVERY_PORT)).await
    }

    /// Binds an explicit address and starts listening.
    pub async fn bind_to(addr: impl ToSocketAddrs) -> Result<Self, ClientError> {
        let socket = UdpSocket::bind(addr).await?;
        let local_port = socket.local_addr()?.port();
        let (announce_tx, _) = broadcast::channel(ANNOUNCE_CHANNEL_CAPACITY);
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(listen_loop(socket, announce_tx.clone(), shutdown.clone()));
        tracing::debug!(port = local_port, "discovery listener started");

        Ok(Self {
            local_port,
            announce_tx,
            shutdown,
            task: Mutex::new(Some(task)),
        })
    }

    /// Port the listener is bound to.
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Subscribes to parsed announcements.
    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveredMatrix> {
        self.announce_tx.subscribe()
    }

    /// Stops the listener. Safe to call more than once.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
        tracing::debug!("discovery listener stopped");
    }
}

async fn listen_loop(
    socket: UdpSocket,
    announce_tx: broadcast::Sender<DiscoveredMatrix>,
    shutdown: CancellationToken,
) {
    // Announcements are single datagrams, well under this size.
    let mut buf = [0u8; 512];
    loop {
        let received = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = socket.recv_from(&mut buf) => received,
        };
        let (len, from) = match received {
            Ok(received) => received,
            Err(err) => {
                tracing::debug!(error = %err, "discovery receive error");
                continue;
            }
        };
        match parse_announcement(from.ip(), &buf[..len]) {
            Some(matrix) => {
                tracing::debug!(addr = %matrix.addr, port = matrix.tcp_port, name = %matrix.name, "matrix announced");
                let _ = announce_tx.send(matrix);
            }
            None => tracing::trace!(from = %from, len, "ignoring malformed datagram"),
        }
    }
}
