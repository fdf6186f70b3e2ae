//! Datagram transport to the tunnel server

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::UdpSocket;

use crate::error::NetworkError;

/// Largest datagram we expect: a full-size IP packet plus transport overhead
pub const MAX_DATAGRAM: usize = 65535;

/// Sends and receives raw WireGuard datagrams
#[async_trait]
pub trait PacketTransport: Send + Sync {
    async fn send_to(&self, datagram: &[u8], target: SocketAddr) -> io::Result<usize>;

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
}

/// UDP socket bound to an ephemeral local port
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    /// Bind a socket of the same address family as `peer`
    pub async fn bind_for(peer: SocketAddr) -> Result<Self, NetworkError> {
        let local: SocketAddr = if peer.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };

        let socket = UdpSocket::bind(local)
            .await
            .map_err(|e| NetworkError::BindFailed {
                addr: local.to_string(),
                reason: e.to_string(),
            })?;

        if let Ok(addr) = socket.local_addr() {
            tracing::debug!("Bound UDP socket on {}", addr);
        }
        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

#[async_trait]
impl PacketTransport for UdpTransport {
    async fn send_to(&self, datagram: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(datagram, target).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }
}

/// Resolve `host:port`, preferring the first address returned
pub async fn resolve(host: &str, port: u16) -> Result<SocketAddr, NetworkError> {
    let failed = || NetworkError::DnsResolutionFailed {
        host: host.to_string(),
    };
    tokio::net::lookup_host((host, port))
        .await
        .map_err(|_| failed())?
        .next()
        .ok_or_else(failed)
}
