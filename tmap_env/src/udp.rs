//! Production datagram transport over a non-blocking UDP socket.

use crate::error::EnvError;
use crate::network::DatagramTransport;
use crate::types::Datagram;
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use tracing::warn;

/// Largest inbound datagram we accept; longer payloads are truncated by the OS.
const RECV_BUFFER_SIZE: usize = 512;

/// UDP transport bound to a local port and aimed at one display client.
///
/// The socket is switched to non-blocking mode at bind time, so `send` and
/// `try_recv` are plain syscalls that return immediately. That keeps the
/// transport usable from the synchronous tick step without readiness polling.
pub struct UdpTransport {
    socket: UdpSocket,
    peer: SocketAddr,
}

impl UdpTransport {
    /// Binds `local` and targets all outbound datagrams at `peer`.
    pub fn bind(local: SocketAddr, peer: SocketAddr) -> Result<Self, EnvError> {
        let socket = UdpSocket::bind(local).map_err(|e| EnvError::bind(local, e))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| EnvError::bind(local, e))?;
        Ok(Self { socket, peer })
    }

    /// Returns the bound local address (useful after binding port 0).
    pub fn local_addr(&self) -> Result<SocketAddr, EnvError> {
        self.socket
            .local_addr()
            .map_err(|e| EnvError::network(e.to_string()))
    }

    /// Returns the peer all snapshots are sent to.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

impl DatagramTransport for UdpTransport {
    fn send(&self, payload: &[u8]) -> Result<(), EnvError> {
        self.socket
            .send_to(payload, self.peer)
            .map(|_| ())
            .map_err(|e| EnvError::network(format!("send to {}: {}", self.peer, e)))
    }

    fn try_recv(&self) -> Option<Datagram> {
        let mut buf = [0u8; RECV_BUFFER_SIZE];
        loop {
            match self.socket.recv_from(&mut buf) {
                Ok((len, from)) => {
                    return Some(Datagram::new(buf[..len].to_vec()).with_source(from.to_string()))
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return None,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                // ICMP port-unreachable from an earlier send surfaces here on some
                // platforms; it says nothing about pending input.
                Err(e) if e.kind() == ErrorKind::ConnectionReset => continue,
                Err(e) => {
                    warn!("UDP receive failed on {}: {}", self.local_label(), e);
                    return None;
                }
            }
        }
    }

    fn local_label(&self) -> String {
        match self.socket.local_addr() {
            Ok(addr) => format!("udp://{}", addr),
            Err(_) => "udp://<unbound>".to_string(),
        }
    }
}
