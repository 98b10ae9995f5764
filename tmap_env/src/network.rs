//! Datagram transport abstraction for the T-MAP server.

use crate::error::EnvError;
use crate::types::Datagram;

/// Abstraction over the unreliable datagram channel between the server and
/// its display clients.
///
/// # Implementations
///
/// - **Production**: [`UdpTransport`](crate::UdpTransport), a non-blocking UDP socket
/// - **Simulation**: in-memory queues with configurable loss
///
/// # Packet Flow
///
/// ```text
/// Server                     Network                    Client
///   |                           |                          |
///   |-- send(snapshot) -------->|                          |
///   |                           |-- [loss] --------------->|
///   |                           |<------- intercept(id) ---|
///   |<-- try_recv() ------------|                          |
/// ```
///
/// Neither direction is acknowledged. The server re-sends the full snapshot
/// every tick, so a dropped packet is repaired by the next one.
pub trait DatagramTransport: Send + Sync + 'static {
    /// Sends one datagram to the configured peer.
    ///
    /// # Returns
    /// * `Ok(())` - Datagram handed to the channel
    /// * `Err(EnvError::NetworkError)` - Immediate send failure (e.g., buffer full)
    ///
    /// # Note
    /// Success does not guarantee delivery. Never blocks.
    fn send(&self, payload: &[u8]) -> Result<(), EnvError>;

    /// Returns the next pending inbound datagram, if any.
    ///
    /// # Blocking
    /// Never blocks: returns `None` as soon as the inbound queue is empty.
    fn try_recv(&self) -> Option<Datagram>;

    /// Human-readable description of the local endpoint (for logging).
    fn local_label(&self) -> String;
}

/// Marker trait for network controllers in simulation.
///
/// Allows injecting faults into the broadcast path.
pub trait NetworkController: Send + Sync {
    /// Sets the probability (0.0 - 1.0) that an outbound datagram is dropped.
    fn set_loss(&self, loss_rate: f64);

    /// Cuts the link: every datagram in either direction is dropped.
    fn partition(&self);

    /// Restores the link after a partition.
    fn heal_all(&self);
}
