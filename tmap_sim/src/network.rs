//! Simulated datagram link with fault injection.
//!
//! One [`sim_link`] call creates the three ends of an in-memory channel:
//! - [`SimNetwork`]: the server side, a [`DatagramTransport`]
//! - [`SimClient`]: a display client that sends intercept commands and keeps
//!   a picture of the targets it has heard about
//! - [`SimNetworkController`]: loss rate and partitions, a [`NetworkController`]
//!
//! Loss is decided per datagram from a seeded ChaCha8 stream, so a run with
//! the same seed drops the same datagrams.

use rand::Rng;
use rand_chacha::ChaCha8Rng;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use tmap_core::tmap_wire::{self, TargetPacket};
use tmap_core::TargetStatus;
use tmap_env::{Datagram, DatagramTransport, EnvError, NetworkController};
use tracing::{debug, warn};

/// Label the client's datagrams carry as their source.
const CLIENT_LABEL: &str = "sim-client";

/// Link statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub delivered: u64,
    pub dropped: u64,
}

/// Shared state of the simulated link.
struct Link {
    to_client: VecDeque<Vec<u8>>,
    to_server: VecDeque<Vec<u8>>,
    loss_rate: f64,
    partitioned: bool,
    rng: ChaCha8Rng,
    stats: LinkStats,
}

impl Link {
    /// Rolls for loss. Returns whether the datagram survives.
    fn survives(&mut self) -> bool {
        let keep = self.loss_rate <= 0.0 || self.rng.gen::<f64>() >= self.loss_rate;
        if keep {
            self.stats.delivered += 1;
        } else {
            self.stats.dropped += 1;
        }
        keep
    }
}

/// Creates a connected server/client/controller triple.
pub fn sim_link(rng: ChaCha8Rng) -> (SimNetwork, SimClient, SimNetworkController) {
    let link = Arc::new(Mutex::new(Link {
        to_client: VecDeque::new(),
        to_server: VecDeque::new(),
        loss_rate: 0.0,
        partitioned: false,
        rng,
        stats: LinkStats::default(),
    }));
    (
        SimNetwork {
            link: Arc::clone(&link),
        },
        SimClient {
            link: Arc::clone(&link),
            tracks: BTreeMap::new(),
            polls: 0,
            malformed: 0,
        },
        SimNetworkController { link },
    )
}

/// Server end of the simulated link.
pub struct SimNetwork {
    link: Arc<Mutex<Link>>,
}

impl SimNetwork {
    /// Datagrams sent but not yet drained by the client.
    pub fn in_flight(&self) -> usize {
        self.link.lock().unwrap().to_client.len()
    }
}

impl DatagramTransport for SimNetwork {
    fn send(&self, payload: &[u8]) -> Result<(), EnvError> {
        let mut link = self.link.lock().unwrap();
        if link.partitioned {
            link.stats.dropped += 1;
            return Err(EnvError::LinkDown("simulated partition".to_string()));
        }
        if link.survives() {
            link.to_client.push_back(payload.to_vec());
        }
        Ok(())
    }

    fn try_recv(&self) -> Option<Datagram> {
        let mut link = self.link.lock().unwrap();
        link.to_server
            .pop_front()
            .map(|payload| Datagram::new(payload).with_source(CLIENT_LABEL))
    }

    fn local_label(&self) -> String {
        "sim://server".to_string()
    }
}

/// What a client currently believes about one target.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackView {
    pub packet: TargetPacket,
    /// Client poll count at the last update
    pub last_seen: u64,
}

/// Client end of the simulated link.
///
/// Mirrors a display client: Active packets create or refresh a track, a
/// destroyed packet removes it, and tracks that go unrefreshed can be pruned.
pub struct SimClient {
    link: Arc<Mutex<Link>>,
    tracks: BTreeMap<i32, TrackView>,
    polls: u64,
    malformed: u64,
}

impl SimClient {
    /// Sends an intercept command. Returns whether it survived the link.
    pub fn send_intercept(&self, target_id: i32) -> bool {
        let mut link = self.link.lock().unwrap();
        if link.partitioned {
            link.stats.dropped += 1;
            return false;
        }
        let delivered = link.survives();
        if delivered {
            link.to_server
                .push_back(tmap_wire::encode_command(target_id).to_vec());
        }
        debug!(target_id, delivered, "CLIENT     | intercept sent");
        delivered
    }

    /// Sends raw bytes to the server, bypassing the codec.
    pub fn send_raw(&self, payload: &[u8]) {
        self.link.lock().unwrap().to_server.push_back(payload.to_vec());
    }

    /// Drains every pending packet into the client's picture.
    ///
    /// Returns the packets received this poll.
    pub fn poll(&mut self) -> Vec<TargetPacket> {
        let pending: Vec<Vec<u8>> = self.link.lock().unwrap().to_client.drain(..).collect();
        self.polls += 1;
        let poll = self.polls;

        let mut received = Vec::with_capacity(pending.len());
        for bytes in pending {
            let packet = match TargetPacket::decode(&bytes) {
                Ok(packet) => packet,
                Err(e) => {
                    self.malformed += 1;
                    warn!(error = %e, "CLIENT     | malformed packet dropped");
                    continue;
                }
            };
            match packet.status() {
                TargetStatus::Active => {
                    self.tracks.insert(
                        packet.id,
                        TrackView {
                            packet,
                            last_seen: poll,
                        },
                    );
                }
                TargetStatus::Destroyed => {
                    self.tracks.remove(&packet.id);
                }
            }
            received.push(packet);
        }
        received
    }

    /// Drops tracks not refreshed within the last `max_age` polls.
    /// Returns how many were removed.
    pub fn prune_stale(&mut self, max_age: u64) -> usize {
        let now = self.polls;
        let before = self.tracks.len();
        self.tracks
            .retain(|_, view| now.saturating_sub(view.last_seen) <= max_age);
        before - self.tracks.len()
    }

    /// Ids of the targets the client currently displays, ascending.
    pub fn visible_ids(&self) -> Vec<i32> {
        self.tracks.keys().copied().collect()
    }

    pub fn track(&self, id: i32) -> Option<&TrackView> {
        self.tracks.get(&id)
    }

    pub fn malformed(&self) -> u64 {
        self.malformed
    }
}

/// Network controller for fault injection.
pub struct SimNetworkController {
    link: Arc<Mutex<Link>>,
}

impl SimNetworkController {
    pub fn stats(&self) -> LinkStats {
        self.link.lock().unwrap().stats
    }

    pub fn loss_rate(&self) -> f64 {
        self.link.lock().unwrap().loss_rate
    }

    pub fn is_partitioned(&self) -> bool {
        self.link.lock().unwrap().partitioned
    }
}

impl NetworkController for SimNetworkController {
    fn set_loss(&self, loss_rate: f64) {
        self.link.lock().unwrap().loss_rate = loss_rate.clamp(0.0, 1.0);
    }

    fn partition(&self) {
        self.link.lock().unwrap().partitioned = true;
    }

    fn heal_all(&self) {
        self.link.lock().unwrap().partitioned = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn link() -> (SimNetwork, SimClient, SimNetworkController) {
        sim_link(ChaCha8Rng::seed_from_u64(42))
    }

    fn packet(id: i32, status: i32) -> TargetPacket {
        TargetPacket {
            id,
            lat: 37.5,
            lon: 127.0,
            threat_level: 5,
            status,
        }
    }

    #[test]
    fn test_clean_link_delivers_in_order() {
        let (server, mut client, controller) = link();
        for id in 1..=3 {
            server.send(&packet(id, 1).encode()).unwrap();
        }
        assert_eq!(server.in_flight(), 3);

        let got: Vec<i32> = client.poll().iter().map(|p| p.id).collect();
        assert_eq!(got, vec![1, 2, 3]);
        assert_eq!(client.visible_ids(), vec![1, 2, 3]);
        assert_eq!(client.track(2).map(|t| t.packet), Some(packet(2, 1)));
        assert_eq!(client.track(2).map(|t| t.last_seen), Some(1));
        assert!(client.track(4).is_none());
        assert_eq!(controller.stats().delivered, 3);
    }

    #[test]
    fn test_destroyed_packet_removes_track() {
        let (server, mut client, _controller) = link();
        server.send(&packet(9, 1).encode()).unwrap();
        client.poll();
        server.send(&packet(9, 0).encode()).unwrap();
        client.poll();
        assert!(client.visible_ids().is_empty());
    }

    #[test]
    fn test_commands_reach_server() {
        let (server, client, _controller) = link();
        assert!(client.send_intercept(17));

        let datagram = server.try_recv().unwrap();
        assert_eq!(tmap_wire::decode_command(&datagram.payload), Ok(17));
        assert_eq!(datagram.source.as_deref(), Some(CLIENT_LABEL));
        assert!(server.try_recv().is_none());
    }

    #[test]
    fn test_loss_rate_drops_roughly_that_share() {
        let (server, mut client, controller) = link();
        controller.set_loss(0.5);

        for id in 0..2000 {
            server.send(&packet(id, 1).encode()).unwrap();
        }
        let received = client.poll().len();
        let stats = controller.stats();
        assert_eq!(stats.delivered + stats.dropped, 2000);
        assert_eq!(received as u64, stats.delivered);
        assert!((800..1200).contains(&received), "received {received}");
    }

    #[test]
    fn test_total_loss_and_partition() {
        let (server, client, controller) = link();
        controller.set_loss(1.0);
        server.send(&packet(1, 1).encode()).unwrap();
        assert_eq!(server.in_flight(), 0);

        controller.set_loss(0.0);
        controller.partition();
        assert!(controller.is_partitioned());
        assert!(server.send(&packet(1, 1).encode()).is_err());
        assert!(!client.send_intercept(1));

        controller.heal_all();
        assert!(!controller.is_partitioned());
        assert!(server.send(&packet(1, 1).encode()).is_ok());
        assert_eq!(server.in_flight(), 1);
    }

    #[test]
    fn test_same_seed_same_losses() {
        let run = || {
            let (server, mut client, controller) = link();
            controller.set_loss(0.3);
            for id in 0..200 {
                server.send(&packet(id, 1).encode()).unwrap();
            }
            client.poll().iter().map(|p| p.id).collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_prune_stale_tracks() {
        let (server, mut client, _controller) = link();
        server.send(&packet(1, 1).encode()).unwrap();
        server.send(&packet(2, 1).encode()).unwrap();
        client.poll();

        for _ in 0..3 {
            server.send(&packet(2, 1).encode()).unwrap();
            client.poll();
        }
        assert_eq!(client.prune_stale(2), 1);
        assert_eq!(client.visible_ids(), vec![2]);
    }

    #[test]
    fn test_client_counts_malformed() {
        let (server, mut client, _controller) = link();
        server.send(&[0u8; 5]).unwrap();
        assert!(client.poll().is_empty());
        assert_eq!(client.malformed(), 1);
    }
}
