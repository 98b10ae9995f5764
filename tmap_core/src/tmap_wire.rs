//! Wire format between the tracking server and display clients.
//!
//! Outbound, one fixed-layout [`TargetPacket`] per datagram:
//!
//! ```text
//! offset  size  field
//!      0     4  id            i32
//!      4     8  lat           f64
//!     12     8  lon           f64
//!     20     4  threat_level  i32
//!     24     4  status        i32   (1 = active, 0 = destroyed)
//!     28        (no padding)
//! ```
//!
//! Inbound, the only command is a bare 4-byte `i32` target id meaning
//! "intercept this target".
//!
//! All fields are little-endian. There are no sequence numbers or acks: the
//! server resends every live target each tick, so a lost datagram is
//! repaired by the next snapshot.
//!
//! Snapshot contract: while a target is Active it appears in every snapshot
//! with `status = 1`. In the first snapshot after its interception it
//! appears exactly once with `status = 0` at its last known position; after
//! that it is silent until reactivated.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tmap_index::TrackIndex;
use crate::tmap_track::{Position, TargetRecord, TargetStatus};

/// Size of an encoded [`TargetPacket`].
pub const PACKET_SIZE: usize = 28;

/// Size of an encoded intercept command.
pub const COMMAND_SIZE: usize = 4;

/// Errors decoding wire datagrams.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("{kind} datagram must be {expected} bytes, got {found}")]
    BadLength {
        kind: &'static str,
        expected: usize,
        found: usize,
    },
}

/// One target's state as broadcast to clients.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TargetPacket {
    pub id: i32,
    pub lat: f64,
    pub lon: f64,
    pub threat_level: i32,
    pub status: i32,
}

impl TargetPacket {
    /// Packet for an Active record at its latest fix. `None` if the record is
    /// Destroyed or has never been sighted.
    pub fn active(record: &TargetRecord) -> Option<Self> {
        if !record.is_active() {
            return None;
        }
        let position = record.position()?;
        Some(Self {
            id: record.id(),
            lat: position.lat,
            lon: position.lon,
            threat_level: record.threat_level(),
            status: TargetStatus::Active.code(),
        })
    }

    /// Terminal packet announcing a kill at `last_known`.
    pub fn destroyed(record: &TargetRecord, last_known: Position) -> Self {
        Self {
            id: record.id(),
            lat: last_known.lat,
            lon: last_known.lon,
            threat_level: record.threat_level(),
            status: TargetStatus::Destroyed.code(),
        }
    }

    pub fn status(&self) -> TargetStatus {
        TargetStatus::from_code(self.status)
    }

    pub fn encode(&self) -> [u8; PACKET_SIZE] {
        let mut buf = [0u8; PACKET_SIZE];
        buf[0..4].copy_from_slice(&self.id.to_le_bytes());
        buf[4..12].copy_from_slice(&self.lat.to_le_bytes());
        buf[12..20].copy_from_slice(&self.lon.to_le_bytes());
        buf[20..24].copy_from_slice(&self.threat_level.to_le_bytes());
        buf[24..28].copy_from_slice(&self.status.to_le_bytes());
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let buf: &[u8; PACKET_SIZE] = bytes.try_into().map_err(|_| WireError::BadLength {
            kind: "target packet",
            expected: PACKET_SIZE,
            found: bytes.len(),
        })?;
        Ok(Self {
            id: i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            lat: f64::from_le_bytes(array8(&buf[4..12])),
            lon: f64::from_le_bytes(array8(&buf[12..20])),
            threat_level: i32::from_le_bytes([buf[20], buf[21], buf[22], buf[23]]),
            status: i32::from_le_bytes([buf[24], buf[25], buf[26], buf[27]]),
        })
    }
}

#[inline]
fn array8(slice: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(slice);
    out
}

/// Walks the index in id order and builds this tick's snapshot.
///
/// Consumes pending tombstones, so each kill is announced exactly once.
pub fn encode_snapshot(index: &mut TrackIndex) -> Vec<TargetPacket> {
    let mut packets = Vec::with_capacity(index.len());
    index.for_each_mut(|record| {
        if let Some(packet) = TargetPacket::active(record) {
            packets.push(packet);
        } else if let Some(last_known) = record.take_pending_tombstone() {
            packets.push(TargetPacket::destroyed(record, last_known));
        }
    });
    packets
}

/// Decodes an inbound intercept command into the target id.
pub fn decode_command(bytes: &[u8]) -> Result<i32, WireError> {
    let buf: [u8; COMMAND_SIZE] = bytes.try_into().map_err(|_| WireError::BadLength {
        kind: "command",
        expected: COMMAND_SIZE,
        found: bytes.len(),
    })?;
    Ok(i32::from_le_bytes(buf))
}

/// Encodes an intercept command for `target_id`.
pub fn encode_command(target_id: i32) -> [u8; COMMAND_SIZE] {
    target_id.to_le_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracked(id: i32, threat: i32, fixes: &[(f64, f64)]) -> TargetRecord {
        let mut r = TargetRecord::new(id, threat);
        for (t, (lat, lon)) in fixes.iter().enumerate() {
            r.append_sample(*lat, *lon, t as i32);
        }
        r
    }

    #[test]
    fn test_packet_layout_is_packed_little_endian() {
        let packet = TargetPacket {
            id: 0x0102_0304,
            lat: 37.5,
            lon: 127.0,
            threat_level: 9,
            status: 1,
        };
        let bytes = packet.encode();
        assert_eq!(bytes.len(), 28);
        assert_eq!(&bytes[0..4], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&bytes[4..12], &37.5f64.to_le_bytes());
        assert_eq!(&bytes[12..20], &127.0f64.to_le_bytes());
        assert_eq!(&bytes[20..24], &[9, 0, 0, 0]);
        assert_eq!(&bytes[24..28], &[1, 0, 0, 0]);
        assert_eq!(TargetPacket::decode(&bytes), Ok(packet));
    }

    #[test]
    fn test_decode_rejects_wrong_length() {
        let err = TargetPacket::decode(&[0u8; 27]).unwrap_err();
        assert_eq!(
            err,
            WireError::BadLength {
                kind: "target packet",
                expected: 28,
                found: 27
            }
        );
    }

    #[test]
    fn test_command_decoding() {
        assert_eq!(decode_command(&encode_command(42)), Ok(42));
        assert_eq!(decode_command(&encode_command(-7)), Ok(-7));
        assert!(decode_command(&[1, 0, 0]).is_err());
        assert!(decode_command(&[1, 0, 0, 0, 0]).is_err());
    }

    #[test]
    fn test_snapshot_uses_latest_fix_in_id_order() {
        let mut index = TrackIndex::new();
        index.insert(tracked(20, 3, &[(1.0, 1.0), (2.0, 2.0)]));
        index.insert(tracked(10, 8, &[(5.0, 6.0)]));

        let packets = encode_snapshot(&mut index);
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].id, 10);
        assert_eq!((packets[1].lat, packets[1].lon), (2.0, 2.0));
        assert!(packets.iter().all(|p| p.status == 1));
    }

    #[test]
    fn test_destroyed_target_announced_exactly_once() {
        let mut index = TrackIndex::new();
        index.insert(tracked(1, 9, &[(37.5, 127.0), (37.6, 127.1)]));
        index.insert(tracked(2, 4, &[(37.4, 126.9)]));
        index.search_mut(1).unwrap().intercept();

        let first = encode_snapshot(&mut index);
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].id, 1);
        assert_eq!(first[0].status(), TargetStatus::Destroyed);
        assert_eq!((first[0].lat, first[0].lon), (37.6, 127.1));

        let second = encode_snapshot(&mut index);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].id, 2);
    }

    #[test]
    fn test_unsighted_active_target_not_broadcast() {
        let mut index = TrackIndex::new();
        index.insert(TargetRecord::new(5, 5));
        assert!(encode_snapshot(&mut index).is_empty());
    }
}
