//! The "TRACK" layer - target lifecycle and trajectory history.
//!
//! A [`TargetRecord`] owns a [`TrajectoryLog`]: an append-only chain of
//! timestamped fixes. Nodes live in a per-log arena and link to each other
//! through integer handles; the log keeps an explicit `tail` handle so an
//! append never walks the chain.
//!
//! ```text
//!   create ──► Active ──intercept──► Destroyed
//!               ▲  │                    │
//!               └──┘ append_sample      │
//!               ▲                       │
//!               └──────reactivate───────┘
//! ```
//!
//! Interception is a soft delete: the record stays in the index as a
//! tombstone, but its trajectory memory is handed back immediately.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Handle of a sample node inside a [`TrajectoryLog`] arena.
pub type SampleHandle = usize;

/// A geographic fix in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub lat: f64,
    pub lon: f64,
}

impl Position {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }
}

/// One timestamped trajectory entry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub lat: f64,
    pub lon: f64,
    /// Detection time in engine ticks
    pub timestamp: i32,
}

impl Sample {
    pub fn new(lat: f64, lon: f64, timestamp: i32) -> Self {
        Self { lat, lon, timestamp }
    }

    #[inline]
    pub fn position(&self) -> Position {
        Position::new(self.lat, self.lon)
    }
}

#[derive(Debug, Clone)]
struct SampleNode {
    sample: Sample,
    next: Option<SampleHandle>,
}

// ============================================================================
// TRAJECTORY LOG
// ============================================================================

/// Singly linked, append-only sample history with O(1) tail append.
#[derive(Debug, Clone, Default)]
pub struct TrajectoryLog {
    nodes: Vec<SampleNode>,
    head: Option<SampleHandle>,
    /// Always the handle of the last linked node
    tail: Option<SampleHandle>,
}

impl TrajectoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Links `sample` after the current tail and returns its handle.
    pub fn append(&mut self, sample: Sample) -> SampleHandle {
        let handle = self.nodes.len();
        self.nodes.push(SampleNode { sample, next: None });
        match self.tail {
            Some(tail) => self.nodes[tail].next = Some(handle),
            None => self.head = Some(handle),
        }
        self.tail = Some(handle);
        handle
    }

    /// Handle of the most recent sample.
    pub fn tail(&self) -> Option<SampleHandle> {
        self.tail
    }

    /// Sample stored under `handle`.
    pub fn get(&self, handle: SampleHandle) -> Option<&Sample> {
        self.nodes.get(handle).map(|node| &node.sample)
    }

    pub fn first(&self) -> Option<&Sample> {
        self.head.and_then(|h| self.get(h))
    }

    /// Most recent sample, read through the tail handle.
    pub fn last(&self) -> Option<&Sample> {
        self.tail.and_then(|h| self.get(h))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Walks the chain from head to tail.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            log: self,
            cursor: self.head,
        }
    }

    /// Drops every sample and releases the arena's allocation.
    ///
    /// Returns the number of samples released.
    pub fn clear(&mut self) -> usize {
        let released = self.nodes.len();
        self.nodes = Vec::new();
        self.head = None;
        self.tail = None;
        released
    }
}

/// Iterator over a [`TrajectoryLog`] in append order.
pub struct Iter<'a> {
    log: &'a TrajectoryLog,
    cursor: Option<SampleHandle>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a Sample;

    fn next(&mut self) -> Option<Self::Item> {
        let node = &self.log.nodes[self.cursor?];
        self.cursor = node.next;
        Some(&node.sample)
    }
}

impl<'a> IntoIterator for &'a TrajectoryLog {
    type Item = &'a Sample;
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

// ============================================================================
// TARGET RECORD
// ============================================================================

/// Lifecycle status of a tracked target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TargetStatus {
    /// Intercepted; kept in the index as a tombstone
    Destroyed,
    /// Being tracked
    Active,
}

impl TargetStatus {
    /// Integer code used on the wire and in the data file.
    pub const fn code(self) -> i32 {
        match self {
            TargetStatus::Destroyed => 0,
            TargetStatus::Active => 1,
        }
    }

    /// Decodes a status code. Zero is Destroyed; anything else reads as Active.
    pub const fn from_code(code: i32) -> Self {
        if code == 0 {
            TargetStatus::Destroyed
        } else {
            TargetStatus::Active
        }
    }
}

/// One tracked entity.
///
/// Invariants:
/// - `status == Destroyed` implies an empty trajectory and `sample_count == 0`
/// - `sample_count` equals the number of samples in the trajectory
#[derive(Debug, Clone)]
pub struct TargetRecord {
    id: i32,
    threat_level: i32,
    status: TargetStatus,
    trajectory: TrajectoryLog,
    sample_count: usize,

    /// Last known position at interception, held until the broadcaster has
    /// announced the kill once
    pending_tombstone: Option<Position>,
}

impl TargetRecord {
    /// Creates an Active target with an empty trajectory.
    pub fn new(id: i32, threat_level: i32) -> Self {
        info!(target_id = id, threat_level, "CREATE     | record allocated");
        Self {
            id,
            threat_level,
            status: TargetStatus::Active,
            trajectory: TrajectoryLog::new(),
            sample_count: 0,
            pending_tombstone: None,
        }
    }

    #[inline]
    pub fn id(&self) -> i32 {
        self.id
    }

    #[inline]
    pub fn threat_level(&self) -> i32 {
        self.threat_level
    }

    #[inline]
    pub fn status(&self) -> TargetStatus {
        self.status
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.status == TargetStatus::Active
    }

    pub fn trajectory(&self) -> &TrajectoryLog {
        &self.trajectory
    }

    pub fn sample_count(&self) -> usize {
        self.sample_count
    }

    /// Current position (the latest sample), if any.
    pub fn position(&self) -> Option<Position> {
        self.trajectory.last().map(Sample::position)
    }

    /// Appends a fix in O(1).
    ///
    /// Ignored (and logged) when the target is Destroyed, so callers can feed
    /// positions without checking status first. Returns whether it was stored.
    pub fn append_sample(&mut self, lat: f64, lon: f64, timestamp: i32) -> bool {
        if self.status == TargetStatus::Destroyed {
            debug!(target_id = self.id, "APPEND     | ignored, target destroyed");
            return false;
        }
        self.trajectory.append(Sample::new(lat, lon, timestamp));
        self.sample_count += 1;
        true
    }

    /// Active -> Destroyed. Releases the trajectory immediately.
    ///
    /// Returns `false` if the target was already Destroyed.
    pub fn intercept(&mut self) -> bool {
        if self.status == TargetStatus::Destroyed {
            return false;
        }
        self.pending_tombstone = self.position();
        let released = self.trajectory.clear();
        self.sample_count = 0;
        self.status = TargetStatus::Destroyed;
        info!(
            target_id = self.id,
            released, "KILL       | target neutralized, trajectory memory reclaimed"
        );
        true
    }

    /// Destroyed -> Active, restarting the trajectory with one re-detection fix.
    ///
    /// Returns `false` (and changes nothing) if the target is already Active.
    pub fn reactivate(&mut self, threat_level: i32, lat: f64, lon: f64, timestamp: i32) -> bool {
        if self.status == TargetStatus::Active {
            return false;
        }
        self.status = TargetStatus::Active;
        self.threat_level = threat_level;
        self.pending_tombstone = None;
        self.trajectory.clear();
        self.sample_count = 0;
        self.append_sample(lat, lon, timestamp);
        info!(target_id = self.id, threat_level, "REACTIVATE | target re-detected");
        true
    }

    /// Position awaiting its one terminal broadcast, if any.
    pub fn pending_tombstone(&self) -> Option<Position> {
        self.pending_tombstone
    }

    /// Takes the pending terminal position; subsequent calls return `None`.
    pub fn take_pending_tombstone(&mut self) -> Option<Position> {
        self.pending_tombstone.take()
    }

    /// Restores a persisted status on a freshly created record.
    pub(crate) fn restore_status(&mut self, status: TargetStatus) {
        if status == TargetStatus::Destroyed {
            self.trajectory.clear();
            self.sample_count = 0;
        }
        self.status = status;
    }

    /// Consumes the record, draining its trajectory. Returns the samples freed.
    pub fn dispose(mut self) -> usize {
        self.trajectory.clear()
    }
}
