//! T-MAP Core - in-memory tracking engine for moving targets
//!
//! This library keeps every tracked target in one owning structure and serves
//! the per-tick needs of a display server:
//! 1. **Ordered lookup**: a B-tree keyed by target id with tombstone deletes
//! 2. **History**: an O(1)-append trajectory log per target
//! 3. **Spatial queries**: a quadtree rebuilt from Active targets every tick
//! 4. **I/O formats**: the 28-byte snapshot datagram and the binary data file

pub mod error;
pub mod tmap_track;
pub mod tmap_index;
pub mod tmap_space;
pub mod tmap_wire;
pub mod tmap_persist;
pub mod engine_runtime;

// Re-export key types for convenience
pub use error::EngineError;
pub use tmap_track::{Position, Sample, TargetRecord, TargetStatus, TrajectoryLog};
pub use tmap_index::{InvariantViolation, TeardownStats, TrackIndex};
pub use tmap_space::{QuadCell, SpatialIndex};
pub use tmap_wire::{TargetPacket, WireError};
pub use tmap_persist::{LoadSummary, PersistError};
pub use engine_runtime::{
    Bounds, EngineConfig, MotionModel, TickReport, TmapServer, TrackEngine,
};
