//! Error types for the tracking engine.

use thiserror::Error;

use crate::tmap_persist::PersistError;
use crate::tmap_wire::WireError;

/// Errors surfaced by [`TrackEngine`](crate::TrackEngine) operations.
///
/// Lookups of unknown ids are not errors: they return `None`.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A target with this id is already indexed
    #[error("Target {0} already exists")]
    DuplicateId(i32),

    /// The operation needs an indexed target and none has this id
    #[error("Target {0} not found")]
    UnknownTarget(i32),

    /// Threat levels are graded 1 (lowest) to 10 (highest)
    #[error("Threat level {0} outside 1..=10")]
    InvalidThreat(i32),

    #[error("Wire error: {0}")]
    Wire(#[from] WireError),

    #[error("Persistence error: {0}")]
    Persist(#[from] PersistError),
}
