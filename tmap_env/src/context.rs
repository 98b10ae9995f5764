//! Core environment context trait for the T-MAP server.

use async_trait::async_trait;
use std::time::Duration;

/// The central interface for time.
///
/// This trait abstracts the "real world" clock so that the tick loop can run
/// in both production (tokio) and simulation (virtual clock) environments.
///
/// # Implementations
///
/// - **Production**: `TokioContext` - wraps `tokio::time`
/// - **Simulation**: `SimContext` - a manually advanced virtual clock
#[async_trait]
pub trait TmapContext: Send + Sync + 'static {
    /// Returns the current monotonic time since context creation.
    ///
    /// In simulation, this is the virtual clock time.
    fn now(&self) -> Duration;

    /// Suspends execution for the given duration.
    ///
    /// In production: wraps `tokio::time::sleep`
    /// In simulation: advances the virtual clock and returns immediately
    async fn sleep(&self, duration: Duration);

    /// Returns the context's seed (for logging/debugging).
    ///
    /// In production, returns 0 (not seeded).
    fn seed(&self) -> u64;
}
