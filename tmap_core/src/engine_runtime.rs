//! Engine Runtime - the owning context and the tick driver.
//!
//! [`TrackEngine`] owns the track index and is the only way operations reach
//! it: console commands, network commands, the motion model and the
//! persistence codec all go through one value passed explicitly.
//!
//! [`TmapServer`] wraps an engine with an environment context and a datagram
//! transport and runs one tick at a time:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                        TmapServer                             │
//! │  ┌─────────────────────────────────────────────────────────┐  │
//! │  │  Context: TmapContext       Network: DatagramTransport  │  │
//! │  │  • sleep() → tick pacing    • try_recv() → commands     │  │
//! │  │                             • send() → snapshot         │  │
//! │  └─────────────────────────────────────────────────────────┘  │
//! │                                                               │
//! │   drain commands → advance motion → rebuild quadtree → send   │
//! │                                                               │
//! │  ┌─────────────┐  ┌──────────────┐  ┌──────────────────────┐  │
//! │  │ TrackIndex  │  │ SpatialIndex │  │ TargetPacket stream  │  │
//! │  │  (B-tree)   │  │  (per tick)  │  │  (28-byte datagrams) │  │
//! │  └─────────────┘  └──────────────┘  └──────────────────────┘  │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use tmap_core::engine_runtime::{EngineConfig, TmapServer, TrackEngine};
//! use tmap_env::{TokioContext, UdpTransport};
//!
//! let ctx = TokioContext::shared();
//! let net = Arc::new(UdpTransport::bind("0.0.0.0:8888", "127.0.0.1:9999")?);
//! let mut server = TmapServer::new(ctx, net, TrackEngine::new(EngineConfig::default()));
//!
//! loop {
//!     server.tick(&mut model);
//!     server.pace().await;
//! }
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use geo::{coord, Rect};
use serde::{Deserialize, Serialize};
use tmap_env::{DatagramTransport, TmapContext};
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::tmap_index::TrackIndex;
use crate::tmap_persist::{self, LoadSummary};
use crate::tmap_space::SpatialIndex;
use crate::tmap_track::{Position, TargetRecord};
use crate::tmap_wire::{self, TargetPacket};

/// Lowest valid threat level.
pub const MIN_THREAT: i32 = 1;

/// Highest valid threat level.
pub const MAX_THREAT: i32 = 10;

/// Geographic operating area in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub lat_min: f64,
    pub lat_max: f64,
    pub lon_min: f64,
    pub lon_max: f64,
}

impl Bounds {
    /// Quadtree root rectangle (`x = lon`, `y = lat`).
    pub fn to_rect(&self) -> Rect<f64> {
        Rect::new(
            coord! { x: self.lon_min, y: self.lat_min },
            coord! { x: self.lon_max, y: self.lat_max },
        )
    }

    /// Half-open containment, matching the quadtree root cell.
    pub fn contains(&self, position: Position) -> bool {
        position.lat >= self.lat_min
            && position.lat < self.lat_max
            && position.lon >= self.lon_min
            && position.lon < self.lon_max
    }
}

impl Default for Bounds {
    fn default() -> Self {
        Self {
            lat_min: 37.40,
            lat_max: 37.60,
            lon_min: 126.88,
            lon_max: 127.12,
        }
    }
}

/// Configuration for a tracking engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Engine's logical name (for logging)
    pub name: String,

    /// Wall-clock period of one tick (default: 100 ms)
    pub tick_period: Duration,

    /// Quadtree root area
    pub bounds: Bounds,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: "tmap-engine".to_string(),
            tick_period: Duration::from_millis(100),
            bounds: Bounds::default(),
        }
    }
}

/// Produces the next fix of an Active target each tick.
///
/// Returning `None` leaves the target where it is for this tick.
pub trait MotionModel {
    fn next_fix(&mut self, record: &TargetRecord, tick: u64) -> Option<Position>;
}

/// Checks a threat level is in `MIN_THREAT..=MAX_THREAT`.
pub fn validate_threat(threat_level: i32) -> Result<i32, EngineError> {
    if (MIN_THREAT..=MAX_THREAT).contains(&threat_level) {
        Ok(threat_level)
    } else {
        Err(EngineError::InvalidThreat(threat_level))
    }
}

// ============================================================================
// TRACK ENGINE
// ============================================================================

/// The single owning context for all tracked targets.
#[derive(Debug)]
pub struct TrackEngine {
    config: EngineConfig,
    index: TrackIndex,
    tick_count: u64,
}

impl TrackEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_index(config, TrackIndex::new())
    }

    /// Wraps an already populated index, e.g. one restored from disk.
    pub fn with_index(config: EngineConfig, index: TrackIndex) -> Self {
        Self {
            config,
            index,
            tick_count: 0,
        }
    }

    /// Restores an engine from a data file. A missing file boots an empty one.
    pub fn load(
        config: EngineConfig,
        path: impl AsRef<Path>,
    ) -> Result<(Self, LoadSummary), EngineError> {
        let (index, summary) = tmap_persist::load_from_path(path)?;
        Ok((Self::with_index(config, index), summary))
    }

    /// Writes every record to `path`. Returns the record count.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<usize, EngineError> {
        Ok(tmap_persist::save_to_path(&self.index, path)?)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn index(&self) -> &TrackIndex {
        &self.index
    }

    pub fn index_mut(&mut self) -> &mut TrackIndex {
        &mut self.index
    }

    pub fn into_index(self) -> TrackIndex {
        self.index
    }

    /// Number of completed `advance` calls.
    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    /// Sample timestamp for the current tick.
    pub fn timestamp(&self) -> i32 {
        i32::try_from(self.tick_count).unwrap_or(i32::MAX)
    }

    pub fn find(&self, id: i32) -> Option<&TargetRecord> {
        self.index.search(id)
    }

    /// Registers a new Active target with its first fix.
    pub fn add_target(
        &mut self,
        id: i32,
        threat_level: i32,
        position: Position,
    ) -> Result<(), EngineError> {
        let threat_level = validate_threat(threat_level)?;
        if self.index.contains(id) {
            return Err(EngineError::DuplicateId(id));
        }
        let mut record = TargetRecord::new(id, threat_level);
        record.append_sample(position.lat, position.lon, self.timestamp());
        self.index.insert(record);
        Ok(())
    }

    /// Intercepts a target. Returns `false` for unknown or already destroyed ids.
    pub fn intercept(&mut self, id: i32) -> bool {
        match self.index.search_mut(id) {
            Some(record) => record.intercept(),
            None => {
                warn!(target_id = id, "KILL       | no such target");
                false
            }
        }
    }

    /// Brings a destroyed target back at `position`.
    ///
    /// `Ok(false)` if the target is already Active.
    pub fn reactivate(
        &mut self,
        id: i32,
        threat_level: i32,
        position: Position,
    ) -> Result<bool, EngineError> {
        let threat_level = validate_threat(threat_level)?;
        let timestamp = self.timestamp();
        let record = self
            .index
            .search_mut(id)
            .ok_or(EngineError::UnknownTarget(id))?;
        Ok(record.reactivate(threat_level, position.lat, position.lon, timestamp))
    }

    /// Appends an externally observed fix. `false` if unknown or destroyed.
    pub fn record_fix(&mut self, id: i32, position: Position) -> bool {
        let timestamp = self.timestamp();
        self.index
            .search_mut(id)
            .is_some_and(|record| record.append_sample(position.lat, position.lon, timestamp))
    }

    /// Active targets with `threat_level >= threshold`, ascending by id.
    pub fn threat_scan(&self, threshold: i32) -> Vec<&TargetRecord> {
        self.index.threat_scan(threshold)
    }

    /// Applies one inbound intercept datagram.
    ///
    /// Returns whether a target changed state.
    pub fn apply_command(&mut self, bytes: &[u8]) -> Result<bool, EngineError> {
        let id = tmap_wire::decode_command(bytes)?;
        Ok(self.intercept(id))
    }

    /// Steps every Active target through `model` and appends the new fixes.
    ///
    /// Returns the number of targets that moved.
    pub fn advance(&mut self, model: &mut dyn MotionModel) -> usize {
        self.tick_count += 1;
        let tick = self.tick_count;
        let timestamp = self.timestamp();
        let mut moved = 0;
        self.index.for_each_mut(|record| {
            if !record.is_active() {
                return;
            }
            if let Some(fix) = model.next_fix(record, tick) {
                if record.append_sample(fix.lat, fix.lon, timestamp) {
                    moved += 1;
                }
            }
        });
        moved
    }

    /// Builds this tick's quadtree over the Active targets.
    pub fn spatial_index(&self) -> SpatialIndex<'_> {
        SpatialIndex::build(self.config.bounds.to_rect(), &self.index)
    }

    /// Encodes this tick's snapshot, consuming pending tombstones.
    pub fn snapshot(&mut self) -> Vec<TargetPacket> {
        tmap_wire::encode_snapshot(&mut self.index)
    }

    /// Rebuilds the index without announced tombstones. Returns how many
    /// records were dropped.
    pub fn compact(&mut self) -> usize {
        let index = std::mem::take(&mut self.index);
        let (compacted, dropped) = index.compact();
        self.index = compacted;
        dropped
    }
}

// ============================================================================
// TICK DRIVER
// ============================================================================

/// What happened during one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickReport {
    pub tick: u64,
    /// Well-formed intercept commands received
    pub commands: usize,
    /// Commands that changed a target's state
    pub intercepted: usize,
    /// Datagrams with the wrong length
    pub malformed: usize,
    /// Targets that received a new fix
    pub moved: usize,
    /// Points accepted by the quadtree
    pub indexed: usize,
    /// Points outside the operating area
    pub out_of_bounds: usize,
    pub quad_depth: usize,
    pub packets_sent: usize,
    pub send_failures: usize,
}

/// Tick driver over an engine.
///
/// Generic over the context and network implementations, so the same loop
/// runs in production (tokio clock, UDP) or simulation (virtual clock,
/// in-memory lossy network).
pub struct TmapServer<Ctx, Net>
where
    Ctx: TmapContext,
    Net: DatagramTransport,
{
    /// Environment context
    pub context: Arc<Ctx>,

    /// Network interface
    pub network: Arc<Net>,

    engine: TrackEngine,

    /// Packets encoded on the most recent tick
    last_snapshot: Vec<TargetPacket>,
}

impl<Ctx, Net> TmapServer<Ctx, Net>
where
    Ctx: TmapContext,
    Net: DatagramTransport,
{
    pub fn new(context: Arc<Ctx>, network: Arc<Net>, engine: TrackEngine) -> Self {
        info!(
            name = %engine.config().name,
            transport = %network.local_label(),
            seed = context.seed(),
            records = engine.index().len(),
            "SERVER     | online"
        );
        Self {
            context,
            network,
            engine,
            last_snapshot: Vec::new(),
        }
    }

    pub fn engine(&self) -> &TrackEngine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut TrackEngine {
        &mut self.engine
    }

    pub fn into_engine(self) -> TrackEngine {
        self.engine
    }

    /// Packets encoded on the most recent tick, before any loss.
    pub fn last_snapshot(&self) -> &[TargetPacket] {
        &self.last_snapshot
    }

    /// Drains every pending inbound datagram without blocking.
    ///
    /// Returns `(commands, intercepted, malformed)`.
    pub fn drain_commands(&mut self) -> (usize, usize, usize) {
        let (mut commands, mut intercepted, mut malformed) = (0, 0, 0);
        while let Some(datagram) = self.network.try_recv() {
            match self.engine.apply_command(&datagram.payload) {
                Ok(changed) => {
                    commands += 1;
                    if changed {
                        intercepted += 1;
                    }
                }
                Err(e) => {
                    malformed += 1;
                    warn!(
                        source = datagram.source.as_deref().unwrap_or("?"),
                        bytes = datagram.size(),
                        error = %e,
                        "RECV       | malformed command dropped"
                    );
                }
            }
        }
        (commands, intercepted, malformed)
    }

    /// Runs one tick.
    pub fn tick(&mut self, model: &mut dyn MotionModel) -> TickReport {
        self.tick_with(model, |_| {})
    }

    /// Runs one tick, handing this tick's quadtree to `observer` before it is
    /// dropped.
    pub fn tick_with<F>(&mut self, model: &mut dyn MotionModel, observer: F) -> TickReport
    where
        F: FnOnce(&SpatialIndex<'_>),
    {
        let (commands, intercepted, malformed) = self.drain_commands();
        let moved = self.engine.advance(model);

        let (indexed, out_of_bounds, quad_depth) = {
            let spatial = self.engine.spatial_index();
            observer(&spatial);
            (spatial.len(), spatial.rejected(), spatial.depth())
        };

        let packets = self.engine.snapshot();
        let mut send_failures = 0;
        let mut last_error = None;
        for packet in &packets {
            if let Err(e) = self.network.send(&packet.encode()) {
                send_failures += 1;
                last_error = Some(e);
            }
        }
        if let Some(e) = last_error {
            warn!(failures = send_failures, error = %e, "SEND       | snapshot datagrams dropped");
        }

        let report = TickReport {
            tick: self.engine.tick_count(),
            commands,
            intercepted,
            malformed,
            moved,
            indexed,
            out_of_bounds,
            quad_depth,
            packets_sent: packets.len() - send_failures,
            send_failures,
        };
        self.last_snapshot = packets;
        debug!(
            tick = report.tick,
            moved = report.moved,
            indexed = report.indexed,
            depth = report.quad_depth,
            sent = report.packets_sent,
            "TICK       | complete"
        );
        report
    }

    /// Wall-clock period of one tick.
    pub fn tick_interval(&self) -> Duration {
        self.engine.config().tick_period
    }

    /// Sleeps for one tick interval on the server's context.
    pub async fn pace(&self) {
        self.context.sleep(self.tick_interval()).await;
    }
}
