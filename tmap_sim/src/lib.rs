//! T-MAP Server Harness
//!
//! This crate wires the tracking engine into a runnable server and a
//! deterministic simulation of its surroundings.
//!
//! # Core Principle: Same Loop, Swappable World
//!
//! The tick loop in `tmap_core` is generic over time and transport, so:
//! - **Production**: tokio clock, UDP socket to a display client
//! - **Simulation**: virtual clock, in-memory link with seeded packet loss
//!   and a simulated client that keeps its own picture of the targets
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Session                             │
//! │  ┌──────────────┐    ┌───────────────┐    ┌─────────────┐   │
//! │  │   console    │───►│  TmapServer   │◄───│ FlightModel │   │
//! │  │ (stdin lines)│    │  (one tick)   │    │  (motion)   │   │
//! │  └──────────────┘    └───────┬───────┘    └─────────────┘   │
//! │                              │ 28-byte packets              │
//! │                      ┌───────▼───────┐    ┌─────────────┐   │
//! │                      │ UdpTransport  │    │  exporter   │   │
//! │                      │ or SimNetwork │    │   (JSON)    │   │
//! │                      └───────────────┘    └─────────────┘   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use tmap_sim::{RunConfig, runner};
//!
//! let config = RunConfig {
//!     simulated: true,
//!     spawn: 12,
//!     ticks: 300,
//!     ..Default::default()
//! };
//! let summary = runner::run(&config).await?;
//! ```

mod context;
mod network;
mod flight;
pub mod console;
pub mod exporter;
pub mod runner;

pub use context::{derive_rng, SimContext};
pub use network::{sim_link, LinkStats, SimClient, SimNetwork, SimNetworkController, TrackView};
pub use flight::{FlightConfig, FlightModel};
pub use console::{Command, ConsoleError, Outcome};
pub use exporter::{CellFrame, SnapshotExport, SnapshotFrame};
pub use runner::{RunConfig, RunError, RunSummary, Session};
