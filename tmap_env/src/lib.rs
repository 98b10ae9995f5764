//! T-MAP Environment Abstraction Layer
//!
//! This crate provides the "Sans-IO" seam that lets the tracking engine's tick
//! loop run both against **Production** I/O (tokio clock, UDP sockets) and a
//! **Simulation** (virtual clock, in-memory lossy network).
//!
//! # Core Concept: Poll, then Process
//!
//! The engine is single-threaded and never blocks on the network:
//! - Time (`now()`, `sleep()`) paces the ticks
//! - Network (`try_recv()`) is drained before each tick, `send()` is fire-and-forget
//!
//! # Example
//!
//! ```ignore
//! use tmap_env::{DatagramTransport, TmapContext};
//!
//! async fn server_loop<Ctx: TmapContext, Net: DatagramTransport>(ctx: &Ctx, net: &Net) {
//!     loop {
//!         while let Some(datagram) = net.try_recv() {
//!             handle_command(datagram);
//!         }
//!         tick();
//!         ctx.sleep(Duration::from_millis(100)).await;
//!     }
//! }
//! ```

mod context;
mod network;
mod types;
mod error;
mod tokio_impl;
mod udp;

pub use context::TmapContext;
pub use network::{DatagramTransport, NetworkController};
pub use types::Datagram;
pub use error::EnvError;
pub use tokio_impl::TokioContext;
pub use udp::UdpTransport;
