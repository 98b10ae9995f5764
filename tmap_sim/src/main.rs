//! T-MAP tracking server CLI
//!
//! Runs the tracking engine against a UDP display client, or against the
//! in-memory simulated link with `--simulated`.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tmap_core::EngineConfig;
use tmap_sim::{runner, FlightConfig, RunConfig};
use tracing::{error, info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// T-MAP tracking server
#[derive(Parser, Debug)]
#[command(name = "tmap-server")]
#[command(about = "Track targets, broadcast snapshots, persist the session", long_about = None)]
struct Args {
    /// Master seed for determinism (0 = random from time)
    #[arg(short, long, default_value = "42")]
    seed: u64,

    /// Address to receive intercept commands on
    #[arg(short, long, default_value = "0.0.0.0:8080")]
    bind: SocketAddr,

    /// Display client address snapshots are sent to
    #[arg(short, long, default_value = "127.0.0.1:9090")]
    client: SocketAddr,

    /// Data file loaded at startup and saved at shutdown
    #[arg(short, long, default_value = "tmap_data.dat")]
    data_file: PathBuf,

    /// Tick period in milliseconds
    #[arg(long, default_value = "100")]
    tick_ms: u64,

    /// Stop after this many ticks (0 = run until EXIT)
    #[arg(short, long, default_value = "0")]
    ticks: u64,

    /// Targets to deploy at startup
    #[arg(long, default_value = "0")]
    spawn: usize,

    /// Simulated packet loss rate (0.0 - 1.0)
    #[arg(long, default_value = "0.0")]
    loss: f64,

    /// Use the in-memory network and virtual clock
    #[arg(long)]
    simulated: bool,

    /// Export broadcast frames to a JSON file
    #[arg(long)]
    export: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// JSON summary on stdout
    #[arg(long)]
    json: bool,
}

impl Args {
    fn into_config(self) -> RunConfig {
        let seed = if self.seed == 0 {
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(1)
        } else {
            self.seed
        };
        RunConfig {
            seed,
            bind: self.bind,
            client: self.client,
            data_file: self.data_file,
            ticks: self.ticks,
            spawn: self.spawn,
            loss: self.loss,
            simulated: self.simulated,
            export: self.export,
            engine: EngineConfig {
                tick_period: Duration::from_millis(self.tick_ms.max(1)),
                ..EngineConfig::default()
            },
            flight: FlightConfig::default(),
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");

    let json = args.json;
    let config = args.into_config();

    if !json {
        info!("T-MAP Command Center Core Engine v0.1.0");
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        info!(
            seed = config.seed,
            simulated = config.simulated,
            data_file = %config.data_file.display(),
            "Commands: ADD <id> <threat> | KILL <id> | REVIVE <id> <threat> | FIND <id> | SCAN <n> | TREE | COMPACT | EXIT"
        );
    }

    let summary = match runner::run(&config).await {
        Ok(summary) => summary,
        Err(e) => {
            error!("✗ Server failed: {e}");
            std::process::exit(1);
        }
    };

    if json {
        match serde_json::to_string_pretty(&summary) {
            Ok(text) => println!("{text}"),
            Err(e) => error!("Failed to encode summary: {e}"),
        }
    } else {
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        info!(
            ticks = summary.ticks,
            intercepted = summary.intercepted,
            saved = summary.records_saved,
            "✅ Engine offline. Goodbye."
        );
    }
}
