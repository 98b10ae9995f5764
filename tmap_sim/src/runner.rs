//! Server runner - the top-level session loop.
//!
//! One run: load the data file, spawn any requested targets, then loop
//! operator lines → tick → pace until EXIT or the tick limit, and finally
//! save, export and tear the index down.

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use thiserror::Error;
use tmap_core::{EngineConfig, EngineError, Position, TickReport, TmapServer, TrackEngine};
use tmap_env::{DatagramTransport, EnvError, NetworkController, TmapContext, TokioContext, UdpTransport};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver};
use tracing::{debug, info, warn};

use crate::console::{self, Outcome};
use crate::context::{derive_rng, SimContext};
use crate::exporter::{CellFrame, SnapshotExport, SnapshotFrame};
use crate::flight::{FlightConfig, FlightModel};
use crate::network::{sim_link, SimClient};

/// RNG stream for initial target threat levels.
const SPAWN_STREAM: u64 = 1;
/// RNG stream for flight jitter.
const FLIGHT_STREAM: u64 = 2;
/// RNG stream for simulated packet loss.
const LOSS_STREAM: u64 = 3;

/// Client polls after which an unrefreshed track is dropped from its picture.
const CLIENT_STALE_POLLS: u64 = 10;

/// Errors that end a run.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Env(#[from] EnvError),

    #[error("export failed: {0}")]
    Export(#[from] io::Error),
}

/// Everything a run needs.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Master seed for flight jitter, spawn threat levels and simulated loss
    pub seed: u64,

    /// Local address the server receives commands on
    pub bind: SocketAddr,

    /// Client address snapshots are sent to
    pub client: SocketAddr,

    pub data_file: PathBuf,

    /// Stop after this many ticks (0 = run until EXIT)
    pub ticks: u64,

    /// Targets to deploy at startup
    pub spawn: usize,

    /// Packet loss rate for the in-memory network
    pub loss: f64,

    /// Use the in-memory network and virtual clock instead of UDP
    pub simulated: bool,

    /// Write a JSON frame log here on shutdown
    pub export: Option<PathBuf>,

    pub engine: EngineConfig,
    pub flight: FlightConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
            client: SocketAddr::from(([127, 0, 0, 1], 9090)),
            data_file: PathBuf::from("tmap_data.dat"),
            ticks: 0,
            spawn: 0,
            loss: 0.0,
            simulated: false,
            export: None,
            engine: EngineConfig::default(),
            flight: FlightConfig::default(),
        }
    }
}

/// Results from a run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub seed: u64,
    pub records_loaded: usize,
    pub load_truncated: bool,
    pub ticks: u64,
    pub commands: usize,
    pub intercepted: usize,
    pub malformed: usize,
    pub packets_sent: usize,
    pub send_failures: usize,
    pub records_saved: usize,
    /// Targets the simulated client still displays at shutdown
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_tracks: Option<usize>,
}

impl RunSummary {
    fn absorb(&mut self, report: &TickReport) {
        self.ticks = report.tick;
        self.commands += report.commands;
        self.intercepted += report.intercepted;
        self.malformed += report.malformed;
        self.packets_sent += report.packets_sent;
        self.send_failures += report.send_failures;
    }
}

/// Deploys `count` targets at `launch` with ids after the highest existing one.
///
/// Stops early once the id space above the highest target is used up.
pub fn spawn_targets(
    engine: &mut TrackEngine,
    count: usize,
    launch: Position,
    rng: &mut ChaCha8Rng,
) -> Result<Vec<i32>, EngineError> {
    let first = match engine.index().iter().last() {
        Some(highest) => highest.id().checked_add(1),
        None => Some(1),
    };
    let mut spawned = Vec::with_capacity(count);
    if let Some(first) = first {
        for id in (first..=i32::MAX).take(count) {
            engine.add_target(id, rng.gen_range(1..=10), launch)?;
            spawned.push(id);
        }
    }
    if spawned.len() < count {
        warn!(
            requested = count,
            spawned = spawned.len(),
            "SPAWN      | no free ids above the highest target"
        );
    }
    Ok(spawned)
}

/// One server session over any context and transport.
pub struct Session<Ctx, Net>
where
    Ctx: TmapContext,
    Net: DatagramTransport,
{
    server: TmapServer<Ctx, Net>,
    model: FlightModel,
    launch: Position,
    export: Option<SnapshotExport>,
    /// Operator replies since the last exported frame
    events: Vec<String>,
    summary: RunSummary,
}

impl<Ctx, Net> Session<Ctx, Net>
where
    Ctx: TmapContext,
    Net: DatagramTransport,
{
    pub fn new(server: TmapServer<Ctx, Net>, model: FlightModel, record_export: bool) -> Self {
        let launch = model.config().base();
        let export = record_export
            .then(|| SnapshotExport::new(&server.engine().config().name, server.context.seed()));
        Self {
            server,
            model,
            launch,
            export,
            events: Vec::new(),
            summary: RunSummary::default(),
        }
    }

    pub fn server(&self) -> &TmapServer<Ctx, Net> {
        &self.server
    }

    pub fn server_mut(&mut self) -> &mut TmapServer<Ctx, Net> {
        &mut self.server
    }

    pub fn summary(&self) -> &RunSummary {
        &self.summary
    }

    /// Runs one operator line. Returns `true` when the operator asked to exit.
    pub fn handle_line(&mut self, line: &str) -> bool {
        if line.trim().is_empty() {
            return false;
        }
        match console::run_line(self.server.engine_mut(), line, self.launch) {
            Ok(Outcome::Exit) => true,
            Ok(Outcome::Reply(lines)) => {
                for reply in lines {
                    info!("T-MAP> {reply}");
                    self.events.push(reply);
                }
                false
            }
            Err(e) => {
                warn!(line = line.trim(), "T-MAP> {e}");
                false
            }
        }
    }

    /// Runs one tick and records it.
    pub fn step(&mut self) -> TickReport {
        let mut cells = Vec::new();
        let recording = self.export.is_some();
        let report = self.server.tick_with(&mut self.model, |spatial| {
            if recording {
                cells = CellFrame::collect(spatial);
            }
        });
        self.summary.absorb(&report);

        if report.intercepted > 0 {
            info!(count = report.intercepted, "C2 LINK    | targets destroyed by client command");
        }
        if let Some(export) = self.export.as_mut() {
            export.add_frame(SnapshotFrame {
                tick: report.tick,
                time_sec: self.server.context.now().as_secs_f64(),
                targets: self.server.last_snapshot().to_vec(),
                cells,
                events: std::mem::take(&mut self.events),
            });
        } else {
            self.events.clear();
        }
        report
    }

    pub async fn pace(&self) {
        self.server.pace().await;
    }

    /// Saves the index, writes the export and releases everything.
    pub fn finish(
        mut self,
        data_file: &Path,
        export_path: Option<&Path>,
    ) -> Result<RunSummary, RunError> {
        let engine = self.server.into_engine();
        info!(path = %data_file.display(), "SAVE       | saving session");
        self.summary.records_saved = engine.save(data_file)?;

        if let (Some(mut export), Some(path)) = (self.export.take(), export_path) {
            export.finalize(engine.index().len());
            export.write_to_file(path)?;
            info!(frames = export.frames.len(), path = %path.display(), "EXPORT     | frames written");
        }

        info!("TEARDOWN   | emptying index (post-order)");
        let stats = engine.into_index().teardown();
        info!(
            nodes = stats.nodes,
            records = stats.records,
            samples = stats.samples,
            "TEARDOWN   | engine offline"
        );
        Ok(self.summary)
    }
}

/// Reads operator lines from stdin on a helper task.
///
/// The channel closes when stdin does.
pub fn spawn_stdin_reader() -> UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "CONSOLE    | stdin read failed");
                    break;
                }
            }
        }
    });
    rx
}

/// Runs the session loop until EXIT, the tick limit, or (with no tick limit)
/// the operator input closing.
pub async fn drive<Ctx, Net>(
    mut session: Session<Ctx, Net>,
    mut lines: UnboundedReceiver<String>,
    mut client: Option<SimClient>,
    config: &RunConfig,
) -> Result<RunSummary, RunError>
where
    Ctx: TmapContext,
    Net: DatagramTransport,
{
    session.summary.seed = config.seed;
    'run: loop {
        loop {
            match lines.try_recv() {
                Ok(line) => {
                    if session.handle_line(&line) {
                        break 'run;
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    if config.ticks == 0 {
                        info!("CONSOLE    | input closed, shutting down");
                        break 'run;
                    }
                    break;
                }
            }
        }

        let report = session.step();
        if let Some(client) = client.as_mut() {
            let received = client.poll().len();
            client.prune_stale(CLIENT_STALE_POLLS);
            debug!(received, visible = client.visible_ids().len(), "CLIENT     | picture updated");
        }
        if config.ticks != 0 && report.tick >= config.ticks {
            break;
        }
        session.pace().await;
        tokio::task::yield_now().await;
    }

    let client_tracks = client.as_ref().map(|c| c.visible_ids().len());
    let mut summary = session.finish(&config.data_file, config.export.as_deref())?;
    summary.client_tracks = client_tracks;
    Ok(summary)
}

/// Loads the engine and deploys the startup targets.
fn prepare_engine(config: &RunConfig) -> Result<(TrackEngine, RunSummary), RunError> {
    let (mut engine, loaded) = TrackEngine::load(config.engine.clone(), &config.data_file)?;
    let spawned = spawn_targets(
        &mut engine,
        config.spawn,
        config.flight.base(),
        &mut derive_rng(config.seed, SPAWN_STREAM),
    )?;
    if !spawned.is_empty() {
        info!(count = spawned.len(), "SPAWN      | startup targets deployed");
    }
    let summary = RunSummary {
        records_loaded: loaded.records,
        load_truncated: loaded.truncated,
        ..RunSummary::default()
    };
    Ok((engine, summary))
}

fn new_session<Ctx, Net>(
    ctx: Arc<Ctx>,
    net: Arc<Net>,
    engine: TrackEngine,
    loaded: RunSummary,
    config: &RunConfig,
) -> Session<Ctx, Net>
where
    Ctx: TmapContext,
    Net: DatagramTransport,
{
    let model = FlightModel::new(config.flight.clone(), derive_rng(config.seed, FLIGHT_STREAM));
    let mut session = Session::new(TmapServer::new(ctx, net, engine), model, config.export.is_some());
    session.summary = loaded;
    session
}

/// Runs a full session on the in-memory network and virtual clock.
pub async fn run_simulated(
    config: &RunConfig,
    lines: UnboundedReceiver<String>,
) -> Result<RunSummary, RunError> {
    let (engine, loaded) = prepare_engine(config)?;
    let ctx = SimContext::shared(config.seed);
    let (net, client, controller) = sim_link(ctx.derive_rng(LOSS_STREAM));
    controller.set_loss(config.loss);

    let session = new_session(ctx, Arc::new(net), engine, loaded, config);
    let summary = drive(session, lines, Some(client), config).await?;
    let stats = controller.stats();
    info!(delivered = stats.delivered, dropped = stats.dropped, "NETWORK    | link statistics");
    Ok(summary)
}

/// Runs a full session on UDP and the tokio clock.
pub async fn run_udp(
    config: &RunConfig,
    lines: UnboundedReceiver<String>,
) -> Result<RunSummary, RunError> {
    let (engine, loaded) = prepare_engine(config)?;
    let net = Arc::new(UdpTransport::bind(config.bind, config.client)?);
    let session = new_session(TokioContext::shared(), net, engine, loaded, config);
    drive(session, lines, None, config).await
}

/// Runs with operator input from stdin.
pub async fn run(config: &RunConfig) -> Result<RunSummary, RunError> {
    let lines = spawn_stdin_reader();
    if config.simulated {
        run_simulated(config, lines).await
    } else {
        run_udp(config, lines).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use tmap_core::tmap_persist;

    fn config(dir: &Path) -> RunConfig {
        RunConfig {
            data_file: dir.join("tmap_data.dat"),
            simulated: true,
            ..RunConfig::default()
        }
    }

    fn feed(lines: &[&str]) -> UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        for line in lines {
            tx.send(line.to_string()).unwrap();
        }
        rx
    }

    #[test]
    fn test_spawn_targets_after_highest_id() {
        let mut engine = TrackEngine::new(EngineConfig::default());
        let launch = Position::new(37.5, 127.0);
        engine.add_target(40, 5, launch).unwrap();

        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let ids = spawn_targets(&mut engine, 3, launch, &mut rng).unwrap();
        assert_eq!(ids, vec![41, 42, 43]);
        for id in ids {
            let threat = engine.find(id).unwrap().threat_level();
            assert!((1..=10).contains(&threat));
        }
    }

    #[test]
    fn test_spawn_targets_stops_at_top_of_id_space() {
        let launch = Position::new(37.5, 127.0);
        let mut rng = ChaCha8Rng::seed_from_u64(1);

        let mut engine = TrackEngine::new(EngineConfig::default());
        engine.add_target(i32::MAX - 1, 5, launch).unwrap();
        let ids = spawn_targets(&mut engine, 3, launch, &mut rng).unwrap();
        assert_eq!(ids, vec![i32::MAX]);
        assert!(engine.find(i32::MAX).is_some());

        let ids = spawn_targets(&mut engine, 2, launch, &mut rng).unwrap();
        assert!(ids.is_empty());
        assert_eq!(engine.index().len(), 2);
    }

    #[tokio::test]
    async fn test_simulated_run_saves_on_tick_limit() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = RunConfig {
            ticks: 20,
            spawn: 5,
            ..config(dir.path())
        };
        let (_tx, rx) = mpsc::unbounded_channel::<String>();

        let summary = run_simulated(&cfg, rx).await.unwrap();
        assert_eq!(summary.ticks, 20);
        assert_eq!(summary.records_saved, 5);
        assert_eq!(summary.packets_sent, 5 * 20);
        assert_eq!(summary.client_tracks, Some(5));

        let (index, _) = tmap_persist::load_from_path(&cfg.data_file).unwrap();
        assert_eq!(index.len(), 5);
        for record in &index {
            assert_eq!(record.sample_count(), 21);
        }
    }

    #[tokio::test]
    async fn test_console_exit_stops_run_and_restart_restores() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());

        let rx = feed(&["ADD 7 9", "ADD 3 2", "KILL 3", "EXIT"]);
        let summary = run_simulated(&cfg, rx).await.unwrap();
        assert_eq!(summary.ticks, 0);
        assert_eq!(summary.records_saved, 2);

        let rx = feed(&["EXIT"]);
        let summary = run_simulated(&cfg, rx).await.unwrap();
        assert_eq!(summary.records_loaded, 2);

        let (index, _) = tmap_persist::load_from_path(&cfg.data_file).unwrap();
        assert!(index.search(7).unwrap().is_active());
        assert!(!index.search(3).unwrap().is_active());
    }

    #[tokio::test]
    async fn test_input_closed_ends_unbounded_run() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let rx = feed(&["ADD 1 5"]);

        let summary = run_simulated(&cfg, rx).await.unwrap();
        assert_eq!(summary.records_saved, 1);
    }

    #[tokio::test]
    async fn test_lossy_link_converges_after_clean_ticks() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = RunConfig {
            spawn: 8,
            loss: 0.4,
            ..config(dir.path())
        };
        let (engine, loaded) = prepare_engine(&cfg).unwrap();
        let ctx = SimContext::shared(cfg.seed);
        let (net, mut client, controller) = sim_link(ctx.derive_rng(LOSS_STREAM));
        controller.set_loss(cfg.loss);
        let mut session = new_session(ctx, Arc::new(net), engine, loaded, &cfg);

        for _ in 0..10 {
            session.step();
            client.poll();
        }
        assert!(controller.stats().dropped > 0);

        controller.set_loss(0.0);
        session.step();
        client.poll();
        assert_eq!(client.visible_ids(), (1..=8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_client_intercept_reaches_engine() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = RunConfig {
            spawn: 3,
            ..config(dir.path())
        };
        let (engine, loaded) = prepare_engine(&cfg).unwrap();
        let ctx = SimContext::shared(cfg.seed);
        let (net, mut client, _controller) = sim_link(ctx.derive_rng(LOSS_STREAM));
        let mut session = new_session(ctx, Arc::new(net), engine, loaded, &cfg);

        session.step();
        client.poll();
        assert!(client.send_intercept(2));

        let report = session.step();
        assert_eq!(report.intercepted, 1);
        client.poll();
        assert_eq!(client.visible_ids(), vec![1, 3]);
    }

    #[tokio::test]
    async fn test_malformed_command_is_counted_and_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = RunConfig {
            spawn: 2,
            ..config(dir.path())
        };
        let (engine, loaded) = prepare_engine(&cfg).unwrap();
        let ctx = SimContext::shared(cfg.seed);
        let (net, mut client, _controller) = sim_link(ctx.derive_rng(LOSS_STREAM));
        let mut session = new_session(ctx, Arc::new(net), engine, loaded, &cfg);

        client.send_raw(&[1, 0, 0]);
        client.send_raw(&2i32.to_le_bytes());
        let report = session.step();
        assert_eq!(report.malformed, 1);
        assert_eq!(report.commands, 1);
        assert_eq!(report.intercepted, 1);
        assert_eq!(session.summary().malformed, 1);

        client.poll();
        assert_eq!(client.visible_ids(), vec![1]);
        assert!(client.track(2).is_none());
    }

    #[tokio::test]
    async fn test_export_written_with_events() {
        let dir = tempfile::tempdir().unwrap();
        let export_path = dir.path().join("run.json");
        let cfg = RunConfig {
            ticks: 3,
            export: Some(export_path.clone()),
            ..config(dir.path())
        };

        let rx = feed(&["ADD 5 5"]);
        run_simulated(&cfg, rx).await.unwrap();

        let text = std::fs::read_to_string(&export_path).unwrap();
        let export: SnapshotExport = serde_json::from_str(&text).unwrap();
        assert_eq!(export.frames.len(), 3);
        assert_eq!(export.frames[0].events, vec!["Target #0005 deployed (threat 5)"]);
        assert_eq!(export.frames[2].targets.len(), 1);
        assert_eq!(export.final_records, Some(1));
    }
}
