//! DroneGrid CLI
//!
//! `dronegrid run` starts a full session; every other subcommand is one
//! component and is normally only invoked by `run`.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use dronegrid_core::{
    frame_reader, frame_writer, ChannelUi, Coordinator, CoordinatorConfig, CoordinatorLinks, CoreError,
    DetectorConfig, DetectorOutcome, FrameReader, FrameWriter, Renderer, TraceRenderer, UiEvent, UiSource,
};
use dronegrid_env::process::is_alive;
use dronegrid_env::{ChannelFd, FileRegistry, GridContext, ProcessGroupKill, Registry, Role, TokioContext};
use dronegrid_sim::generators::{run_generator, GeneratorConfig, ObstacleGenerator, TargetGenerator};
use dronegrid_sim::terminal::{current_window, TerminalRenderer, TerminalUi};
use dronegrid_sim::{
    init_logging, orchestrator, run_physics, run_supervisor, HeartbeatFds, LinkSpec, LogTarget, Participant,
    PhysicsConfig, RunConfig, OBSTACLE_RNG_STREAM, TARGET_RNG_STREAM,
};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// DroneGrid: a supervised multi-process drone simulation
#[derive(Parser, Debug)]
#[command(name = "dronegrid")]
#[command(about = "Run and supervise the DroneGrid drone simulation", long_about = None)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
struct CommonArgs {
    /// Process registry file
    #[arg(long, global = true, default_value = "pid_registry.txt")]
    registry: PathBuf,

    /// Directory for per-component log files
    #[arg(long, global = true, default_value = "logs")]
    log_dir: PathBuf,

    /// Log to stderr instead of a file
    #[arg(long, global = true)]
    log_stderr: bool,

    /// Master seed for placement randomness (0 = random)
    #[arg(short, long, global = true, default_value = "0")]
    seed: u64,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Data and heartbeat handles of a simple participant.
#[derive(Args, Debug, Clone)]
struct ParticipantArgs {
    /// Handle to read coordinator frames from
    #[arg(long)]
    rx: ChannelFd,

    /// Handle to write frames to the coordinator
    #[arg(long)]
    tx: ChannelFd,

    /// Handle supervisor pings arrive on
    #[arg(long)]
    heartbeat_rx: Option<ChannelFd>,

    /// Handle to answer pings on
    #[arg(long)]
    heartbeat_tx: Option<ChannelFd>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a full session: supervisor, coordinator and collaborators
    Run {
        /// No terminal UI; log everything to stderr, Ctrl-C quits
        #[arg(long)]
        headless: bool,

        /// Supervisor probe timeout in milliseconds
        #[arg(long)]
        probe_timeout_ms: Option<u64>,
    },

    /// Heartbeat failure detector
    Supervisor {
        /// Handle the coordinator's EXIT arrives on
        #[arg(long)]
        exit_rx: Option<ChannelFd>,

        /// Control link per monitored role, `role:rx:tx`
        #[arg(long = "control")]
        controls: Vec<LinkSpec>,

        /// Probe timeout in milliseconds
        #[arg(long, default_value = "200")]
        probe_timeout_ms: u64,

        /// Pause between passes in milliseconds
        #[arg(long, default_value = "2000")]
        cycle_delay_ms: u64,
    },

    /// Central coordinator; owns the terminal
    Coordinator {
        /// Link per dependent, `role:rx:tx` (`-` for a missing direction)
        #[arg(long = "link")]
        links: Vec<LinkSpec>,

        /// Handle to send EXIT to the supervisor on
        #[arg(long)]
        supervisor_tx: Option<ChannelFd>,

        #[arg(long)]
        heartbeat_rx: Option<ChannelFd>,

        #[arg(long)]
        heartbeat_tx: Option<ChannelFd>,

        /// Draw nothing; Ctrl-C quits
        #[arg(long)]
        headless: bool,

        /// Window width when headless
        #[arg(long, default_value = "80")]
        width: i32,

        /// Window height when headless
        #[arg(long, default_value = "24")]
        height: i32,

        /// Interval between obstacle relocations in milliseconds
        #[arg(long, default_value = "5000")]
        obstacle_period_ms: u64,
    },

    /// Drone dynamics
    Physics(ParticipantArgs),

    /// Obstacle generator
    Obstacles(ParticipantArgs),

    /// Target generator
    Targets(ParticipantArgs),

    /// Print the current registry
    Registry {
        /// JSON output
        #[arg(long)]
        json: bool,
    },
}

impl Command {
    fn component(&self) -> &'static str {
        match self {
            Command::Run { .. } => "orchestrator",
            Command::Supervisor { .. } => Role::Supervisor.name(),
            Command::Coordinator { .. } => Role::Coordinator.name(),
            Command::Physics(_) => Role::Physics.name(),
            Command::Obstacles(_) => Role::ObstacleGenerator.name(),
            Command::Targets(_) => Role::TargetGenerator.name(),
            Command::Registry { .. } => "registry",
        }
    }
}

fn block_on<F: Future<Output = Result<()>>>(future: F) -> Result<()> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building runtime")?
        .block_on(future)
}

fn main() {
    let cli = Cli::parse();

    let target = match &cli.command {
        Command::Registry { .. } | Command::Run { headless: true, .. } => LogTarget::Stderr,
        _ if cli.common.log_stderr => LogTarget::Stderr,
        _ => LogTarget::Directory(&cli.common.log_dir),
    };
    if let Err(e) = init_logging(cli.command.component(), target, cli.common.verbose) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }

    let component = cli.command.component();
    if let Err(e) = dispatch(cli) {
        error!(component, "{:#}", e);
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn dispatch(cli: Cli) -> Result<()> {
    let common = cli.common;
    match cli.command {
        Command::Run {
            headless,
            probe_timeout_ms,
        } => run_session(&common, headless, probe_timeout_ms.map(Duration::from_millis)),
        Command::Supervisor {
            exit_rx,
            controls,
            probe_timeout_ms,
            cycle_delay_ms,
        } => {
            let config = DetectorConfig {
                probe_timeout: Duration::from_millis(probe_timeout_ms),
                cycle_delay: Duration::from_millis(cycle_delay_ms),
                ..DetectorConfig::default()
            };
            block_on(supervisor_main(&common, exit_rx, controls, config))
        }
        Command::Coordinator {
            links,
            supervisor_tx,
            heartbeat_rx,
            heartbeat_tx,
            headless,
            width,
            height,
            obstacle_period_ms,
        } => {
            let heartbeat = HeartbeatFds::from_pair(heartbeat_rx, heartbeat_tx)?;
            let config = CoordinatorConfig {
                window: (width, height),
                obstacle_period: Duration::from_millis(obstacle_period_ms),
                ..CoordinatorConfig::default()
            };
            block_on(coordinator_main(&common, links, supervisor_tx, heartbeat, headless, config))
        }
        Command::Physics(args) => block_on(physics_main(&common, args)),
        Command::Obstacles(args) => block_on(generator_main(&common, Role::ObstacleGenerator, args)),
        Command::Targets(args) => block_on(generator_main(&common, Role::TargetGenerator, args)),
        Command::Registry { json } => print_registry(&common, json),
    }
}

// ============================================================================
// ORCHESTRATOR
// ============================================================================

fn run_session(common: &CommonArgs, headless: bool, probe_timeout: Option<Duration>) -> Result<()> {
    let seed = if common.seed == 0 {
        rand::random::<u64>() | 1
    } else {
        common.seed
    };
    let config = RunConfig {
        program: std::env::current_exe().context("locating the dronegrid binary")?,
        registry: common.registry.clone(),
        log_dir: common.log_dir.clone(),
        seed,
        verbose: common.verbose,
        headless,
        probe_timeout,
    };

    info!("DroneGrid v{}", env!("CARGO_PKG_VERSION"));
    info!(seed, logs = %config.log_dir.display(), "Starting session");

    let summary = orchestrator::run(&config)?;
    for child in &summary.children {
        if child.success {
            info!("✓ {} (pid {}) exited cleanly", child.role, child.pid);
        } else {
            error!("✗ {} (pid {}) exited with {:?}", child.role, child.pid, child.code);
        }
    }
    if !summary.all_succeeded() {
        anyhow::bail!("{} component(s) failed", summary.children.iter().filter(|c| !c.success).count());
    }
    Ok(())
}

// ============================================================================
// COMPONENTS
// ============================================================================

fn registry_for(common: &CommonArgs) -> Arc<dyn Registry> {
    Arc::new(FileRegistry::new(&common.registry))
}

async fn supervisor_main(
    common: &CommonArgs,
    exit_rx: Option<ChannelFd>,
    controls: Vec<LinkSpec>,
    config: DetectorConfig,
) -> Result<()> {
    let ctx = TokioContext::shared(common.seed);
    let outcome = run_supervisor(
        ctx,
        registry_for(common),
        Arc::new(ProcessGroupKill),
        &controls,
        exit_rx,
        config,
    )
    .await?;
    match outcome {
        DetectorOutcome::Shutdown { cycles } => {
            info!(cycles, "Supervisor stopped cleanly");
            Ok(())
        }
        DetectorOutcome::GroupKilled { role, identity, outcome, .. } => {
            anyhow::bail!("{} ({}) failed its heartbeat: {:?}", role, identity, outcome)
        }
    }
}

async fn coordinator_main(
    common: &CommonArgs,
    specs: Vec<LinkSpec>,
    supervisor_tx: Option<ChannelFd>,
    heartbeat: Option<HeartbeatFds>,
    headless: bool,
    mut config: CoordinatorConfig,
) -> Result<()> {
    let ctx = TokioContext::shared(common.seed);
    info!(seed = ctx.seed(), "Coordinator context ready");

    let mut links = CoordinatorLinks::new();
    for spec in &specs {
        let role = spec.role;
        links = match (spec.rx, spec.tx) {
            (Some(rx), Some(tx)) => links.dependent(
                role,
                frame_reader(rx.into_reader().with_context(|| format!("link rx for {}", role))?),
                frame_writer(tx.into_writer().with_context(|| format!("link tx for {}", role))?),
            ),
            (Some(rx), None) => links.inbound(role, frame_reader(rx.into_reader()?)),
            (None, Some(tx)) => links.outbound(role, frame_writer(tx.into_writer()?)),
            (None, None) => links,
        };
    }
    if let Some(fd) = supervisor_tx {
        links = links.supervisor(frame_writer(fd.into_writer().context("adopting supervisor channel")?));
    }

    if !headless {
        config.window = current_window()?;
    }

    // The terminal is only taken over once the coordinator has joined.
    let body_ctx = Arc::clone(&ctx);
    let summary = Participant::new(Role::Coordinator, registry_for(common), heartbeat)
        .run(ctx.as_ref(), async move {
            let (renderer, ui) = coordinator_ui(headless)?;
            let mut coordinator = Coordinator::new(body_ctx, config, links, renderer, ui);
            coordinator.run().await
        })
        .await?;
    info!(
        iterations = summary.iterations,
        frames = summary.frames_applied,
        targets_reached = summary.targets_reached,
        "Session finished"
    );
    Ok(())
}

fn coordinator_ui(headless: bool) -> Result<(Box<dyn Renderer>, Box<dyn UiSource>), CoreError> {
    if !headless {
        return Ok((Box::new(TerminalRenderer::stdout()?), Box::new(TerminalUi)));
    }
    let (events, ui) = ChannelUi::new();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received");
            let _ = events.send(UiEvent::Quit);
        }
    });
    Ok((Box::new(TraceRenderer::default()), Box::new(ui)))
}

fn participant_channels(args: &ParticipantArgs) -> Result<(FrameReader, FrameWriter)> {
    let rx = frame_reader(args.rx.into_reader().context("adopting coordinator rx")?);
    let tx = frame_writer(args.tx.into_writer().context("adopting coordinator tx")?);
    Ok((rx, tx))
}

async fn physics_main(common: &CommonArgs, args: ParticipantArgs) -> Result<()> {
    let ctx = TokioContext::new(common.seed);
    let heartbeat = HeartbeatFds::from_pair(args.heartbeat_rx, args.heartbeat_tx)?;
    let (rx, tx) = participant_channels(&args)?;
    let steps = Participant::new(Role::Physics, registry_for(common), heartbeat)
        .run(&ctx, run_physics(PhysicsConfig::default(), rx, tx))
        .await?;
    info!(steps, "Physics finished");
    Ok(())
}

async fn generator_main(common: &CommonArgs, role: Role, args: ParticipantArgs) -> Result<()> {
    let ctx = TokioContext::new(common.seed);
    let heartbeat = HeartbeatFds::from_pair(args.heartbeat_rx, args.heartbeat_tx)?;
    let (rx, tx) = participant_channels(&args)?;
    let config = GeneratorConfig::default();
    let participant = Participant::new(role, registry_for(common), heartbeat);

    if role == Role::ObstacleGenerator {
        let mut generator = ObstacleGenerator::new(&config, ctx.derive_rng(OBSTACLE_RNG_STREAM));
        participant
            .run(&ctx, run_generator(move |m| generator.handle(m), rx, tx))
            .await
    } else {
        let mut generator = TargetGenerator::new(&config, ctx.derive_rng(TARGET_RNG_STREAM));
        participant
            .run(&ctx, run_generator(move |m| generator.handle(m), rx, tx))
            .await
    }
}

// ============================================================================
// INSPECTION
// ============================================================================

fn print_registry(common: &CommonArgs, json: bool) -> Result<()> {
    let registry = FileRegistry::new(&common.registry);
    let entries = registry
        .refresh()
        .with_context(|| format!("reading {}", common.registry.display()))?;

    if json {
        let summary = serde_json::json!({
            "registry": common.registry.display().to_string(),
            "entries": entries.iter().map(|entry| {
                serde_json::json!({
                    "role": entry.role.name(),
                    "tag": entry.role.tag(),
                    "pid": entry.pid.as_raw(),
                    "alive": is_alive(entry.pid),
                })
            }).collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    if entries.is_empty() {
        warn!("Registry {} is empty", common.registry.display());
    }
    for entry in &entries {
        let state = if is_alive(entry.pid) { "alive" } else { "gone" };
        println!("{:<12} {:>8}  {}", entry.role.name(), entry.pid, state);
    }
    Ok(())
}
