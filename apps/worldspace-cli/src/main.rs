use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use glam::Vec3;
use tracing_subscriber::EnvFilter;
use worldspace_common::{Bounds, CellId, Transform};
use worldspace_kernel::{CellSpec, SharedWorld, World};
use worldspace_stream::{
    AllowAll, DriverMode, MemoryTransport, RevalidationDriver, SchedulerKind, StreamSettings,
    ViewerCache, ViewerIdentity,
};
use worldspace_tools::{RevalidationMonitor, WorldInspector};

#[derive(Parser)]
#[command(name = "worldspace-cli", about = "CLI tool for worldspace streaming")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Stream settings file (JSON); defaults apply when omitted
    #[arg(short, long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print version and the default partition layout
    Info,
    /// Print the effective stream settings as JSON
    Config,
    /// Build a demo world and print its tree and partition occupancy
    Inspect {
        /// Number of cells to spawn
        #[arg(short, long, default_value = "20")]
        cells: usize,
    },
    /// Drive viewers through a moving world and report what was streamed
    Simulate {
        /// Number of viewers to log in
        #[arg(long, default_value = "4")]
        viewers: usize,
        /// Number of cells to spawn
        #[arg(long, default_value = "500")]
        cells: usize,
        /// Number of world steps to run
        #[arg(long, default_value = "20")]
        cycles: usize,
        /// Override the configured delivery scheduler
        #[arg(long)]
        scheduler: Option<SchedulerArg>,
        /// Override the configured driver mode
        #[arg(long)]
        mode: Option<ModeArg>,
        /// Run the periodic driver on a runtime instead of stepping cycles
        /// by hand
        #[arg(long)]
        live: bool,
        /// Override the driver interval in live mode
        #[arg(long)]
        interval_ms: Option<u64>,
        /// Log a timing report every N cycles (0 disables)
        #[arg(long, default_value = "0")]
        report_every: u64,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum SchedulerArg {
    Immediate,
    Aggregated,
    Chunked,
}

impl From<SchedulerArg> for SchedulerKind {
    fn from(arg: SchedulerArg) -> Self {
        match arg {
            SchedulerArg::Immediate => SchedulerKind::Immediate,
            SchedulerArg::Aggregated => SchedulerKind::Aggregated,
            SchedulerArg::Chunked => SchedulerKind::chunked(),
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    PerViewer,
    Shared,
}

impl From<ModeArg> for DriverMode {
    fn from(arg: ModeArg) -> Self {
        match arg {
            ModeArg::PerViewer => DriverMode::PerViewer,
            ModeArg::Shared => DriverMode::Shared,
        }
    }
}

struct SimulateArgs {
    viewers: usize,
    cells: usize,
    cycles: usize,
    live: bool,
    report_every: u64,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    let mut settings = match &cli.settings {
        Some(path) => StreamSettings::from_json_file(path)
            .with_context(|| format!("loading settings from {}", path.display()))?,
        None => StreamSettings::default(),
    };

    match cli.command {
        Commands::Info => {
            println!("worldspace-cli v{}", env!("CARGO_PKG_VERSION"));
            let world = World::with_space_config(settings.space.clone());
            println!(
                "space: size={} max_spaces_per_cell={}",
                settings.space.space_size, settings.space.max_spaces_per_cell
            );
            println!("{}", WorldInspector::summary(&world));
        }
        Commands::Config => {
            println!("{}", settings.to_json_pretty()?);
        }
        Commands::Inspect { cells } => {
            let mut world = World::with_space_config(settings.space.clone());
            populate(&mut world, cells)?;
            println!("{}", WorldInspector::summary(&world));
            for space in WorldInspector::spaces(&world).iter().take(5) {
                println!("  {space}");
            }
            print!("{}", WorldInspector::tree(&world));
        }
        Commands::Simulate {
            viewers,
            cells,
            cycles,
            scheduler,
            mode,
            live,
            interval_ms,
            report_every,
        } => {
            if let Some(scheduler) = scheduler {
                settings.cache.scheduler = scheduler.into();
            }
            if let Some(mode) = mode {
                settings.driver.mode = mode.into();
            }
            if let Some(interval_ms) = interval_ms {
                settings.driver.interval_ms = interval_ms;
                settings.driver.initial_delay_ms = 0;
            }
            settings.validate()?;
            let args = SimulateArgs {
                viewers,
                cells,
                cycles,
                live,
                report_every,
            };
            simulate(&settings, &args)?;
        }
    }

    Ok(())
}

fn box_spec(position: Vec3) -> CellSpec {
    CellSpec::new("box")
        .movable(true)
        .with_transform(Transform::from_position(position))
        .with_bounds(Bounds::cube(Vec3::ZERO, 1.0))
}

/// Lay `count` boxes out on a square grid centred on the origin.
fn populate(world: &mut World, count: usize) -> anyhow::Result<Vec<CellId>> {
    let side = (count as f32).sqrt().ceil().max(1.0) as usize;
    let offset = side as f32 * 2.0;
    let mut ids = Vec::with_capacity(count);
    for i in 0..count {
        let x = (i % side) as f32 * 4.0 - offset;
        let z = (i / side) as f32 * 4.0 - offset;
        ids.push(world.spawn(box_spec(Vec3::new(x, 0.0, z)))?);
    }
    Ok(ids)
}

/// Advance the demo world: viewers walk circles, a tenth of the boxes drift.
fn step_world(world: &mut World, cells: &[CellId], avatars: &[CellId], step: usize) {
    for (i, avatar) in avatars.iter().enumerate() {
        let angle = step as f32 * 0.3 + i as f32;
        let position = Vec3::new(angle.cos(), 0.0, angle.sin()) * 40.0;
        if let Err(e) = world.set_local_transform(*avatar, Transform::from_position(position)) {
            tracing::warn!(%avatar, %e, "failed to move avatar");
        }
    }
    for id in cells.iter().skip(step % 10).step_by(10) {
        let Some(position) = world.get(*id).and_then(|c| c.local_transform()).map(|t| t.position)
        else {
            continue;
        };
        let drift = Vec3::new((step as f32).sin(), 0.0, (step as f32).cos());
        if let Err(e) = world.set_local_transform(*id, Transform::from_position(position + drift)) {
            tracing::warn!(cell = %id, %e, "failed to move cell");
        }
    }
    let events = world.drain_events();
    tracing::debug!(step, events = events.len(), "world stepped");
}

fn simulate(settings: &StreamSettings, args: &SimulateArgs) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Runtime::new().context("starting runtime")?;
    // Chunked schedulers pick up the ambient runtime handle.
    let _guard = runtime.enter();

    let world = SharedWorld::new(World::with_space_config(settings.space.clone()));
    let cells = world.update(|w| populate(w, args.cells))?;
    let transport = Arc::new(MemoryTransport::new());
    let monitor = Arc::new(RevalidationMonitor::new(256, args.report_every));
    let driver = RevalidationDriver::new(world.clone(), settings.driver.clone())
        .with_observer(monitor.clone());

    let mut avatars = Vec::with_capacity(args.viewers);
    for i in 0..args.viewers {
        let avatar = world.update(|w| {
            w.spawn(
                CellSpec::new("avatar")
                    .movable(true)
                    .named(format!("viewer-{i}"))
                    .with_transform(Transform::default())
                    .with_bounds(Bounds::sphere(Vec3::ZERO, 0.5)),
            )
        })?;
        let identity = ViewerIdentity::new(format!("viewer-{i}"));
        let scheduler = settings.cache.scheduler.build(identity.id, transport.clone())?;
        let cache = ViewerCache::new(
            identity,
            avatar,
            settings.cache.clone(),
            Arc::new(AllowAll),
            scheduler,
        );
        driver.login(cache);
        avatars.push(avatar);
    }
    println!(
        "Simulating {} viewers over {} cells for {} steps ({:?}, {:?})",
        args.viewers, args.cells, args.cycles, settings.cache.scheduler, settings.driver.mode
    );

    let start = Instant::now();
    if args.live {
        driver.start(runtime.handle());
        let interval = settings.driver.interval();
        runtime.block_on(async {
            for step in 0..args.cycles {
                tokio::time::sleep(interval).await;
                world.update(|w| step_world(w, &cells, &avatars, step));
            }
            tokio::time::sleep(interval).await;
        });
        driver.shutdown();
    } else {
        for step in 0..args.cycles {
            world.update(|w| step_world(w, &cells, &avatars, step));
            for (viewer, result) in driver.revalidate_all() {
                if let Err(e) = result {
                    tracing::warn!(%viewer, %e, "cycle failed");
                }
            }
        }
    }
    let elapsed = start.elapsed();

    println!("Finished in {elapsed:?}");
    println!("{}", world.with(WorldInspector::summary));
    print!("{}", monitor.report());
    for viewer in driver.viewers() {
        let cached = driver.cached_cells(viewer).map_or(0, |c| c.len());
        println!(
            "  viewer {viewer}: cached={cached} batches={} ops={}",
            transport.batch_count(viewer),
            transport.ops(viewer).len()
        );
    }
    Ok(())
}
