//! `run` command: headless streaming simulation.
//!
//! Builds a view over synthetic terrain and imagery sources, flies a
//! scripted descending orbit across the dataset, and lets the engine
//! stream tiles for the moving camera. When the flight ends and the
//! scheduler drains, a telemetry report is printed.
//!
//! The camera animator is an ordinary frame requester, exactly how an
//! interactive controls module would drive the engine.

use std::cell::Cell;
use std::f64::consts::TAU;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use glam::DVec3;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use tilescape::prelude::*;

use crate::config::ConfigFile;

/// Side length of the simulated dataset in meters.
const WORLD_SIZE: f64 = 262_144.0;

/// Flight start and end heights in meters.
const START_HEIGHT: f64 = 80_000.0;
const END_HEIGHT: f64 = 1_500.0;

/// Orbit radius at the start of the flight.
const ORBIT_RADIUS: f64 = 40_000.0;

const SIM_CRS: &str = "EPSG:3857";

#[derive(Args)]
pub struct RunArgs {
    /// Number of camera-flight frames (overrides the config file).
    #[arg(long)]
    pub cycles: Option<u64>,

    /// Emit the telemetry report as JSON instead of a table.
    #[arg(long)]
    pub json: bool,
}

pub fn execute(config: &ConfigFile, args: &RunArgs) -> Result<(), String> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .map_err(|error| format!("Failed to create runtime: {error}"))?;
    runtime.block_on(run_simulation(config, args))
}

async fn run_simulation(config: &ConfigFile, args: &RunArgs) -> Result<(), String> {
    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || shutdown.cancel())
            .map_err(|error| format!("Failed to install signal handler: {error}"))?;
    }

    let crs = Crs::new(SIM_CRS);
    let extent = Extent::new(crs.clone(), 0.0, 0.0, WORLD_SIZE, WORLD_SIZE)
        .expect("world extent is well-formed");
    let center = WORLD_SIZE / 2.0;

    let mut registry = ViewRegistry::new();
    let renderer = Arc::new(HeadlessRenderer::new());
    let camera = Camera::new(
        DVec3::new(center + ORBIT_RADIUS, center, START_HEIGHT),
        DVec3::new(center, center, 0.0),
        Viewport::new(
            config.simulation.viewport_width,
            config.simulation.viewport_height,
        ),
    );
    let mut view = View::new(
        &mut registry,
        crs,
        camera,
        renderer.clone(),
        config.scheduler_config(),
        tokio::runtime::Handle::current(),
    );

    // Terrain with imagery draped on top, both procedural.
    let mut terrain_config = SyntheticSourceConfig::new("terrain", PayloadKind::Terrain)
        .with_latency(Duration::from_millis(config.simulation.fetch_latency_ms));
    if config.simulation.fail_every > 0 {
        terrain_config = terrain_config.with_fail_every(config.simulation.fail_every);
    }
    let ground = Layer::tiled_geometry("terrain", SourceHandle::new(SyntheticSource::new(terrain_config)))
        .with_extent(extent)
        .with_config(config.refinement_config());
    let ground_ready = view.add_layer(ground, None);

    let imagery = SyntheticSourceConfig::new("imagery", PayloadKind::Imagery)
        .with_latency(Duration::from_millis(config.simulation.fetch_latency_ms));
    view.add_layer(
        Layer::color("imagery", SourceHandle::new(SyntheticSource::new(imagery))),
        Some(&LayerId::new("terrain")),
    );

    ground_ready
        .wait()
        .await
        .map_err(|error| format!("Terrain layer failed to initialize: {error}"))?;

    // Scripted flight: a descending orbit spiraling toward the center.
    let total_frames = args.cycles.unwrap_or(config.simulation.cycles).max(1);
    let frame_counter = Rc::new(Cell::new(0u64));
    let mut main_loop = MainLoop::new();
    {
        let frame_counter = frame_counter.clone();
        main_loop.register(AttachPoint::BeforeLayerUpdate, move |view, _tick| {
            let frame = frame_counter.get() + 1;
            frame_counter.set(frame);
            let t = frame as f64 / total_frames as f64;
            let height = START_HEIGHT + (END_HEIGHT - START_HEIGHT) * t;
            let radius = ORBIT_RADIUS * (1.0 - 0.5 * t);
            let angle = t * TAU;
            let eye = DVec3::new(
                center + angle.cos() * radius,
                center + angle.sin() * radius,
                height,
            );
            view.update_camera(|camera| camera.set_pose(eye, DVec3::new(center, center, 0.0)));
            if frame >= total_frames {
                RequesterDirective::Remove
            } else {
                RequesterDirective::Continue
            }
        });
    }

    info!(frames = total_frames, "Starting simulated flight");
    let dt = config.frame_duration();
    let max_iterations = total_frames.saturating_mul(100) + 10_000;
    let mut iterations = 0u64;
    loop {
        if shutdown.is_cancelled() {
            info!("Interrupted; reporting partial results");
            break;
        }
        let ran = main_loop.step(&mut view, dt);
        if !ran && view.scheduler().is_idle() {
            break;
        }
        if frame_counter.get() > 0 && frame_counter.get() % 60 == 0 && ran {
            let snapshot = view.metrics().snapshot();
            info!(
                frame = frame_counter.get(),
                executed = snapshot.commands_executed,
                waiting = view.scheduler().commands_waiting_execution_count(),
                attached = renderer.attached_count(),
                "Flight progress"
            );
        }
        iterations += 1;
        if iterations >= max_iterations {
            warn!("Simulation did not settle; reporting current state");
            break;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    let displayed = view
        .get_layer_by_id(&LayerId::new("terrain"))
        .map(|layer| layer.displayed_tiles().len())
        .unwrap_or(0);
    print_report(
        &view.metrics().snapshot(),
        displayed,
        renderer.attached_count(),
        args.json,
    )?;

    view.dispose(&mut registry);
    Ok(())
}

fn print_report(
    snapshot: &TelemetrySnapshot,
    displayed_tiles: usize,
    attached_nodes: usize,
    json: bool,
) -> Result<(), String> {
    if json {
        let report = serde_json::to_string_pretty(snapshot)
            .map_err(|error| format!("Failed to serialize report: {error}"))?;
        println!("{report}");
        return Ok(());
    }
    println!();
    println!("Streaming report");
    println!("================");
    println!("Elapsed:              {:.1}s", snapshot.elapsed_secs);
    println!("Commands submitted:   {}", snapshot.commands_submitted);
    println!("  coalesced:          {}", snapshot.commands_coalesced);
    println!("  executed:           {}", snapshot.commands_executed);
    println!("  failed:             {}", snapshot.commands_failed);
    println!("  cancelled:          {}", snapshot.commands_cancelled);
    println!("Tiles displayed:      {}", snapshot.tiles_displayed);
    println!("Tiles evicted:        {}", snapshot.tiles_evicted);
    println!(
        "Cache hits/misses:    {}/{} ({:.0}% hit rate)",
        snapshot.cache_hits,
        snapshot.cache_misses,
        snapshot.cache_hit_ratio() * 100.0
    );
    println!(
        "Decoded:              {:.1} MB ({:.2} MB/s)",
        snapshot.bytes_decoded as f64 / 1_000_000.0,
        snapshot.bytes_per_second / 1_000_000.0
    );
    println!("Fetch rate:           {:.1}/s", snapshot.fetches_per_second);
    println!("Displayed at exit:    {displayed_tiles} tiles ({attached_nodes} scene nodes)");
    Ok(())
}
