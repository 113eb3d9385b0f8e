use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use image::RgbImage;
use indicatif::{ProgressBar, ProgressStyle};
use nalgebra::Vector2;
use std::path::PathBuf;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use flowtrack_core::{
    engine::{EngineConfig, TrackingEngine},
    entity::BBox,
    field::{FlowSample, VelocityField},
    mask::HiddenMask,
    render::draw_overlay,
};

// ── CLI definition ────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "flowtrack",
    version,
    about = "Multi-object tracker with an adaptive velocity-field motion prior",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the tracker over a scene file of per-frame detections and flows.
    Track {
        /// Scene file: `frame` / `det;x1;y1;x2;y2` / `flow;px;py;nx;ny` lines
        #[arg(short, long)]
        scene: PathBuf,

        /// Frame width in pixels
        #[arg(long)]
        width: u32,

        /// Frame height in pixels
        #[arg(long)]
        height: u32,

        /// Velocity-field cell size in pixels
        #[arg(long, default_value_t = 10)]
        pitch: u32,

        /// Permitted-hidden-zone image; whole frame is permissive if omitted
        #[arg(long)]
        mask: Option<PathBuf>,

        /// Velocity-field snapshot, loaded at start and saved back at the end
        #[arg(long)]
        field: Option<PathBuf>,

        /// Directory receiving one overlay PNG per frame
        #[arg(long)]
        overlay_dir: Option<PathBuf>,
    },

    /// Print the dimensions and occupancy of a velocity-field snapshot.
    FieldInfo {
        /// Snapshot file path
        #[arg(short, long)]
        snapshot: PathBuf,
    },
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    // Respect RUST_LOG; default to info
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Track {
            scene,
            width,
            height,
            pitch,
            mask,
            field,
            overlay_dir,
        } => cmd_track(scene, width, height, pitch, mask, field, overlay_dir),
        Commands::FieldInfo { snapshot } => cmd_field_info(snapshot),
    }
}

// ── Tracking run ──────────────────────────────────────────────────────────────

fn cmd_track(
    scene_path: PathBuf,
    width: u32,
    height: u32,
    pitch: u32,
    mask_path: Option<PathBuf>,
    field_path: Option<PathBuf>,
    overlay_dir: Option<PathBuf>,
) -> Result<()> {
    info!("Tracking run");
    info!("  scene : {}", scene_path.display());
    info!("  frame : {width}×{height}, field pitch {pitch}");

    let scene = std::fs::read_to_string(&scene_path)
        .with_context(|| format!("failed to read scene file {}", scene_path.display()))?;
    let frames = parse_scene(&scene);
    info!("  frames: {}", frames.len());

    let mask = match &mask_path {
        Some(path) => HiddenMask::open(path)?,
        None => HiddenMask::permissive(width, height),
    };

    let field = match &field_path {
        Some(path) => VelocityField::load_or_new(path, height, width, pitch),
        None => VelocityField::new(height, width, pitch),
    };

    if let Some(dir) = &overlay_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create overlay dir {}", dir.display()))?;
    }

    let mut engine = TrackingEngine::new(field, EngineConfig::default());

    let pb = ProgressBar::new(frames.len() as u64);
    pb.set_style(
        ProgressStyle::with_template("{bar:32.cyan} {pos}/{len} frames [{elapsed_precise}] {msg}")
            .context("invalid progress template")?,
    );

    for (index, frame) in frames.iter().enumerate() {
        engine.process_frame(&frame.detections, &frame.flows, &mask);

        for track in engine.tracks() {
            if let Ok(members) = track.members() {
                debug!(frame = index, members = members.len(), "group active");
            }
        }

        if let Some(dir) = &overlay_dir {
            let mut canvas = RgbImage::new(width, height);
            draw_overlay(&mut canvas, &engine.views());
            let path = dir.join(format!("frame_{index:05}.png"));
            if let Err(e) = canvas.save(&path) {
                warn!("failed to save overlay {}: {e}", path.display());
            }
        }

        pb.inc(1);
    }
    pb.finish_with_message("Done.");

    info!(
        frames = engine.frames_processed(),
        live_tracks = engine.tracks().len(),
        field_cells = engine.field().nonzero_cells(),
        "run complete"
    );

    if let Some(path) = &field_path {
        engine
            .field()
            .save(path)
            .with_context(|| format!("failed to save field snapshot {}", path.display()))?;
        info!("field snapshot saved to {}", path.display());
    }

    Ok(())
}

// ── Snapshot inspection ───────────────────────────────────────────────────────

fn cmd_field_info(snapshot: PathBuf) -> Result<()> {
    let field = VelocityField::load(&snapshot)
        .with_context(|| format!("failed to load snapshot {}", snapshot.display()))?;
    info!(
        rows = field.rows(),
        cols = field.cols(),
        pitch = field.pitch(),
        nonzero_cells = field.nonzero_cells(),
        "velocity field snapshot"
    );
    Ok(())
}

// ── Scene file parsing ────────────────────────────────────────────────────────

/// One frame's worth of collaborator output.
#[derive(Default)]
struct SceneFrame {
    detections: Vec<BBox>,
    flows: Vec<FlowSample>,
}

/// Parse the scene text format.  `frame` opens a new frame; `det` and
/// `flow` records attach to the current one.  Malformed lines are logged
/// and skipped, never fatal.
fn parse_scene(text: &str) -> Vec<SceneFrame> {
    let mut frames: Vec<SceneFrame> = Vec::new();

    for (number, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut parts = line.split(';').map(str::trim);
        match parts.next() {
            Some("frame") => frames.push(SceneFrame::default()),
            Some("det") => {
                let Some(frame) = frames.last_mut() else {
                    warn!(line = number + 1, "det record before the first frame");
                    continue;
                };
                match parse_floats::<4>(parts) {
                    Some([x1, y1, x2, y2]) => {
                        frame.detections.push(BBox::new(x1, y1, x2, y2));
                    }
                    None => warn!(line = number + 1, "malformed det record"),
                }
            }
            Some("flow") => {
                let Some(frame) = frames.last_mut() else {
                    warn!(line = number + 1, "flow record before the first frame");
                    continue;
                };
                match parse_floats::<4>(parts) {
                    Some([px, py, nx, ny]) => frame.flows.push(FlowSample {
                        from: Vector2::new(px, py),
                        to: Vector2::new(nx, ny),
                    }),
                    None => warn!(line = number + 1, "malformed flow record"),
                }
            }
            _ => warn!(line = number + 1, "unknown scene record"),
        }
    }

    frames
}

/// Collect exactly `N` floats from the remaining fields of a record.
fn parse_floats<'a, const N: usize>(
    mut parts: impl Iterator<Item = &'a str>,
) -> Option<[f32; N]> {
    let mut values = [0.0f32; N];
    for value in &mut values {
        *value = parts.next()?.parse().ok()?;
    }
    Some(values)
}
