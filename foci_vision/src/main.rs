// This file is an example of how to use the `foci_vision` library.
// The main library entry point is `src/lib.rs`.
//
// Usage: foci_vision [config.json] [composite_output_dir]

use anyhow::Context;
use foci_vision::core_modules::label_volume::LabelVolume;
use foci_vision::core_modules::progress::TracingProgress;
use foci_vision::{PipelineConfig, PipelineInputs, SpotPipeline};
use ndarray::{Array3, Array4};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const FRAMES: usize = 24;
const PLANES: usize = 9;
const SIDE: usize = 64;

/// Two nuclei, one blinking spot each, a lone flicker and a stray spot just outside
/// the second nucleus.
fn synthetic_movie() -> PipelineInputs {
    let mut nuclei = LabelVolume::zeros((FRAMES, SIDE, SIDE));
    let mut spots = LabelVolume::zeros((FRAMES, SIDE, SIDE));
    let mut ints = Array3::<f64>::zeros((FRAMES, SIDE, SIDE));
    let mut vols = Array3::<f64>::zeros((FRAMES, SIDE, SIDE));
    let mut raw = Array4::<f64>::from_elem((FRAMES, PLANES, SIDE, SIDE), 40.0);

    let mut put_spot = |t: usize, x: usize, y: usize, brightness: f64| {
        for (dx, dy) in [(0, 0), (0, 1), (1, 0), (1, 1)] {
            spots[[t, x + dx, y + dy]] = 1;
            ints[[t, x + dx, y + dy]] = brightness;
            vols[[t, x + dx, y + dy]] = 3.0;
            raw[[t, PLANES / 2, x + dx, y + dy]] = brightness;
        }
    };

    for t in 0..FRAMES {
        for x in 4..28 {
            for y in 4..28 {
                nuclei[[t, x, y]] = 11;
                nuclei[[t, x + 32, y + 32]] = 12;
            }
        }
        if t % 8 < 5 {
            put_spot(t, 14, 14, 120.0 + t as f64);
        }
        if (6..14).contains(&t) {
            put_spot(t, 45, 32, 90.0);
        }
    }
    put_spot(19, 14, 14, 200.0);

    PipelineInputs::new(nuclei, spots, raw, ints, vols)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    info!("Foci Vision Engine - Example Runner");
    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => PipelineConfig::from_file(&path).with_context(|| format!("loading config from {path}"))?,
        None => PipelineConfig::default(),
    };
    let composite_dir = args.next().map(PathBuf::from);

    let pipeline = SpotPipeline::new(config)?.with_observer(Arc::new(TracingProgress { stage: "pipeline" }));
    let output = pipeline.run(&synthetic_movie()).await?;

    info!(active_counts = ?output.activity.active_counts, "activity");
    for spot in &output.bursts.spots {
        info!(
            spot = spot.spot_id,
            bursts = spot.bursts.len(),
            durations = ?spot.bursts.iter().map(|b| b.duration).collect::<Vec<_>>(),
            off = ?spot.off_durations(),
            "burst statistics"
        );
    }
    info!(shape = ?output.bursts.to_array().dim(), "burst table");

    if let Some(dir) = composite_dir {
        std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
        for (t, frame) in output.activity.composite_frames().iter().enumerate() {
            let path = dir.join(format!("composite_{t:03}.png"));
            frame.save(&path).with_context(|| format!("writing {}", path.display()))?;
        }
        info!(dir = %dir.display(), "composite frames written");
    }

    Ok(())
}
