//! Plate pipeline benchmark
//!
//! Compiles (or reuses) the detector and recognizer, measures detector
//! throughput over a directory of images, then runs detection and recognition
//! on a single test image.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, bail, Context};
use api::config::{AppConfig, BackendKind};
use api::init_logging;
use api::pipeline::{self, Backend};
use clap::Parser;
use detection::{PlateDetection, PlateDetector};
use inference_engine::{InferFuture, InferenceEngine, Precision};
use media_source::{find_files, VideoFrame, IMAGE_PATTERNS};
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "plate-bench", version = env!("CARGO_PKG_VERSION"))]
struct Args {
    /// Configuration file (TOML)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Benchmark images, also the INT8 calibration set
    #[arg(long, default_value = "exp")]
    images: PathBuf,

    /// Image used for the detect + recognize pass
    #[arg(long, default_value = "exp/plate.jpg")]
    test_image: PathBuf,

    #[arg(long, default_value_t = 100)]
    iterations: usize,

    #[arg(long, default_value_t = 10)]
    warmup: usize,

    /// Detector precision (fp32, fp16, int8)
    #[arg(long)]
    precision: Option<Precision>,

    /// Use the in-process mock backend
    #[arg(long)]
    mock: bool,
}

/// Queue `rounds` passes over every frame without waiting in between
fn submit_rounds(
    engine: &InferenceEngine<PlateDetector>,
    frames: &[Arc<VideoFrame>],
    rounds: usize,
) -> Vec<InferFuture<Vec<PlateDetection>>> {
    (0..rounds)
        .flat_map(|_| engine.commits(frames.iter().cloned()))
        .collect()
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = AppConfig::load(args.config.as_deref())?;
    if let Some(precision) = args.precision {
        config.engine.precision = precision;
    }
    if args.mock {
        config.engine.backend = BackendKind::Mock;
    }
    config.engine.calibration_dir = args.images.clone();
    config.engine.devices.truncate(1);
    init_logging(&config.logging);

    let backend = Backend::from_settings(&config.engine);
    let detector = pipeline::detector_engines(&config, &backend)?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("no device configured"))?;
    let recognizer = pipeline::recognizer_engines(&config, &backend)?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("no device configured"))?;

    let frames = find_files(&args.images, IMAGE_PATTERNS)?
        .iter()
        .map(|path| {
            VideoFrame::load(path)
                .map(Arc::new)
                .with_context(|| format!("loading {}", path.display()))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    if frames.is_empty() {
        bail!("no images found in {}", args.images.display());
    }
    info!(
        "Benchmarking {} at {} over {} image(s)",
        detector.name(),
        config.engine.precision,
        frames.len()
    );

    if let Some(last) = submit_rounds(&detector, &frames, args.warmup).pop() {
        let _ = last.wait();
    }

    let start = Instant::now();
    let mut futures = submit_rounds(&detector, &frames, args.iterations);
    let last = futures.pop().map(InferFuture::wait);
    let elapsed = start.elapsed();
    let failures = futures
        .into_iter()
        .map(InferFuture::wait)
        .chain(last)
        .filter(Result::is_err)
        .count();

    let total = (args.iterations * frames.len()).max(1);
    let average_ms = elapsed.as_secs_f64() * 1000.0 / total as f64;
    info!(
        "average: {:.2} ms / image, FPS: {:.2}",
        average_ms,
        1000.0 / average_ms
    );
    if failures > 0 {
        warn!("{} of {} frame(s) failed", failures, total);
    }
    info!("Detector stats: {:?}", detector.stats());

    let frame = Arc::new(
        VideoFrame::load(&args.test_image)
            .with_context(|| format!("loading {}", args.test_image.display()))?,
    );
    for future in detector.commits(vec![frame.clone(); 3]) {
        let plates = future.wait()?;
        info!("{} plate(s) detected", plates.len());
        for plate in plates {
            let number = recognizer.commit((frame.clone(), plate)).wait()?;
            info!("current plate number is {}", number);
        }
    }

    detector.shutdown();
    recognizer.shutdown();
    Ok(())
}
