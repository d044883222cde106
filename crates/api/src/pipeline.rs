//! Wiring configuration into compiled, loaded engines

use std::path::Path;
use std::sync::Arc;

use detection::{PlateDetector, PlateRecognizer};
use inference_engine::mock::{MockAccelerator, MockCompiler, MockOutput};
use inference_engine::{
    Accelerator, CalibrationFeed, EngineConfig, FileCalibrationFeed, InferenceEngine,
    InferenceError, InferenceTask, ModelCache, ModelCompiler, OrtBackend, Precision,
};
use media_source::{find_files, StandardOpener, VideoFrame, IMAGE_PATTERNS};
use stream_orchestrator::StreamOrchestrator;
use tracing::info;

use crate::config::{AppConfig, BackendKind, EngineSettings};

/// Compiler and accelerator selected by configuration
#[derive(Clone)]
pub struct Backend {
    pub compiler: Arc<dyn ModelCompiler>,
    pub accelerator: Arc<dyn Accelerator>,
}

impl Backend {
    pub fn from_settings(settings: &EngineSettings) -> Self {
        match settings.backend {
            BackendKind::Ort => {
                let ort = Arc::new(OrtBackend {
                    use_tensorrt: settings.use_tensorrt,
                    trt_cache_dir: Some(settings.cache_dir.join("trt")),
                    ..OrtBackend::default()
                });
                Self {
                    compiler: ort.clone(),
                    accelerator: ort,
                }
            }
            BackendKind::Mock => {
                let devices = settings.devices.iter().max().map_or(1, |d| d + 1);
                // Shaped like the plate models: 15-value detector rows, CTC logits
                let accelerator = MockAccelerator::new(devices)
                    .with_output(
                        settings.detector_model.clone(),
                        MockOutput::Detections { rows: 16, row_len: 15 },
                    )
                    .with_output(
                        settings.recognizer_model.clone(),
                        MockOutput::Sequence { steps: 21, classes: 8 },
                    );
                Self {
                    compiler: Arc::new(MockCompiler::new()),
                    accelerator: Arc::new(accelerator),
                }
            }
        }
    }

    pub fn model_cache(&self, settings: &EngineSettings) -> ModelCache {
        ModelCache::new(&settings.model_dir, &settings.cache_dir, self.compiler.clone())
            .with_calibration_samples(settings.calibration_samples)
    }
}

/// INT8 calibration set: every image under `dir`, preprocessed like detector input
pub fn image_calibration_feed(
    model: &str,
    dir: &Path,
    detector: Arc<PlateDetector>,
) -> Result<Box<dyn CalibrationFeed>, InferenceError> {
    let files = find_files(dir, IMAGE_PATTERNS).map_err(|e| InferenceError::Compilation {
        model: model.to_string(),
        reason: format!("calibration images in {}: {e}", dir.display()),
    })?;
    info!("Calibration feed: {} images from {}", files.len(), dir.display());

    Ok(Box::new(FileCalibrationFeed::new(files, move |path: &Path| {
        let frame = VideoFrame::load(path).map_err(|e| InferenceError::InvalidInput(e.to_string()))?;
        detector.preprocess(&Arc::new(frame))
    })))
}

/// Resolve (compiling on a miss) `model` and start one engine per configured device
pub fn load_engines<T, F>(
    backend: &Backend,
    settings: &EngineSettings,
    model: &str,
    precision: Precision,
    calibration: Option<&mut dyn CalibrationFeed>,
    make_task: F,
) -> Result<Vec<Arc<InferenceEngine<T>>>, InferenceError>
where
    T: InferenceTask,
    F: Fn() -> Result<T, InferenceError>,
{
    let cache = backend.model_cache(settings);
    let entry = cache.resolve_or_build(model, precision, settings.max_batch_size, calibration)?;

    settings
        .devices
        .iter()
        .map(|&device_id| {
            let config = EngineConfig {
                name: format!("{model}-dev{device_id}"),
                device_id,
                max_batch_size: settings.max_batch_size,
            };
            InferenceEngine::load(make_task()?, backend.accelerator.as_ref(), &entry, config)
                .map(Arc::new)
        })
        .collect()
}

/// Plate detector engines for every device
pub fn detector_engines(
    config: &AppConfig,
    backend: &Backend,
) -> Result<Vec<Arc<InferenceEngine<PlateDetector>>>, InferenceError> {
    let settings = &config.engine;
    let make_task = || -> Result<PlateDetector, InferenceError> {
        Ok(PlateDetector::new(config.detection.clone())?)
    };

    let mut feed = if settings.precision.requires_calibration() {
        Some(image_calibration_feed(
            &settings.detector_model,
            &settings.calibration_dir,
            Arc::new(make_task()?),
        )?)
    } else {
        None
    };

    load_engines(
        backend,
        settings,
        &settings.detector_model,
        settings.precision,
        feed.as_mut().map(|f| &mut **f as &mut dyn CalibrationFeed),
        make_task,
    )
}

/// Plate recognizer engines for every device
pub fn recognizer_engines(
    config: &AppConfig,
    backend: &Backend,
) -> Result<Vec<Arc<InferenceEngine<PlateRecognizer>>>, InferenceError> {
    let settings = &config.engine;
    load_engines(
        backend,
        settings,
        &settings.recognizer_model,
        settings.recognizer_precision,
        None,
        || Ok(PlateRecognizer::new(config.detection.clone())?),
    )
}

/// Orchestrator streaming frames through the detector engines
pub fn build_orchestrator(
    config: &AppConfig,
    backend: &Backend,
) -> Result<StreamOrchestrator<PlateDetector>, InferenceError> {
    let engines = detector_engines(config, backend)?;
    Ok(StreamOrchestrator::new(
        engines,
        Arc::new(StandardOpener::default()),
        config.streams.clone(),
    ))
}
