//! Layered application configuration
//!
//! Built-in defaults, then an optional TOML file, then `TRAFFIC__*` environment
//! variables (`TRAFFIC__SERVER__PORT=9000`, `TRAFFIC__ENGINE__PRECISION=int8`, ...).

use std::path::{Path, PathBuf};

use config::{Config, ConfigError, Environment, File};
use detection::DetectionConfig;
use inference_engine::Precision;
use serde::{Deserialize, Serialize};
use stream_orchestrator::StreamConfig;

/// Which compiler/accelerator pair serves the models
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// ONNX Runtime with TensorRT / CUDA
    #[default]
    Ort,
    /// In-process emulation, no GPU required
    Mock,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl ServerConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Model compilation and serving settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub backend: BackendKind,
    /// Holds `<name>.onnx` sources
    pub model_dir: PathBuf,
    /// Holds compiled `<name>.<precision>.engine` artifacts
    pub cache_dir: PathBuf,
    pub detector_model: String,
    pub recognizer_model: String,
    pub precision: Precision,
    pub recognizer_precision: Precision,
    pub max_batch_size: usize,
    /// One engine per listed device
    pub devices: Vec<usize>,
    /// Images used to calibrate INT8 builds
    pub calibration_dir: PathBuf,
    pub calibration_samples: usize,
    /// Put TensorRT in front of CUDA (ort backend only)
    pub use_tensorrt: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            model_dir: PathBuf::from("models"),
            cache_dir: PathBuf::from("models/cache"),
            detector_model: "plate_detect".to_string(),
            recognizer_model: "plate_rec".to_string(),
            precision: Precision::Fp16,
            recognizer_precision: Precision::Fp32,
            max_batch_size: 16,
            devices: vec![0],
            calibration_dir: PathBuf::from("calibration"),
            calibration_samples: inference_engine::cache::DEFAULT_CALIBRATION_SAMPLES,
            use_tensorrt: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Complete gateway configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub engine: EngineSettings,
    pub detection: DetectionConfig,
    pub streams: StreamConfig,
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load defaults, `path` (when given) and the environment, in that order
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder().add_source(Config::try_from(&AppConfig::default())?);
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        builder
            .add_source(
                Environment::with_prefix("TRAFFIC")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}
