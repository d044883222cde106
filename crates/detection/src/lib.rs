//! License Plate Detection and Recognition
//!
//! Model-specific pre/post-processing plugged into the batched engine:
//! - Plate detection (YOLO-style decode with landmarks, class-aware NMS)
//! - Plate recognition (CTC greedy decoding over a character set)

pub mod config;
pub mod detector;
pub mod recognizer;

pub use config::DetectionConfig;
pub use detector::{non_max_suppression, Letterbox, PlateDetection, PlateDetector};
pub use recognizer::{ctc_greedy_decode, PlateRecognizer};

use inference_engine::InferenceError;
use thiserror::Error;

/// Detection error types
#[derive(Error, Debug)]
pub enum DetectionError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Unexpected output shape {shape:?}: {reason}")]
    OutputShape { shape: Vec<usize>, reason: String },

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),
}

impl From<DetectionError> for InferenceError {
    fn from(err: DetectionError) -> Self {
        match err {
            DetectionError::InvalidFrame(_) | DetectionError::InvalidConfig(_) => {
                InferenceError::InvalidInput(err.to_string())
            }
            DetectionError::OutputShape { .. } => InferenceError::Postprocess(err.to_string()),
        }
    }
}
