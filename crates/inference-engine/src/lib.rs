//! Batched Accelerator Inference Engine
//!
//! Compiles ONNX models into device-optimized engines (cached on disk,
//! optionally calibrated for INT8) and serves concurrent requests through
//! a dedicated worker that dynamically batches them.

mod batcher;
pub mod cache;
pub mod calibration;
mod engine;
pub mod mock;
pub mod ort_backend;
pub mod precision;
pub mod runtime;
pub mod task;

pub use cache::{ModelCache, ModelCacheEntry};
pub use calibration::{CalibrationFeed, CalibrationStats, FileCalibrationFeed, TensorCalibrationFeed};
pub use engine::{EngineConfig, EngineStats, InferFuture, InferenceEngine};
pub use ort_backend::OrtBackend;
pub use precision::Precision;
pub use runtime::{Accelerator, CompileReport, CompileRequest, EngineHandle, ModelCompiler};
pub use task::InferenceTask;

use thiserror::Error;

/// Errors during compilation and inference
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("Compilation of {model} failed: {reason}")]
    Compilation { model: String, reason: String },
    #[error("Device error: {0}")]
    Device(String),
    #[error("Batch of {batch_size} failed: {reason}")]
    BatchFailed {
        batch_size: usize,
        device_fault: bool,
        reason: String,
    },
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Post-processing failed: {0}")]
    Postprocess(String),
    #[error("Engine has been shut down")]
    EngineShutdown,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where a failure originated, so callers can decide to recompile, retry or give up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStage {
    /// The model could not be built
    Compile,
    /// A request or its batch failed while serving
    Serving,
    /// The accelerator itself faulted or is unavailable
    Device,
}

impl InferenceError {
    pub(crate) fn compilation(model: &str, reason: impl ToString) -> Self {
        InferenceError::Compilation {
            model: model.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Classify the failure
    pub fn stage(&self) -> FailureStage {
        match self {
            InferenceError::Compilation { .. } => FailureStage::Compile,
            InferenceError::Device(_) => FailureStage::Device,
            InferenceError::BatchFailed { device_fault, .. } => {
                if *device_fault {
                    FailureStage::Device
                } else {
                    FailureStage::Serving
                }
            }
            InferenceError::InvalidInput(_)
            | InferenceError::Postprocess(_)
            | InferenceError::EngineShutdown
            | InferenceError::Io(_) => FailureStage::Serving,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_stage() {
        let device_batch = InferenceError::BatchFailed {
            batch_size: 4,
            device_fault: true,
            reason: "xid 79".into(),
        };
        let shape_batch = InferenceError::BatchFailed {
            batch_size: 4,
            device_fault: false,
            reason: "shape".into(),
        };

        assert_eq!(device_batch.stage(), FailureStage::Device);
        assert_eq!(shape_batch.stage(), FailureStage::Serving);
        assert_eq!(
            InferenceError::compilation("plate", "bad op").stage(),
            FailureStage::Compile
        );
        assert_eq!(InferenceError::EngineShutdown.stage(), FailureStage::Serving);
    }
}
