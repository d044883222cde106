//! Accelerator runtime seams: compiling models and executing loaded engines

use std::path::Path;
use std::sync::Arc;

use ndarray::{ArrayD, ArrayViewD, Axis};

use crate::cache::ModelCacheEntry;
use crate::calibration::{CalibrationFeed, CalibrationStats};
use crate::precision::Precision;
use crate::InferenceError;

/// Everything the compiler needs for one build
#[derive(Debug, Clone)]
pub struct CompileRequest<'a> {
    /// Logical model name, for diagnostics
    pub model: &'a str,
    pub precision: Precision,
    /// Batch ceiling the engine is optimized for
    pub max_batch_size: usize,
    /// Portable model description (ONNX)
    pub source: &'a Path,
    /// Where the compiled artifact must be written
    pub output: &'a Path,
    /// Samples to draw from the calibration feed (INT8 only)
    pub calibration_samples: usize,
}

/// What a successful build produced besides the artifact itself
#[derive(Debug, Clone, Default)]
pub struct CompileReport {
    /// Ranges measured during INT8 calibration
    pub calibration: Option<CalibrationStats>,
}

/// Builds a device-optimized artifact from a portable model.
///
/// Invoked by [`crate::ModelCache`] on cache miss only.
pub trait ModelCompiler: Send + Sync {
    fn compile(
        &self,
        request: &CompileRequest<'_>,
        calibration: Option<&mut dyn CalibrationFeed>,
    ) -> Result<CompileReport, InferenceError>;
}

/// A loaded, device-resident engine. Read-only once loaded.
pub trait EngineHandle: Send + Sync {
    /// Largest batch a single `execute` accepts
    fn max_batch_size(&self) -> usize;

    /// Run one batch (leading axis = batch slot). Outputs keep the batch axis first.
    fn execute(&self, batch: ArrayD<f32>) -> Result<Vec<ArrayD<f32>>, InferenceError>;
}

/// Loads compiled artifacts onto a device
pub trait Accelerator: Send + Sync {
    fn load(
        &self,
        entry: &ModelCacheEntry,
        device_id: usize,
    ) -> Result<Arc<dyn EngineHandle>, InferenceError>;
}

/// Stack per-item tensors into one batch tensor along a new leading axis
pub(crate) fn stack_tensors<'a>(
    items: impl IntoIterator<Item = ArrayViewD<'a, f32>>,
) -> Result<ArrayD<f32>, InferenceError> {
    let views: Vec<ArrayViewD<'a, f32>> = items.into_iter().collect();
    ndarray::stack(Axis(0), &views).map_err(|e| {
        let shapes: Vec<_> = views.iter().map(|v| v.shape().to_vec()).collect();
        InferenceError::InvalidInput(format!("cannot batch tensors {shapes:?}: {e}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::IxDyn;

    #[test]
    fn test_stack_adds_batch_axis() {
        let items = vec![
            ArrayD::from_elem(IxDyn(&[2, 3]), 1.0),
            ArrayD::from_elem(IxDyn(&[2, 3]), 2.0),
        ];
        let batch = stack_tensors(items.iter().map(|t| t.view())).unwrap();
        assert_eq!(batch.shape(), &[2, 2, 3]);
        assert_eq!(batch[[1, 0, 0]], 2.0);
    }

    #[test]
    fn test_stack_rejects_mixed_shapes() {
        let items = vec![
            ArrayD::from_elem(IxDyn(&[2, 3]), 1.0),
            ArrayD::from_elem(IxDyn(&[3, 3]), 2.0),
        ];
        assert!(matches!(
            stack_tensors(items.iter().map(|t| t.view())),
            Err(InferenceError::InvalidInput(_))
        ));
    }
}
