//! ONNX Runtime backend (TensorRT / CUDA execution providers)
//!
//! Compilation builds a session for the target precision and serializes the
//! optimized graph as the cached artifact; TensorRT engine plans are kept in
//! the provider's own engine cache next to it. Loading opens the artifact on
//! the requested device.
//!
//! INT8 is explicit quantization only: the source model must already carry
//! QuantizeLinear/DequantizeLinear nodes, whose scales TensorRT uses directly.
//! The calibration feed only contributes the recorded input range.

use std::path::PathBuf;
use std::sync::Arc;

use ndarray::ArrayD;
use ort::execution_providers::{
    CUDAExecutionProvider, ExecutionProviderDispatch, TensorRTExecutionProvider,
};
use ort::session::builder::{GraphOptimizationLevel, SessionBuilder};
use ort::session::Session;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cache::ModelCacheEntry;
use crate::calibration::{CalibrationFeed, CalibrationStats};
use crate::precision::Precision;
use crate::runtime::{Accelerator, CompileReport, CompileRequest, EngineHandle, ModelCompiler};
use crate::InferenceError;

/// ONNX Runtime backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrtBackend {
    /// Register the TensorRT provider in front of CUDA
    pub use_tensorrt: bool,
    /// Directory for TensorRT engine plans
    pub trt_cache_dir: Option<PathBuf>,
    /// Intra-op threads for CPU-side kernels
    pub intra_threads: usize,
}

impl Default for OrtBackend {
    fn default() -> Self {
        Self {
            use_tensorrt: true,
            trt_cache_dir: None,
            intra_threads: 1,
        }
    }
}

impl OrtBackend {
    pub fn new(trt_cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            trt_cache_dir: Some(trt_cache_dir.into()),
            ..Default::default()
        }
    }

    fn providers(&self, precision: Precision, device_id: usize) -> Vec<ExecutionProviderDispatch> {
        let device = device_id as i32;
        let mut providers = Vec::with_capacity(2);

        if self.use_tensorrt {
            let mut trt = TensorRTExecutionProvider::default().with_device_id(device);
            match precision {
                Precision::Fp32 => {}
                Precision::Fp16 => trt = trt.with_fp16(true),
                Precision::Int8 => trt = trt.with_fp16(true).with_int8(true),
            }
            if let Some(dir) = &self.trt_cache_dir {
                trt = trt
                    .with_engine_cache(true)
                    .with_engine_cache_path(dir.to_string_lossy().to_string());
            }
            providers.push(trt.build().error_on_failure());
        }
        providers.push(
            CUDAExecutionProvider::default()
                .with_device_id(device)
                .build()
                .error_on_failure(),
        );
        providers
    }

    /// Session builder with the device providers registered.
    /// Provider registration failures mean the accelerator is unavailable.
    fn builder(&self, precision: Precision, device_id: usize) -> Result<SessionBuilder, InferenceError> {
        let device_error = |e: ort::Error| InferenceError::Device(format!("device {device_id}: {e}"));
        Session::builder()
            .map_err(device_error)?
            .with_execution_providers(self.providers(precision, device_id))
            .map_err(device_error)
    }
}

impl ModelCompiler for OrtBackend {
    fn compile(
        &self,
        request: &CompileRequest<'_>,
        calibration: Option<&mut dyn CalibrationFeed>,
    ) -> Result<CompileReport, InferenceError> {
        let rejected = |e: ort::Error| InferenceError::compilation(request.model, e);

        // TensorRT builds INT8 from the scales carried by Q/DQ nodes in the graph.
        if request.precision.requires_calibration() {
            let model = std::fs::read(request.source)
                .map_err(|e| InferenceError::compilation(request.model, e))?;
            if !has_qdq_nodes(&model) {
                return Err(InferenceError::compilation(
                    request.model,
                    "int8 requires a model quantized with QuantizeLinear/DequantizeLinear nodes",
                ));
            }
        }

        // The feed is only measured so the sidecar records the input range seen
        let input_range = match calibration {
            Some(feed) if request.precision.requires_calibration() => {
                let stats = CalibrationStats::collect(
                    request.model,
                    feed,
                    request.calibration_samples,
                    request.max_batch_size,
                )?;
                info!(
                    "Building {} [int8] from embedded Q/DQ scales; input range [{:.3}, {:.3}] over {} samples",
                    request.model, stats.min, stats.max, stats.samples
                );
                Some(stats)
            }
            _ => None,
        };

        let session = self
            .builder(request.precision, 0)?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .and_then(|b| b.with_intra_threads(self.intra_threads))
            .and_then(|b| b.with_optimized_model_path(request.output.to_string_lossy().into_owned()))
            .map_err(rejected)?
            .commit_from_file(request.source)
            .map_err(rejected)?;

        if let Some(batch) = leading_dim(&session) {
            if batch < request.max_batch_size {
                warn!(
                    "{} has a fixed batch dimension of {}, below the requested {}",
                    request.model, batch, request.max_batch_size
                );
            }
        }
        debug!(
            "Compiled {}: inputs={:?} outputs={:?}",
            request.model,
            session.inputs.iter().map(|i| &i.name).collect::<Vec<_>>(),
            session.outputs.iter().map(|o| &o.name).collect::<Vec<_>>()
        );

        Ok(CompileReport {
            calibration: input_range,
        })
    }
}

impl Accelerator for OrtBackend {
    fn load(
        &self,
        entry: &ModelCacheEntry,
        device_id: usize,
    ) -> Result<Arc<dyn EngineHandle>, InferenceError> {
        let session = self
            .builder(entry.precision, device_id)?
            .with_intra_threads(self.intra_threads)
            .map_err(|e| InferenceError::Device(e.to_string()))?
            .commit_from_file(&entry.compiled_path)
            .map_err(|e| InferenceError::compilation(&entry.logical_name, e))?;

        let max_batch_size = leading_dim(&session).unwrap_or(entry.max_batch_size);
        let output_names = session.outputs.iter().map(|o| o.name.clone()).collect();
        info!(
            "Loaded {} [{}] on device {} (max_batch={})",
            entry.logical_name, entry.precision, device_id, max_batch_size
        );

        Ok(Arc::new(OrtHandle {
            session,
            output_names,
            max_batch_size,
        }))
    }
}

/// Whether a serialized ONNX graph contains quantize/dequantize operators.
/// Op types are stored as plain strings, and `DequantizeLinear` contains
/// `QuantizeLinear`, so a single substring search covers both.
fn has_qdq_nodes(model: &[u8]) -> bool {
    const OP: &[u8] = b"QuantizeLinear";
    model.windows(OP.len()).any(|window| window == OP)
}

/// Fixed batch dimension of the first input, `None` when dynamic
fn leading_dim(session: &Session) -> Option<usize> {
    session
        .inputs
        .first()
        .and_then(|input| input.input_type.tensor_dimensions())
        .and_then(|dims| dims.first().copied())
        .filter(|&d| d > 0)
        .map(|d| d as usize)
}

struct OrtHandle {
    session: Session,
    output_names: Vec<String>,
    max_batch_size: usize,
}

impl EngineHandle for OrtHandle {
    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    fn execute(&self, batch: ArrayD<f32>) -> Result<Vec<ArrayD<f32>>, InferenceError> {
        let device_error = |e: ort::Error| InferenceError::Device(e.to_string());

        let input = ort::value::Tensor::from_array(batch).map_err(device_error)?;
        let outputs = self
            .session
            .run(ort::inputs![input].map_err(device_error)?)
            .map_err(device_error)?;

        let mut tensors = Vec::with_capacity(self.output_names.len());
        for name in &self.output_names {
            let view = outputs[name.as_str()]
                .try_extract_tensor::<f32>()
                .map_err(device_error)?;
            tensors.push(view.into_owned());
        }
        Ok(tensors)
    }
}
