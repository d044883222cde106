//! Mock compiler and accelerator for development without a GPU

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ndarray::{ArrayD, ArrayViewD, ArrayViewMut2, Axis, Ix2, IxDyn};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cache::ModelCacheEntry;
use crate::calibration::{CalibrationFeed, CalibrationStats};
use crate::precision::Precision;
use crate::runtime::{Accelerator, CompileReport, CompileRequest, EngineHandle, ModelCompiler};
use crate::InferenceError;

/// Failure a [`MockCompiler`] should report
#[derive(Debug, Clone)]
pub enum MockFailure {
    /// The compiler rejects the model
    Reject(String),
    /// No accelerator is available
    NoDevice,
}

/// Artifact contents written by the mock compiler
#[derive(Debug, Clone, Serialize, Deserialize)]
struct MockArtifact {
    model: String,
    precision: Precision,
    max_batch_size: usize,
}

/// Compiler that writes a small descriptor instead of building an engine
#[derive(Default)]
pub struct MockCompiler {
    compiles: AtomicUsize,
    failure: Mutex<Option<MockFailure>>,
}

impl MockCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following build fail
    pub fn fail_with(&self, failure: MockFailure) {
        *self.failure.lock() = Some(failure);
    }

    /// Number of times `compile` was invoked
    pub fn compile_count(&self) -> usize {
        self.compiles.load(Ordering::SeqCst)
    }
}

impl ModelCompiler for MockCompiler {
    fn compile(
        &self,
        request: &CompileRequest<'_>,
        calibration: Option<&mut dyn CalibrationFeed>,
    ) -> Result<CompileReport, InferenceError> {
        self.compiles.fetch_add(1, Ordering::SeqCst);

        match self.failure.lock().clone() {
            Some(MockFailure::Reject(reason)) => {
                return Err(InferenceError::compilation(request.model, reason))
            }
            Some(MockFailure::NoDevice) => {
                return Err(InferenceError::Device("no accelerator available".into()))
            }
            None => {}
        }

        let calibration = match calibration {
            Some(feed) if request.precision.requires_calibration() => Some(CalibrationStats::collect(
                request.model,
                feed,
                request.calibration_samples,
                request.max_batch_size,
            )?),
            _ => None,
        };

        let artifact = MockArtifact {
            model: request.model.to_string(),
            precision: request.precision,
            max_batch_size: request.max_batch_size,
        };
        let json = serde_json::to_vec(&artifact)
            .map_err(|e| InferenceError::compilation(request.model, e))?;
        std::fs::write(request.output, json)?;

        debug!("Mock compiled {} [{}]", request.model, request.precision);
        Ok(CompileReport { calibration })
    }
}

/// Per-slot output layout of a [`MockHandle`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MockOutput {
    /// `[sum, mean]` of the slot's input
    #[default]
    Summary,
    /// `[rows, row_len]` detector rows for a `[C, H, W]` input. Row 0 is a centered
    /// box (half the width, a quarter of the height) with corner landmarks and
    /// high scores; the other rows are empty.
    Detections { rows: usize, row_len: usize },
    /// `[steps, classes]` logits: even steps pick classes `1, 2, ..` in turn,
    /// odd steps pick the blank (class 0)
    Sequence { steps: usize, classes: usize },
}

impl MockOutput {
    fn slot_shape(&self) -> Vec<usize> {
        match *self {
            MockOutput::Summary => vec![2],
            MockOutput::Detections { rows, row_len } => vec![rows, row_len],
            MockOutput::Sequence { steps, classes } => vec![steps, classes],
        }
    }

    fn fill(&self, input: ArrayViewD<'_, f32>, mut out: ndarray::ArrayViewMutD<'_, f32>) {
        match *self {
            MockOutput::Summary => {
                let sum: f32 = input.iter().sum();
                out[[0]] = sum;
                out[[1]] = sum / input.len().max(1) as f32;
            }
            MockOutput::Detections { .. } => {
                if let Ok(rows) = out.into_dimensionality::<Ix2>() {
                    fill_detection(input.shape(), rows);
                }
            }
            MockOutput::Sequence { steps, classes } => {
                if classes < 2 {
                    return;
                }
                for t in 0..steps {
                    let class = if t % 2 == 0 { 1 + (t / 2) % (classes - 1) } else { 0 };
                    out[[t, class]] = 5.0;
                }
            }
        }
    }
}

fn fill_detection(input_shape: &[usize], mut rows: ArrayViewMut2<'_, f32>) {
    if rows.nrows() == 0 {
        return;
    }
    let height = input_shape.get(1).copied().unwrap_or(1) as f32;
    let width = input_shape.get(2).copied().unwrap_or(1) as f32;
    let (cx, cy, w, h) = (width / 2.0, height / 2.0, width / 2.0, height / 4.0);
    let (left, top, right, bottom) = (cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0);

    let values = [
        cx, cy, w, h, 0.9, // box, objectness
        left, top, right, top, right, bottom, left, bottom, // corners
        0.95, // first class
    ];
    for (cell, value) in rows.row_mut(0).iter_mut().zip(values) {
        *cell = value;
    }
}

/// Emulated device engine.
///
/// Each batch slot produces a [`MockOutput`] layout computed from its input. Any
/// non-finite value in the batch makes the whole execution fail, like a device
/// fault would.
pub struct MockHandle {
    max_batch_size: usize,
    output: MockOutput,
    delay: Duration,
    batch_sizes: Mutex<Vec<usize>>,
    paused: Mutex<bool>,
    resumed: Condvar,
}

impl MockHandle {
    pub fn new(max_batch_size: usize) -> Self {
        Self {
            max_batch_size,
            output: MockOutput::default(),
            delay: Duration::ZERO,
            batch_sizes: Mutex::new(Vec::new()),
            paused: Mutex::new(false),
            resumed: Condvar::new(),
        }
    }

    pub fn with_output(mut self, output: MockOutput) -> Self {
        self.output = output;
        self
    }

    /// Simulated execution latency per batch
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Sizes of every executed batch, in execution order
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes.lock().clone()
    }

    /// Block executions until [`MockHandle::resume`]
    pub fn pause(&self) {
        *self.paused.lock() = true;
    }

    pub fn resume(&self) {
        *self.paused.lock() = false;
        self.resumed.notify_all();
    }
}

impl EngineHandle for MockHandle {
    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    fn execute(&self, batch: ArrayD<f32>) -> Result<Vec<ArrayD<f32>>, InferenceError> {
        let slots = batch.shape().first().copied().unwrap_or(0);
        self.batch_sizes.lock().push(slots);

        {
            let mut paused = self.paused.lock();
            while *paused {
                self.resumed.wait(&mut paused);
            }
        }
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }

        if batch.iter().any(|v| !v.is_finite()) {
            return Err(InferenceError::Device("non-finite value in input batch".into()));
        }

        let mut shape = vec![slots];
        shape.extend(self.output.slot_shape());
        let mut output = ArrayD::<f32>::zeros(IxDyn(&shape));
        for (item, slot) in batch.axis_iter(Axis(0)).zip(output.axis_iter_mut(Axis(0))) {
            self.output.fill(item, slot);
        }
        Ok(vec![output])
    }
}

/// Accelerator that loads mock artifacts onto a fixed number of fake devices
pub struct MockAccelerator {
    devices: usize,
    delay: Duration,
    outputs: HashMap<String, MockOutput>,
}

impl MockAccelerator {
    pub fn new(devices: usize) -> Self {
        Self {
            devices,
            delay: Duration::ZERO,
            outputs: HashMap::new(),
        }
    }

    /// Output layout for engines of `model`; others get [`MockOutput::Summary`]
    pub fn with_output(mut self, model: impl Into<String>, output: MockOutput) -> Self {
        self.outputs.insert(model.into(), output);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl Accelerator for MockAccelerator {
    fn load(
        &self,
        entry: &ModelCacheEntry,
        device_id: usize,
    ) -> Result<Arc<dyn EngineHandle>, InferenceError> {
        if device_id >= self.devices {
            return Err(InferenceError::Device(format!(
                "device {device_id} not present ({} available)",
                self.devices
            )));
        }
        let max_batch_size = read_max_batch(&entry.compiled_path).unwrap_or(entry.max_batch_size);
        info!(
            "Mock loaded {} on device {} (max_batch={})",
            entry.logical_name, device_id, max_batch_size
        );
        let output = self
            .outputs
            .get(&entry.logical_name)
            .copied()
            .unwrap_or_default();
        Ok(Arc::new(
            MockHandle::new(max_batch_size)
                .with_output(output)
                .with_delay(self.delay),
        ))
    }
}

fn read_max_batch(path: &Path) -> Option<usize> {
    let bytes = std::fs::read(path).ok()?;
    serde_json::from_slice::<MockArtifact>(&bytes)
        .ok()
        .map(|a| a.max_batch_size)
}
