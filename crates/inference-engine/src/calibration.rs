//! Calibration data for reduced-precision compilation

use std::path::{Path, PathBuf};

use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::runtime::stack_tensors;
use crate::InferenceError;

/// Pull-based supplier of preprocessed input batches.
///
/// Only the compiler calls this, never the serving path.
pub trait CalibrationFeed: Send {
    /// Total number of samples the feed can supply
    fn sample_count(&self) -> usize;

    /// Next batch of at most `max_batch` samples stacked along a new leading axis,
    /// `None` once the feed is exhausted
    fn next_batch(&mut self, max_batch: usize) -> Result<Option<ArrayD<f32>>, InferenceError>;
}

/// Feed over tensors already held in memory
pub struct TensorCalibrationFeed {
    samples: Vec<ArrayD<f32>>,
    position: usize,
}

impl TensorCalibrationFeed {
    pub fn new(samples: Vec<ArrayD<f32>>) -> Self {
        Self {
            samples,
            position: 0,
        }
    }
}

impl CalibrationFeed for TensorCalibrationFeed {
    fn sample_count(&self) -> usize {
        self.samples.len()
    }

    fn next_batch(&mut self, max_batch: usize) -> Result<Option<ArrayD<f32>>, InferenceError> {
        if self.position >= self.samples.len() {
            return Ok(None);
        }
        let end = (self.position + max_batch.max(1)).min(self.samples.len());
        let batch = stack_tensors(self.samples[self.position..end].iter().map(|t| t.view()))?;
        self.position = end;
        Ok(Some(batch))
    }
}

/// Feed that decodes and preprocesses files lazily, batch by batch
pub struct FileCalibrationFeed<F> {
    files: Vec<PathBuf>,
    position: usize,
    loader: F,
}

impl<F> FileCalibrationFeed<F>
where
    F: FnMut(&Path) -> Result<ArrayD<f32>, InferenceError> + Send,
{
    /// `loader` turns one file into a preprocessed tensor matching the network input
    pub fn new(files: Vec<PathBuf>, loader: F) -> Self {
        Self {
            files,
            position: 0,
            loader,
        }
    }
}

impl<F> CalibrationFeed for FileCalibrationFeed<F>
where
    F: FnMut(&Path) -> Result<ArrayD<f32>, InferenceError> + Send,
{
    fn sample_count(&self) -> usize {
        self.files.len()
    }

    fn next_batch(&mut self, max_batch: usize) -> Result<Option<ArrayD<f32>>, InferenceError> {
        if self.position >= self.files.len() {
            return Ok(None);
        }
        let end = (self.position + max_batch.max(1)).min(self.files.len());
        let mut samples = Vec::with_capacity(end - self.position);
        for file in &self.files[self.position..end] {
            samples.push((self.loader)(file)?);
        }
        self.position = end;
        Ok(Some(stack_tensors(samples.iter().map(|t| t.view()))?))
    }
}

/// Activation range statistics gathered from the calibration set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationStats {
    pub samples: usize,
    pub min: f32,
    pub max: f32,
    pub abs_max: f32,
    pub mean: f64,
}

impl CalibrationStats {
    /// Pull batches until `required` samples were consumed or the feed runs dry
    pub fn collect(
        model: &str,
        feed: &mut dyn CalibrationFeed,
        required: usize,
        max_batch: usize,
    ) -> Result<Self, InferenceError> {
        let count = required.min(feed.sample_count());
        let mut stats = Self {
            samples: 0,
            min: f32::INFINITY,
            max: f32::NEG_INFINITY,
            abs_max: 0.0,
            mean: 0.0,
        };
        let mut sum = 0.0f64;
        let mut values = 0usize;

        while stats.samples < count {
            let want = (count - stats.samples).min(max_batch.max(1));
            let Some(batch) = feed.next_batch(want)? else {
                break;
            };
            let batch_len = batch.shape().first().copied().unwrap_or(0);
            if batch_len == 0 {
                break;
            }
            for &v in batch.iter() {
                stats.min = stats.min.min(v);
                stats.max = stats.max.max(v);
                stats.abs_max = stats.abs_max.max(v.abs());
                sum += v as f64;
            }
            values += batch.len();
            stats.samples += batch_len;
            info!("Int8 {} / {}", stats.samples, count);
        }

        if stats.samples == 0 {
            return Err(InferenceError::compilation(model, "calibration feed supplied no samples"));
        }
        stats.mean = sum / values.max(1) as f64;
        debug!("Calibration stats for {}: {:?}", model, stats);
        Ok(stats)
    }

    /// Sidecar file written next to an INT8 artifact
    pub fn sidecar_path(artifact: &Path) -> PathBuf {
        let mut name = artifact.as_os_str().to_owned();
        name.push(".calib.json");
        PathBuf::from(name)
    }

    pub fn write_sidecar(&self, artifact: &Path) -> Result<(), InferenceError> {
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| InferenceError::Io(std::io::Error::other(e)))?;
        std::fs::write(Self::sidecar_path(artifact), json)?;
        Ok(())
    }
}
