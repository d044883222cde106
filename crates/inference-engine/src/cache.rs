//! Compiled engine cache
//!
//! Maps `(logical name, precision)` to an artifact on disk and compiles on miss.
//! A present artifact is trusted as-is: there is no staleness check against the
//! source model. Use [`ModelCache::evict`] to force a rebuild.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::calibration::{CalibrationFeed, CalibrationStats};
use crate::precision::Precision;
use crate::runtime::{CompileRequest, ModelCompiler};
use crate::InferenceError;

/// Default number of calibration samples drawn for INT8 builds
pub const DEFAULT_CALIBRATION_SAMPLES: usize = 512;

/// A resolved (and possibly freshly compiled) model
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelCacheEntry {
    pub logical_name: String,
    pub precision: Precision,
    /// Batch ceiling requested by the caller
    pub max_batch_size: usize,
    pub source_path: PathBuf,
    pub compiled_path: PathBuf,
}

/// Existence-keyed cache of compiled engines
pub struct ModelCache {
    model_dir: PathBuf,
    cache_dir: PathBuf,
    compiler: Arc<dyn ModelCompiler>,
    calibration_samples: usize,
    /// Serializes builds so one key is never compiled twice concurrently
    build_lock: Mutex<()>,
}

impl ModelCache {
    /// Sources are read from `model_dir/<name>.onnx`, artifacts live in `cache_dir`
    pub fn new(
        model_dir: impl Into<PathBuf>,
        cache_dir: impl Into<PathBuf>,
        compiler: Arc<dyn ModelCompiler>,
    ) -> Self {
        Self {
            model_dir: model_dir.into(),
            cache_dir: cache_dir.into(),
            compiler,
            calibration_samples: DEFAULT_CALIBRATION_SAMPLES,
            build_lock: Mutex::new(()),
        }
    }

    /// Override how many samples INT8 calibration consumes
    pub fn with_calibration_samples(mut self, samples: usize) -> Self {
        self.calibration_samples = samples.max(1);
        self
    }

    pub fn source_path(&self, name: &str) -> PathBuf {
        self.model_dir.join(format!("{name}.onnx"))
    }

    pub fn artifact_path(&self, name: &str, precision: Precision) -> PathBuf {
        self.cache_dir.join(format!("{name}.{precision}.engine"))
    }

    pub fn is_cached(&self, name: &str, precision: Precision) -> bool {
        self.artifact_path(name, precision).is_file()
    }

    /// Return the compiled artifact for `(name, precision)`, compiling it if absent.
    ///
    /// INT8 builds require `calibration`. The compiler writes to a temporary file in
    /// the cache directory which is renamed into place only on success.
    pub fn resolve_or_build(
        &self,
        name: &str,
        precision: Precision,
        max_batch_size: usize,
        calibration: Option<&mut dyn CalibrationFeed>,
    ) -> Result<ModelCacheEntry, InferenceError> {
        let entry = ModelCacheEntry {
            logical_name: name.to_string(),
            precision,
            max_batch_size,
            source_path: self.source_path(name),
            compiled_path: self.artifact_path(name, precision),
        };

        let _guard = self.build_lock.lock();

        if entry.compiled_path.is_file() {
            debug!("Using cached engine {}", entry.compiled_path.display());
            return Ok(entry);
        }

        if max_batch_size == 0 {
            return Err(InferenceError::compilation(name, "max batch size must be at least 1"));
        }
        if !entry.source_path.is_file() {
            return Err(InferenceError::compilation(
                name,
                format!("source model {} not found", entry.source_path.display()),
            ));
        }
        if precision.requires_calibration() && calibration.is_none() {
            return Err(InferenceError::compilation(
                name,
                format!("{precision} build requires a calibration feed"),
            ));
        }

        std::fs::create_dir_all(&self.cache_dir)?;
        let partial = tempfile::Builder::new()
            .prefix(&format!(".{name}.{precision}."))
            .suffix(".partial")
            .tempfile_in(&self.cache_dir)?;

        info!(
            "Compiling {} [{}] max_batch={} from {}",
            name,
            precision,
            max_batch_size,
            entry.source_path.display()
        );
        let started = Instant::now();
        let request = CompileRequest {
            model: name,
            precision,
            max_batch_size,
            source: &entry.source_path,
            output: partial.path(),
            calibration_samples: self.calibration_samples,
        };

        // `partial` is removed on drop if anything below fails
        let report = self.compiler.compile(&request, calibration)?;

        if std::fs::metadata(partial.path())?.len() == 0 {
            return Err(InferenceError::compilation(name, "compiler produced an empty artifact"));
        }
        if let Some(stats) = &report.calibration {
            stats.write_sidecar(&entry.compiled_path)?;
        }
        partial
            .persist(&entry.compiled_path)
            .map_err(|e| InferenceError::Io(e.error))?;

        info!(
            "Compiled {} in {:.1}s -> {}",
            name,
            started.elapsed().as_secs_f32(),
            entry.compiled_path.display()
        );
        Ok(entry)
    }

    /// Remove a compiled artifact (and its calibration sidecar). Returns whether one existed.
    pub fn evict(&self, name: &str, precision: Precision) -> Result<bool, InferenceError> {
        let _guard = self.build_lock.lock();
        let artifact = self.artifact_path(name, precision);
        remove_if_present(&CalibrationStats::sidecar_path(&artifact))?;
        let removed = remove_if_present(&artifact)?;
        if removed {
            warn!("Evicted cached engine {}", artifact.display());
        }
        Ok(removed)
    }
}

fn remove_if_present(path: &Path) -> Result<bool, InferenceError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::TensorCalibrationFeed;
    use crate::mock::{MockCompiler, MockFailure};
    use crate::runtime::CompileReport;
    use ndarray::{ArrayD, IxDyn};

    fn setup() -> (tempfile::TempDir, Arc<MockCompiler>, ModelCache) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("plate_detect.onnx"), b"onnx").unwrap();
        let compiler = Arc::new(MockCompiler::new());
        let cache = ModelCache::new(dir.path(), dir.path().join("cache"), compiler.clone());
        (dir, compiler, cache)
    }

    fn cache_files(dir: &Path) -> Vec<String> {
        let mut names: Vec<_> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_miss_compiles_once_then_hits() {
        let (_dir, compiler, cache) = setup();

        let first = cache
            .resolve_or_build("plate_detect", Precision::Fp16, 16, None)
            .unwrap();
        let second = cache
            .resolve_or_build("plate_detect", Precision::Fp16, 16, None)
            .unwrap();

        assert_eq!(compiler.compile_count(), 1);
        assert_eq!(first.compiled_path, second.compiled_path);
        assert!(first.compiled_path.ends_with("plate_detect.fp16.engine"));
        assert!(cache.is_cached("plate_detect", Precision::Fp16));
    }

    #[test]
    fn test_existing_artifact_never_compiles() {
        let (dir, compiler, cache) = setup();
        std::fs::create_dir_all(dir.path().join("cache")).unwrap();
        std::fs::write(cache.artifact_path("plate_rec", Precision::Fp32), b"prebuilt").unwrap();

        // No source model exists for plate_rec: presence of the artifact is enough
        let entry = cache
            .resolve_or_build("plate_rec", Precision::Fp32, 16, None)
            .unwrap();

        assert_eq!(compiler.compile_count(), 0);
        assert_eq!(std::fs::read(entry.compiled_path).unwrap(), b"prebuilt");
    }

    #[test]
    fn test_failed_build_leaves_no_artifact() {
        let (dir, compiler, cache) = setup();
        compiler.fail_with(MockFailure::Reject("unsupported op GridSample".into()));

        let err = cache
            .resolve_or_build("plate_detect", Precision::Fp16, 16, None)
            .unwrap_err();

        assert!(matches!(err, InferenceError::Compilation { .. }));
        assert!(cache_files(&dir.path().join("cache")).is_empty());
    }

    /// Writes part of an artifact, then gives up
    struct PartialWriteCompiler;

    impl ModelCompiler for PartialWriteCompiler {
        fn compile(
            &self,
            request: &CompileRequest<'_>,
            _calibration: Option<&mut dyn CalibrationFeed>,
        ) -> Result<CompileReport, InferenceError> {
            std::fs::write(request.output, b"half an engine")?;
            Err(InferenceError::compilation(request.model, "builder ran out of workspace"))
        }
    }

    #[test]
    fn test_partial_output_is_discarded_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("plate_detect.onnx"), b"onnx").unwrap();
        let cache = ModelCache::new(dir.path(), dir.path().join("cache"), Arc::new(PartialWriteCompiler));

        let err = cache
            .resolve_or_build("plate_detect", Precision::Fp16, 16, None)
            .unwrap_err();

        assert!(matches!(err, InferenceError::Compilation { .. }));
        assert!(cache_files(&dir.path().join("cache")).is_empty());
        assert!(!cache.is_cached("plate_detect", Precision::Fp16));
    }

    #[test]
    fn test_concurrent_resolves_compile_once() {
        let (_dir, compiler, cache) = setup();
        let barrier = std::sync::Barrier::new(8);

        let paths: Vec<PathBuf> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        cache
                            .resolve_or_build("plate_detect", Precision::Fp16, 16, None)
                            .unwrap()
                            .compiled_path
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        assert_eq!(compiler.compile_count(), 1);
        assert!(paths.windows(2).all(|pair| pair[0] == pair[1]));
    }

    #[test]
    fn test_device_unavailable() {
        let (_dir, compiler, cache) = setup();
        compiler.fail_with(MockFailure::NoDevice);

        let err = cache
            .resolve_or_build("plate_detect", Precision::Fp16, 16, None)
            .unwrap_err();
        assert!(matches!(err, InferenceError::Device(_)));
    }

    #[test]
    fn test_missing_source_is_compilation_error() {
        let (_dir, compiler, cache) = setup();
        let err = cache
            .resolve_or_build("unknown", Precision::Fp32, 8, None)
            .unwrap_err();

        assert!(matches!(err, InferenceError::Compilation { .. }));
        assert_eq!(compiler.compile_count(), 0);
    }

    #[test]
    fn test_int8_requires_and_records_calibration() {
        let (dir, compiler, cache) = setup();
        let cache = cache.with_calibration_samples(4);

        assert!(cache
            .resolve_or_build("plate_detect", Precision::Int8, 16, None)
            .is_err());

        let samples = (0..6)
            .map(|i| ArrayD::from_elem(IxDyn(&[3, 4, 4]), i as f32 / 10.0))
            .collect();
        let mut feed = TensorCalibrationFeed::new(samples);
        let entry = cache
            .resolve_or_build("plate_detect", Precision::Int8, 16, Some(&mut feed))
            .unwrap();

        assert_eq!(compiler.compile_count(), 1);
        assert_eq!(
            cache_files(&dir.path().join("cache")),
            vec!["plate_detect.int8.engine", "plate_detect.int8.engine.calib.json"]
        );
        let sidecar = std::fs::read(CalibrationStats::sidecar_path(&entry.compiled_path)).unwrap();
        let stats: CalibrationStats = serde_json::from_slice(&sidecar).unwrap();
        assert_eq!(stats.samples, 4);
    }

    #[test]
    fn test_evict_forces_rebuild() {
        let (_dir, compiler, cache) = setup();
        cache
            .resolve_or_build("plate_detect", Precision::Fp16, 16, None)
            .unwrap();

        assert!(cache.evict("plate_detect", Precision::Fp16).unwrap());
        assert!(!cache.evict("plate_detect", Precision::Fp16).unwrap());

        cache
            .resolve_or_build("plate_detect", Precision::Fp16, 16, None)
            .unwrap();
        assert_eq!(compiler.compile_count(), 2);
    }
}
