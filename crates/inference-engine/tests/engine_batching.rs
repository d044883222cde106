//! End-to-end behavior of the batched engine over the mock accelerator

use std::sync::Arc;
use std::time::Duration;

use inference_engine::mock::{MockAccelerator, MockCompiler, MockHandle};
use inference_engine::{
    EngineConfig, FailureStage, InferenceEngine, InferenceError, InferenceTask, ModelCache,
    Precision,
};
use ndarray::{ArrayD, ArrayViewD, IxDyn};
use proptest::prelude::*;

/// Echoes the mean of a constant-filled input back
struct MeanTask;

impl InferenceTask for MeanTask {
    type Input = f32;
    type Output = f32;

    fn preprocess(&self, input: &f32) -> Result<ArrayD<f32>, InferenceError> {
        Ok(ArrayD::from_elem(IxDyn(&[3, 4]), *input))
    }

    fn postprocess(
        &self,
        _input: &f32,
        outputs: &[ArrayViewD<'_, f32>],
    ) -> Result<f32, InferenceError> {
        Ok(outputs[0][[1]])
    }
}

fn engine_with(handle: Arc<MockHandle>, max_batch: usize) -> InferenceEngine<MeanTask> {
    let config = EngineConfig {
        name: "mean".into(),
        device_id: 0,
        max_batch_size: max_batch,
    };
    InferenceEngine::new(MeanTask, handle, config).unwrap()
}

#[test]
fn commits_preserve_order_across_batches() {
    let handle = Arc::new(MockHandle::new(8).with_delay(Duration::from_millis(1)));
    let engine = engine_with(handle.clone(), 8);

    let inputs: Vec<f32> = (0..100).map(|i| i as f32).collect();
    let results: Vec<f32> = engine
        .commits(inputs.clone())
        .into_iter()
        .map(|f| f.wait().unwrap())
        .collect();

    assert_eq!(results, inputs);
    assert!(handle.batch_sizes().iter().all(|&n| n <= 8));
    assert_eq!(handle.batch_sizes().iter().sum::<usize>(), 100);
}

#[test]
fn poisoned_batch_fails_entirely_and_engine_recovers() {
    let handle = Arc::new(MockHandle::new(4));
    let engine = engine_with(handle.clone(), 4);

    let before: Vec<_> = engine.commits(vec![1.0, 2.0, 3.0, 4.0]);
    let before: Vec<_> = before.into_iter().map(|f| f.wait()).collect();
    assert!(before.iter().all(|r| r.is_ok()));

    let poisoned: Vec<_> = engine
        .commits(vec![1.0, 2.0, f32::NAN, 4.0])
        .into_iter()
        .map(|f| f.wait())
        .collect();
    assert_eq!(poisoned.len(), 4);
    for result in &poisoned {
        let err = result.as_ref().unwrap_err();
        assert!(matches!(err, InferenceError::BatchFailed { batch_size: 4, .. }));
        assert_eq!(err.stage(), FailureStage::Device);
    }

    let after: Vec<_> = engine
        .commits(vec![5.0, 6.0])
        .into_iter()
        .map(|f| f.wait().unwrap())
        .collect();
    assert_eq!(after, vec![5.0, 6.0]);
    assert_eq!(handle.batch_sizes(), vec![4, 4, 2]);
    assert_eq!(engine.stats().failed_batches, 1);
}

#[test]
fn concurrent_submitters_each_get_their_results() {
    let handle = Arc::new(MockHandle::new(16).with_delay(Duration::from_millis(2)));
    let engine = Arc::new(engine_with(handle.clone(), 16));

    let submitters: Vec<_> = (0..4)
        .map(|t| {
            let engine = engine.clone();
            std::thread::spawn(move || {
                (0..25)
                    .map(|i| {
                        let value = (t * 100 + i) as f32;
                        (value, engine.commit(value))
                    })
                    .collect::<Vec<_>>()
                    .into_iter()
                    .all(|(value, f)| f.wait().unwrap() == value)
            })
        })
        .collect();

    for s in submitters {
        assert!(s.join().unwrap());
    }
    assert_eq!(engine.stats().requests, 100);
    assert!(handle.batch_sizes().len() < 100, "some requests should share a batch");
}

#[test]
fn dropping_engine_resolves_outstanding_futures() {
    let handle = Arc::new(MockHandle::new(2));
    handle.pause();
    let engine = engine_with(handle.clone(), 2);

    let futures = engine.commits(vec![1.0, 2.0, 3.0, 4.0, 5.0]);
    while handle.batch_sizes().is_empty() {
        std::thread::sleep(Duration::from_millis(1));
    }

    let resumer = {
        let handle = handle.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            handle.resume();
        })
    };
    drop(engine);
    resumer.join().unwrap();

    for f in futures {
        assert!(matches!(f.wait(), Err(InferenceError::EngineShutdown)));
    }
}

#[test]
fn cache_to_engine_on_selected_device() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("plate_detect.onnx"), b"onnx").unwrap();
    let compiler = Arc::new(MockCompiler::new());
    let cache = ModelCache::new(dir.path(), dir.path().join("cache"), compiler.clone());
    let accelerator = MockAccelerator::new(2);

    let entry = cache
        .resolve_or_build("plate_detect", Precision::Fp16, 16, None)
        .unwrap();
    let config = EngineConfig {
        name: "plate".into(),
        device_id: 1,
        max_batch_size: 32,
    };
    let engine = InferenceEngine::load(MeanTask, &accelerator, &entry, config).unwrap();

    assert_eq!(engine.device_id(), 1);
    assert_eq!(engine.max_batch_size(), 16);
    assert_eq!(engine.commit(2.5).wait().unwrap(), 2.5);

    let missing = EngineConfig {
        device_id: 2,
        ..EngineConfig::default()
    };
    assert!(matches!(
        InferenceEngine::load(MeanTask, &accelerator, &entry, missing),
        Err(InferenceError::Device(_))
    ));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn order_holds_for_any_batch_ceiling(max_batch in 1usize..20, count in 0usize..60) {
        let handle = Arc::new(MockHandle::new(max_batch));
        let engine = engine_with(handle.clone(), max_batch);

        let inputs: Vec<f32> = (0..count).map(|i| i as f32 * 0.5).collect();
        let results: Vec<f32> = engine
            .commits(inputs.clone())
            .into_iter()
            .map(|f| f.wait().unwrap())
            .collect();

        prop_assert_eq!(results, inputs);
        let expected_batches = (count + max_batch - 1) / max_batch;
        prop_assert_eq!(handle.batch_sizes().len(), expected_batches);
    }
}
