//! Dynamically batched inference engine
//!
//! Submissions are preprocessed on the caller's thread and queued; a single worker
//! thread per engine (bound to one device) drains the queue greedily into batches,
//! executes each batch with one accelerator call and resolves every request's future.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread::JoinHandle;
use std::time::Instant;

use ndarray::{ArrayD, ArrayViewD, Axis};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::cache::ModelCacheEntry;
use crate::runtime::{stack_tensors, Accelerator, EngineHandle};
use crate::task::InferenceTask;
use crate::InferenceError;

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Name used in logs, thread names and metric labels
    pub name: String,
    /// Device the worker is pinned to for the engine's lifetime
    pub device_id: usize,
    /// Batch ceiling (further capped by what the loaded engine supports)
    pub max_batch_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: "engine".to_string(),
            device_id: 0,
            max_batch_size: 16,
        }
    }
}

/// Result of one submitted request.
///
/// Await it from async code or call [`InferFuture::wait`] from a plain thread.
#[must_use = "dropping the future discards the result"]
pub struct InferFuture<R> {
    rx: oneshot::Receiver<Result<R, InferenceError>>,
}

impl<R> InferFuture<R> {
    fn ready(result: Result<R, InferenceError>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { rx }
    }

    /// Block the current thread until the result is available.
    ///
    /// Must not be called from within an async runtime; `.await` the future there.
    pub fn wait(self) -> Result<R, InferenceError> {
        self.rx
            .blocking_recv()
            .unwrap_or(Err(InferenceError::EngineShutdown))
    }

    /// Non-blocking poll; `None` while the request is still pending
    pub fn try_take(&mut self) -> Option<Result<R, InferenceError>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(InferenceError::EngineShutdown)),
        }
    }
}

impl<R> Future for InferFuture<R> {
    type Output = Result<R, InferenceError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().rx)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(InferenceError::EngineShutdown)))
    }
}

/// Snapshot of engine instrumentation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    /// Requests accepted into the queue
    pub requests: u64,
    /// Batches dispatched to the accelerator
    pub batches: u64,
    /// Batches that failed as a whole
    pub failed_batches: u64,
    pub largest_batch: usize,
}

#[derive(Default)]
struct StatsCounters {
    requests: AtomicU64,
    batches: AtomicU64,
    failed_batches: AtomicU64,
    largest_batch: AtomicUsize,
}

impl StatsCounters {
    fn snapshot(&self) -> EngineStats {
        EngineStats {
            requests: self.requests.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            failed_batches: self.failed_batches.load(Ordering::Relaxed),
            largest_batch: self.largest_batch.load(Ordering::Relaxed),
        }
    }
}

struct InferenceRequest<T: InferenceTask> {
    input: T::Input,
    tensor: ArrayD<f32>,
    promise: oneshot::Sender<Result<T::Output, InferenceError>>,
    enqueue_time: Instant,
}

/// Requests executed together in one accelerator call, in slot order
struct BatchJob<T: InferenceTask> {
    requests: Vec<InferenceRequest<T>>,
}

impl<T: InferenceTask> BatchJob<T> {
    fn len(&self) -> usize {
        self.requests.len()
    }

    fn tensor(&self) -> Result<ArrayD<f32>, InferenceError> {
        stack_tensors(self.requests.iter().map(|r| r.tensor.view()))
    }

    /// Resolve every request with an error built by `make_error`
    fn fail(self, make_error: impl Fn() -> InferenceError) {
        for request in self.requests {
            let _ = request.promise.send(Err(make_error()));
        }
    }

    /// Post-process each slot and resolve its request
    fn distribute(self, task: &T, outputs: &[ArrayD<f32>]) {
        for (slot, request) in self.requests.into_iter().enumerate() {
            let views: Vec<ArrayViewD<'_, f32>> =
                outputs.iter().map(|o| o.index_axis(Axis(0), slot)).collect();
            let result = task.postprocess(&request.input, &views);
            if let Err(e) = &result {
                debug!("Slot {} post-processing failed: {}", slot, e);
            }
            let _ = request.promise.send(result);
        }
    }
}

struct Shared<T: InferenceTask> {
    task: T,
    handle: Arc<dyn EngineHandle>,
    queue: crate::batcher::PendingQueue<InferenceRequest<T>>,
    stats: StatsCounters,
    name: String,
    device_id: usize,
    max_batch_size: usize,
}

impl<T: InferenceTask> Shared<T> {
    fn run(&self) {
        info!(
            "Engine worker '{}' started on device {} (max_batch={})",
            self.name, self.device_id, self.max_batch_size
        );
        while let Some(requests) = self.queue.next_batch(self.max_batch_size) {
            self.dispatch(BatchJob { requests });
        }
        info!("Engine worker '{}' stopped", self.name);
    }

    fn dispatch(&self, job: BatchJob<T>) {
        let size = job.len();
        let dispatched = Instant::now();
        self.stats.batches.fetch_add(1, Ordering::Relaxed);
        self.stats.largest_batch.fetch_max(size, Ordering::Relaxed);
        metrics::counter!("inference_batches_total", "engine" => self.name.clone()).increment(1);
        metrics::histogram!("inference_batch_size", "engine" => self.name.clone()).record(size as f64);
        for request in &job.requests {
            let waited = dispatched.duration_since(request.enqueue_time);
            metrics::histogram!("inference_queue_wait_seconds", "engine" => self.name.clone())
                .record(waited.as_secs_f64());
        }

        let outcome = job.tensor().and_then(|batch| self.handle.execute(batch));
        let outputs = match outcome {
            Ok(outputs) => outputs,
            Err(e) => {
                let device_fault = matches!(e, InferenceError::Device(_));
                warn!("Engine '{}': batch of {} failed: {}", self.name, size, e);
                self.record_failure();
                let reason = e.to_string();
                job.fail(|| InferenceError::BatchFailed {
                    batch_size: size,
                    device_fault,
                    reason: reason.clone(),
                });
                return;
            }
        };

        if let Some(bad) = outputs.iter().find(|o| o.shape().first() != Some(&size)) {
            let reason = format!("output shape {:?} does not match batch of {}", bad.shape(), size);
            error!("Engine '{}': {}", self.name, reason);
            self.record_failure();
            job.fail(|| InferenceError::BatchFailed {
                batch_size: size,
                device_fault: false,
                reason: reason.clone(),
            });
            return;
        }

        if self.queue.is_closed() {
            job.fail(|| InferenceError::EngineShutdown);
            return;
        }

        job.distribute(&self.task, &outputs);
        debug!(
            "Engine '{}': batch of {} done in {:.2}ms",
            self.name,
            size,
            dispatched.elapsed().as_secs_f64() * 1000.0
        );
    }

    fn record_failure(&self) {
        self.stats.failed_batches.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("inference_batch_failures_total", "engine" => self.name.clone()).increment(1);
    }
}

/// One compiled engine serving concurrent submissions
pub struct InferenceEngine<T: InferenceTask> {
    shared: Arc<Shared<T>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<T: InferenceTask> InferenceEngine<T> {
    /// Start an engine around an already loaded handle
    pub fn new(
        task: T,
        handle: Arc<dyn EngineHandle>,
        config: EngineConfig,
    ) -> Result<Self, InferenceError> {
        let max_batch_size = config.max_batch_size.min(handle.max_batch_size());
        if max_batch_size == 0 {
            return Err(InferenceError::Device(format!(
                "engine '{}' supports no batch slots",
                config.name
            )));
        }

        let shared = Arc::new(Shared {
            task,
            handle,
            queue: crate::batcher::PendingQueue::new(),
            stats: StatsCounters::default(),
            name: config.name.clone(),
            device_id: config.device_id,
            max_batch_size,
        });

        let worker = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name(format!("infer-{}-dev{}", config.name, config.device_id))
                .spawn(move || shared.run())?
        };

        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Load a compiled artifact onto `config.device_id` and start serving it
    pub fn load(
        task: T,
        accelerator: &dyn Accelerator,
        entry: &ModelCacheEntry,
        mut config: EngineConfig,
    ) -> Result<Self, InferenceError> {
        let handle = accelerator.load(entry, config.device_id)?;
        config.max_batch_size = config.max_batch_size.min(entry.max_batch_size);
        Self::new(task, handle, config)
    }

    /// Submit one input. Never blocks on execution.
    pub fn commit(&self, input: T::Input) -> InferFuture<T::Output> {
        let (future, request) = match self.prepare(input) {
            Ok(prepared) => prepared,
            Err(e) => return InferFuture::ready(Err(e)),
        };
        if let Err(rejected) = self.shared.queue.push(request) {
            let _ = rejected.promise.send(Err(InferenceError::EngineShutdown));
        } else {
            self.shared.stats.requests.fetch_add(1, Ordering::Relaxed);
        }
        future
    }

    /// Submit several inputs. Futures are returned in input order, one per input,
    /// independent of how the worker groups them into batches.
    pub fn commits(&self, inputs: impl IntoIterator<Item = T::Input>) -> Vec<InferFuture<T::Output>> {
        let mut futures = Vec::new();
        let mut requests = Vec::new();
        for input in inputs {
            match self.prepare(input) {
                Ok((future, request)) => {
                    futures.push(future);
                    requests.push(request);
                }
                Err(e) => futures.push(InferFuture::ready(Err(e))),
            }
        }

        let accepted = requests.len() as u64;
        match self.shared.queue.push_all(requests) {
            Ok(()) => {
                self.shared.stats.requests.fetch_add(accepted, Ordering::Relaxed);
            }
            Err(rejected) => {
                for request in rejected {
                    let _ = request.promise.send(Err(InferenceError::EngineShutdown));
                }
            }
        }
        futures
    }

    fn prepare(
        &self,
        input: T::Input,
    ) -> Result<(InferFuture<T::Output>, InferenceRequest<T>), InferenceError> {
        if self.shared.queue.is_closed() {
            return Err(InferenceError::EngineShutdown);
        }
        let tensor = self.shared.task.preprocess(&input)?;
        let (promise, rx) = oneshot::channel();
        Ok((
            InferFuture { rx },
            InferenceRequest {
                input,
                tensor,
                promise,
                enqueue_time: Instant::now(),
            },
        ))
    }

    /// Reject new submissions, fail queued and in-flight requests with
    /// [`InferenceError::EngineShutdown`] and join the worker.
    pub fn shutdown(&self) {
        let pending = self.shared.queue.close();
        if !pending.is_empty() {
            warn!(
                "Engine '{}' shutting down with {} queued requests",
                self.shared.name,
                pending.len()
            );
        }
        for request in pending {
            let _ = request.promise.send(Err(InferenceError::EngineShutdown));
        }

        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                error!("Engine '{}' worker panicked", self.shared.name);
            }
        }
    }

    pub fn stats(&self) -> EngineStats {
        self.shared.stats.snapshot()
    }

    /// Requests waiting for a batch slot
    pub fn pending(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn device_id(&self) -> usize {
        self.shared.device_id
    }

    pub fn max_batch_size(&self) -> usize {
        self.shared.max_batch_size
    }

    pub fn task(&self) -> &T {
        &self.shared.task
    }
}

impl<T: InferenceTask> Drop for InferenceEngine<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
