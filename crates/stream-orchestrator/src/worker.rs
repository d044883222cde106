//! One worker thread per media source

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use inference_engine::{InferFuture, InferenceEngine, InferenceError, InferenceTask};
use media_source::{FrameContext, FrameSource, SourceError, SourceOpener, VideoFrame};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::state::{AtomicStreamState, StreamState};
use crate::StreamError;

/// Receives every streamed result, on the stream's worker thread
pub type ResultCallback<R> =
    Arc<dyn Fn(&str, &FrameContext, Result<R, InferenceError>) + Send + Sync>;

/// Per-stream settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// How long `start` waits for the source to open
    pub startup_timeout_ms: u64,
    /// Submitted frames awaiting a result before the worker blocks
    pub inflight_depth: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            startup_timeout_ms: 5000,
            inflight_depth: 4,
        }
    }
}

impl StreamConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }
}

/// Frame and result counters of one session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub frames: u64,
    pub results: u64,
    pub errors: u64,
}

/// Shared view of one managed source
#[derive(Debug)]
pub struct StreamSession {
    pub id: Uuid,
    pub uri: String,
    running: AtomicBool,
    state: AtomicStreamState,
    frames: AtomicU64,
    results: AtomicU64,
    errors: AtomicU64,
}

impl StreamSession {
    fn new(uri: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            uri: uri.to_string(),
            running: AtomicBool::new(false),
            state: AtomicStreamState::new(StreamState::Created),
            frames: AtomicU64::new(0),
            results: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> StreamState {
        self.state.load()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            frames: self.frames.load(Ordering::Relaxed),
            results: self.results.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

struct Pending<R> {
    context: FrameContext,
    future: InferFuture<R>,
}

/// Marks the session failed if the worker thread unwinds
struct PanicGuard<'a> {
    session: &'a StreamSession,
}

impl Drop for PanicGuard<'_> {
    fn drop(&mut self) {
        if !thread::panicking() {
            return;
        }
        self.session.running.store(false, Ordering::SeqCst);
        let state = &self.session.state;
        if state.transition(StreamState::Running, StreamState::Failed)
            || state.transition(StreamState::Starting, StreamState::Failed)
        {
            metrics::counter!("stream_failures_total").increment(1);
        }
        error!("Stream {} worker panicked", self.session.uri);
    }
}

/// State moved onto the worker thread
struct StreamRunner<T: InferenceTask<Input = Arc<VideoFrame>>> {
    session: Arc<StreamSession>,
    engine: Arc<InferenceEngine<T>>,
    opener: Arc<dyn SourceOpener>,
    callback: Option<ResultCallback<T::Output>>,
    inflight_depth: usize,
}

impl<T: InferenceTask<Input = Arc<VideoFrame>>> StreamRunner<T> {
    fn run(self, ready: Sender<Result<(), SourceError>>) {
        let _guard = PanicGuard {
            session: &self.session,
        };
        let uri = self.session.uri.clone();
        let mut source = match self.opener.open(&uri) {
            Ok(source) => source,
            Err(e) => {
                warn!("Stream {} failed to open: {}", uri, e);
                self.session.state.transition(StreamState::Starting, StreamState::Failed);
                let _ = ready.send(Err(e));
                return;
            }
        };

        // Lost the race against a startup timeout or stop
        if !self.session.state.transition(StreamState::Starting, StreamState::Running) {
            debug!("Stream {} abandoned during startup", uri);
            return;
        }
        let _ = ready.send(Ok(()));
        drop(ready);

        info!("Stream {} running on engine '{}'", uri, self.engine.name());
        self.pump(source.as_mut());
    }

    fn pump(&self, source: &mut dyn FrameSource) {
        let depth = self.inflight_depth.max(1);
        let mut inflight: VecDeque<Pending<T::Output>> = VecDeque::with_capacity(depth);

        while self.session.is_running() {
            match source.next_frame() {
                Ok(Some(frame)) => {
                    self.session.frames.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("stream_frames_total").increment(1);

                    let context = frame.context();
                    let future = self.engine.commit(Arc::new(frame));
                    inflight.push_back(Pending { context, future });

                    self.deliver_ready(&mut inflight);
                    if inflight.len() >= depth {
                        if let Some(oldest) = inflight.pop_front() {
                            self.deliver(&oldest.context, oldest.future.wait());
                        }
                    }
                }
                Ok(None) => {
                    self.drain(&mut inflight);
                    if self.session.state.transition(StreamState::Running, StreamState::Stopped) {
                        info!(
                            "Stream {} reached end of stream after {} frames",
                            self.session.uri,
                            self.session.stats().frames
                        );
                    }
                    return;
                }
                Err(e) => {
                    self.drain(&mut inflight);
                    if self.session.state.transition(StreamState::Running, StreamState::Failed) {
                        error!("Stream {} failed: {}", self.session.uri, e);
                        metrics::counter!("stream_failures_total").increment(1);
                    }
                    return;
                }
            }
        }
    }

    /// Wait for and deliver everything still in flight, unless stopped
    fn drain(&self, inflight: &mut VecDeque<Pending<T::Output>>) {
        while let Some(pending) = inflight.pop_front() {
            if !self.session.is_running() {
                break;
            }
            self.deliver(&pending.context, pending.future.wait());
        }
    }

    /// Deliver completed results at the head of the window, in frame order
    fn deliver_ready(&self, inflight: &mut VecDeque<Pending<T::Output>>) {
        while let Some(front) = inflight.front_mut() {
            let Some(result) = front.future.try_take() else {
                break;
            };
            let context = front.context;
            inflight.pop_front();
            self.deliver(&context, result);
        }
    }

    fn deliver(&self, context: &FrameContext, result: Result<T::Output, InferenceError>) {
        if !self.session.is_running() {
            return;
        }
        match &result {
            Ok(_) => {
                self.session.results.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.session.errors.fetch_add(1, Ordering::Relaxed);
                debug!("Stream {} frame {}: {}", self.session.uri, context.sequence, e);
            }
        }
        if let Some(callback) = &self.callback {
            callback(&self.session.uri, context, result);
        }
    }
}

/// Owns the decode + infer loop of one source
pub struct StreamWorker<T: InferenceTask<Input = Arc<VideoFrame>>> {
    session: Arc<StreamSession>,
    engine: Arc<InferenceEngine<T>>,
    opener: Arc<dyn SourceOpener>,
    callback: Option<ResultCallback<T::Output>>,
    config: StreamConfig,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl<T: InferenceTask<Input = Arc<VideoFrame>>> StreamWorker<T> {
    pub fn new(
        uri: &str,
        engine: Arc<InferenceEngine<T>>,
        opener: Arc<dyn SourceOpener>,
        callback: Option<ResultCallback<T::Output>>,
        config: StreamConfig,
    ) -> Self {
        Self {
            session: Arc::new(StreamSession::new(uri)),
            engine,
            opener,
            callback,
            config,
            thread: Mutex::new(None),
        }
    }

    pub fn session(&self) -> &Arc<StreamSession> {
        &self.session
    }

    pub fn state(&self) -> StreamState {
        self.session.state()
    }

    pub fn uri(&self) -> &str {
        &self.session.uri
    }

    pub fn engine(&self) -> &Arc<InferenceEngine<T>> {
        &self.engine
    }

    /// Spawn the worker and block until the source reports whether it opened.
    ///
    /// A source that does not answer within the startup timeout counts as failed;
    /// its thread is detached and exits once the open call returns.
    pub fn start(&self) -> Result<(), StreamError> {
        let uri = self.session.uri.clone();
        if !self.session.state.transition(StreamState::Created, StreamState::Starting) {
            return Err(StreamError::DuplicateSource(uri));
        }
        self.session.running.store(true, Ordering::SeqCst);

        let (ready_tx, ready_rx) = channel::bounded(1);
        let runner = StreamRunner {
            session: self.session.clone(),
            engine: self.engine.clone(),
            opener: self.opener.clone(),
            callback: self.callback.clone(),
            inflight_depth: self.config.inflight_depth,
        };
        let short_id: String = self.session.id.simple().to_string().chars().take(8).collect();
        let spawned = thread::Builder::new()
            .name(format!("stream-{short_id}"))
            .spawn(move || runner.run(ready_tx));
        match spawned {
            Ok(handle) => *self.thread.lock() = Some(handle),
            Err(e) => {
                self.fail_start();
                return Err(StreamError::SourceUnavailable {
                    uri,
                    reason: format!("cannot spawn worker: {e}"),
                });
            }
        }

        let reason = match ready_rx.recv_timeout(self.config.startup_timeout()) {
            Ok(Ok(())) => {
                info!("Stream {} started (session {})", uri, self.session.id);
                return Ok(());
            }
            Ok(Err(e)) => {
                self.join();
                e.to_string()
            }
            Err(RecvTimeoutError::Timeout) => {
                drop(self.thread.lock().take());
                format!(
                    "no answer within {}ms",
                    self.config.startup_timeout().as_millis()
                )
            }
            Err(RecvTimeoutError::Disconnected) => {
                self.join();
                "worker exited during startup".to_string()
            }
        };

        self.fail_start();
        warn!("Stream {} refused: {}", uri, reason);
        Err(StreamError::SourceUnavailable { uri, reason })
    }

    fn fail_start(&self) {
        self.session.running.store(false, Ordering::SeqCst);
        self.session.state.store(StreamState::Failed);
    }

    /// Stop the loop and join the worker. No callback runs after this returns.
    pub fn stop(&self) {
        let state = &self.session.state;
        let was_active = state.transition(StreamState::Running, StreamState::Stopping)
            || state.transition(StreamState::Starting, StreamState::Stopping);
        self.session.running.store(false, Ordering::SeqCst);
        self.join();

        if was_active {
            state.store(StreamState::Stopped);
            info!("Stream {} stopped", self.session.uri);
        } else {
            state.transition(StreamState::Created, StreamState::Stopped);
        }
    }

    fn join(&self) {
        let Some(handle) = self.thread.lock().take() else {
            return;
        };
        // Stopped from inside its own callback: the loop exits on its own
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            error!("Stream {} worker panicked", self.session.uri);
        }
    }
}

impl<T: InferenceTask<Input = Arc<VideoFrame>>> Drop for StreamWorker<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inference_engine::mock::MockHandle;
    use inference_engine::EngineConfig;
    use media_source::StandardOpener;
    use ndarray::{ArrayD, ArrayViewD};
    use std::time::Instant;

    struct FrameMean;

    impl InferenceTask for FrameMean {
        type Input = Arc<VideoFrame>;
        type Output = f32;

        fn preprocess(&self, frame: &Arc<VideoFrame>) -> Result<ArrayD<f32>, InferenceError> {
            Ok(frame.to_chw_tensor().into_dyn())
        }

        fn postprocess(
            &self,
            _frame: &Arc<VideoFrame>,
            outputs: &[ArrayViewD<'_, f32>],
        ) -> Result<f32, InferenceError> {
            Ok(outputs[0][[1]])
        }
    }

    struct SlowOpener(Duration);

    impl SourceOpener for SlowOpener {
        fn open(&self, uri: &str) -> Result<Box<dyn FrameSource>, SourceError> {
            thread::sleep(self.0);
            StandardOpener::default().open(uri)
        }
    }

    fn engine() -> Arc<InferenceEngine<FrameMean>> {
        Arc::new(
            InferenceEngine::new(FrameMean, Arc::new(MockHandle::new(8)), EngineConfig::default())
                .unwrap(),
        )
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    fn collecting_worker(
        uri: &str,
        opener: Arc<dyn SourceOpener>,
        config: StreamConfig,
    ) -> (StreamWorker<FrameMean>, Arc<Mutex<Vec<u64>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: ResultCallback<f32> = Arc::new(
            move |_uri: &str, ctx: &FrameContext, result: Result<f32, InferenceError>| {
                assert!(result.is_ok());
                sink.lock().push(ctx.sequence);
            },
        );
        let worker = StreamWorker::new(uri, engine(), opener, Some(callback), config);
        (worker, seen)
    }

    #[test]
    fn test_finite_source_runs_to_stopped() {
        let (worker, seen) = collecting_worker(
            "synthetic://w?frames=6&interval_ms=1",
            Arc::new(StandardOpener::default()),
            StreamConfig::default(),
        );

        worker.start().unwrap();
        assert!(wait_for(|| worker.state() == StreamState::Stopped));
        assert_eq!(*seen.lock(), (0..6).collect::<Vec<u64>>());
        assert_eq!(
            worker.session().stats(),
            SessionStats {
                frames: 6,
                results: 6,
                errors: 0
            }
        );
    }

    #[test]
    fn test_refused_source_fails_start() {
        let (worker, seen) = collecting_worker(
            "synthetic://w?refuse=1",
            Arc::new(StandardOpener::default()),
            StreamConfig::default(),
        );

        assert!(matches!(
            worker.start(),
            Err(StreamError::SourceUnavailable { .. })
        ));
        assert_eq!(worker.state(), StreamState::Failed);
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn test_startup_timeout_counts_as_failure() {
        let (worker, _seen) = collecting_worker(
            "synthetic://slow",
            Arc::new(SlowOpener(Duration::from_millis(300))),
            StreamConfig {
                startup_timeout_ms: 30,
                ..Default::default()
            },
        );

        let started = Instant::now();
        assert!(worker.start().is_err());
        assert!(started.elapsed() < Duration::from_millis(250));
        assert_eq!(worker.state(), StreamState::Failed);
    }

    #[test]
    fn test_disconnect_marks_failed() {
        let (worker, seen) = collecting_worker(
            "synthetic://w?fail_after=3&interval_ms=1",
            Arc::new(StandardOpener::default()),
            StreamConfig::default(),
        );

        worker.start().unwrap();
        assert!(wait_for(|| worker.state() == StreamState::Failed));
        assert_eq!(worker.session().stats().frames, 3);
        // Frames submitted before the disconnect still reach the callback
        assert_eq!(*seen.lock(), vec![0, 1, 2]);
    }

    struct PanickingSource;

    impl FrameSource for PanickingSource {
        fn uri(&self) -> &str {
            "test://panics"
        }

        fn next_frame(&mut self) -> Result<Option<VideoFrame>, SourceError> {
            panic!("decoder crashed");
        }
    }

    struct PanickingOpener;

    impl SourceOpener for PanickingOpener {
        fn open(&self, _uri: &str) -> Result<Box<dyn FrameSource>, SourceError> {
            Ok(Box::new(PanickingSource))
        }
    }

    #[test]
    fn test_panicking_loop_marks_failed() {
        let (worker, seen) = collecting_worker(
            "test://panics",
            Arc::new(PanickingOpener),
            StreamConfig::default(),
        );

        worker.start().unwrap();
        assert!(wait_for(|| worker.state() == StreamState::Failed));
        assert!(!worker.session().is_running());
        assert!(seen.lock().is_empty());

        worker.stop();
        assert_eq!(worker.state(), StreamState::Failed);
    }

    #[test]
    fn test_no_callbacks_after_stop() {
        let (worker, seen) = collecting_worker(
            "synthetic://endless?interval_ms=1",
            Arc::new(StandardOpener::default()),
            StreamConfig::default(),
        );

        worker.start().unwrap();
        assert!(wait_for(|| seen.lock().len() >= 3));
        worker.stop();
        assert_eq!(worker.state(), StreamState::Stopped);

        let delivered = seen.lock().len();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(seen.lock().len(), delivered);
    }

    #[test]
    fn test_start_twice_is_rejected() {
        let (worker, _seen) = collecting_worker(
            "synthetic://w?interval_ms=1",
            Arc::new(StandardOpener::default()),
            StreamConfig::default(),
        );

        worker.start().unwrap();
        assert!(matches!(worker.start(), Err(StreamError::DuplicateSource(_))));
        worker.stop();
    }
}
