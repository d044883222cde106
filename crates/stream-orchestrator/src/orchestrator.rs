//! Session registry keyed by source uri

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use inference_engine::{InferenceEngine, InferenceTask};
use media_source::{SourceOpener, VideoFrame};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::state::StreamState;
use crate::worker::{ResultCallback, SessionStats, StreamConfig, StreamWorker};
use crate::StreamError;

/// Creates, tracks and tears down one [`StreamWorker`] per source.
///
/// New streams are spread round-robin over the engines (one per device).
pub struct StreamOrchestrator<T: InferenceTask<Input = Arc<VideoFrame>>> {
    engines: Vec<Arc<InferenceEngine<T>>>,
    next_engine: AtomicUsize,
    opener: Arc<dyn SourceOpener>,
    callback: RwLock<Option<ResultCallback<T::Output>>>,
    sessions: Mutex<HashMap<String, Arc<StreamWorker<T>>>>,
    config: StreamConfig,
}

impl<T: InferenceTask<Input = Arc<VideoFrame>>> StreamOrchestrator<T> {
    pub fn new(
        engines: Vec<Arc<InferenceEngine<T>>>,
        opener: Arc<dyn SourceOpener>,
        config: StreamConfig,
    ) -> Self {
        info!("Stream orchestrator over {} engine(s)", engines.len());
        Self {
            engines,
            next_engine: AtomicUsize::new(0),
            opener,
            callback: RwLock::new(None),
            sessions: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Callback for sessions created from now on; running sessions keep theirs
    pub fn set_callback(&self, callback: ResultCallback<T::Output>) {
        *self.callback.write() = Some(callback);
    }

    pub fn engines(&self) -> &[Arc<InferenceEngine<T>>] {
        &self.engines
    }

    fn pick_engine(&self) -> Result<Arc<InferenceEngine<T>>, StreamError> {
        if self.engines.is_empty() {
            return Err(StreamError::NoEngine);
        }
        let slot = self.next_engine.fetch_add(1, Ordering::Relaxed) % self.engines.len();
        Ok(self.engines[slot].clone())
    }

    /// Open `uri` and start streaming it. Blocks until the source answers the
    /// startup handshake (or the startup timeout expires).
    pub fn make_view(&self, uri: &str) -> Result<(), StreamError> {
        let uri = uri.trim();
        if uri.is_empty() {
            return Err(StreamError::SourceUnavailable {
                uri: String::new(),
                reason: "empty uri".into(),
            });
        }

        let (worker, replaced) = {
            let mut sessions = self.sessions.lock();
            let existing = sessions.get(uri).map(|w| w.state());
            let replaced = match existing {
                Some(state) if !state.is_finished() => {
                    return Err(StreamError::DuplicateSource(uri.to_string()));
                }
                Some(_) => sessions.remove(uri),
                None => None,
            };

            let engine = self.pick_engine()?;
            let worker = Arc::new(StreamWorker::new(
                uri,
                engine,
                self.opener.clone(),
                self.callback.read().clone(),
                self.config.clone(),
            ));
            sessions.insert(uri.to_string(), worker.clone());
            (worker, replaced)
        };

        if let Some(old) = replaced {
            debug!("Replacing {} session of {}", old.state(), uri);
            old.stop();
        }

        match worker.start() {
            Ok(()) => {
                self.publish_gauge();
                Ok(())
            }
            Err(e) => {
                self.remove_if_same(uri, &worker);
                worker.stop();
                Err(e)
            }
        }
    }

    fn remove_if_same(&self, uri: &str, worker: &Arc<StreamWorker<T>>) {
        let mut sessions = self.sessions.lock();
        if sessions.get(uri).is_some_and(|w| Arc::ptr_eq(w, worker)) {
            sessions.remove(uri);
        }
    }

    /// Stop and forget the session of `uri`
    pub fn stop_view(&self, uri: &str) -> Result<(), StreamError> {
        let worker = self
            .sessions
            .lock()
            .remove(uri.trim())
            .ok_or_else(|| StreamError::UnknownSource(uri.to_string()))?;
        worker.stop();
        self.publish_gauge();
        info!("View {} removed", uri);
        Ok(())
    }

    /// Uris whose session is currently running, sorted
    pub fn list_active_uris(&self) -> Vec<String> {
        let mut uris: Vec<String> = self
            .sessions
            .lock()
            .iter()
            .filter(|(_, w)| w.state() == StreamState::Running)
            .map(|(uri, _)| uri.clone())
            .collect();
        uris.sort();
        uris
    }

    pub fn session_state(&self, uri: &str) -> Option<StreamState> {
        self.sessions.lock().get(uri.trim()).map(|w| w.state())
    }

    pub fn session_stats(&self, uri: &str) -> Option<SessionStats> {
        self.sessions.lock().get(uri.trim()).map(|w| w.session().stats())
    }

    /// Drop sessions that ended (stopped or failed) and return their uris
    pub fn evict_inactive(&self) -> Vec<String> {
        let evicted: Vec<(String, Arc<StreamWorker<T>>)> = {
            let mut sessions = self.sessions.lock();
            let finished: Vec<String> = sessions
                .iter()
                .filter(|(_, w)| w.state().is_finished())
                .map(|(uri, _)| uri.clone())
                .collect();
            finished
                .into_iter()
                .filter_map(|uri| sessions.remove(&uri).map(|w| (uri, w)))
                .collect()
        };

        let mut uris = Vec::with_capacity(evicted.len());
        for (uri, worker) in evicted {
            worker.stop();
            uris.push(uri);
        }
        uris.sort();
        if !uris.is_empty() {
            info!("Evicted {} inactive session(s)", uris.len());
        }
        uris
    }

    /// Stop every session
    pub fn stop_all(&self) {
        let workers: Vec<_> = self.sessions.lock().drain().map(|(_, w)| w).collect();
        if workers.is_empty() {
            return;
        }
        info!("Stopping {} stream(s)", workers.len());
        for worker in workers {
            worker.stop();
        }
        self.publish_gauge();
    }

    fn publish_gauge(&self) {
        metrics::gauge!("stream_active_sessions").set(self.list_active_uris().len() as f64);
    }
}

impl<T: InferenceTask<Input = Arc<VideoFrame>>> Drop for StreamOrchestrator<T> {
    fn drop(&mut self) {
        self.stop_all();
    }
}
