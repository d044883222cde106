//! Latest detections per stream, fed by the orchestrator callback

use std::collections::HashMap;
use std::sync::Arc;

use detection::PlateDetection;
use inference_engine::InferenceError;
use media_source::FrameContext;
use parking_lot::RwLock;
use serde::Serialize;
use stream_orchestrator::ResultCallback;

#[derive(Debug, Clone, Default, Serialize)]
pub struct StreamDetections {
    pub uri: String,
    pub results: u64,
    pub errors: u64,
    pub last_sequence: Option<u64>,
    pub last_timestamp_ns: Option<u64>,
    /// Plates of the most recent successful frame
    pub plates: Vec<PlateDetection>,
    pub last_error: Option<String>,
}

#[derive(Default)]
pub struct DetectionStore {
    streams: RwLock<HashMap<String, StreamDetections>>,
}

impl DetectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(
        &self,
        uri: &str,
        context: &FrameContext,
        result: Result<Vec<PlateDetection>, InferenceError>,
    ) {
        let mut streams = self.streams.write();
        let entry = streams
            .entry(uri.to_string())
            .or_insert_with(|| StreamDetections {
                uri: uri.to_string(),
                ..Default::default()
            });
        entry.last_sequence = Some(context.sequence);
        entry.last_timestamp_ns = Some(context.timestamp_ns);
        match result {
            Ok(plates) => {
                metrics::counter!("plates_detected_total").increment(plates.len() as u64);
                entry.results += 1;
                entry.plates = plates;
            }
            Err(e) => {
                entry.errors += 1;
                entry.last_error = Some(e.to_string());
            }
        }
    }

    pub fn get(&self, uri: &str) -> Option<StreamDetections> {
        self.streams.read().get(uri).cloned()
    }

    pub fn remove(&self, uri: &str) {
        self.streams.write().remove(uri);
    }

    /// Callback that records every streamed result into this store
    pub fn callback(self: &Arc<Self>) -> ResultCallback<Vec<PlateDetection>> {
        let store = Arc::clone(self);
        Arc::new(
            move |uri: &str,
                  context: &FrameContext,
                  result: Result<Vec<PlateDetection>, InferenceError>| {
                store.record(uri, context, result)
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(sequence: u64) -> FrameContext {
        FrameContext {
            sequence,
            timestamp_ns: sequence * 40_000_000,
            width: 640,
            height: 480,
        }
    }

    #[test]
    fn test_records_latest_result_and_errors() {
        let store = Arc::new(DetectionStore::new());
        let callback = store.callback();

        callback("cam", &context(0), Ok(Vec::new()));
        callback("cam", &context(1), Err(InferenceError::EngineShutdown));

        let record = store.get("cam").unwrap();
        assert_eq!(record.results, 1);
        assert_eq!(record.errors, 1);
        assert_eq!(record.last_sequence, Some(1));
        assert!(record.last_error.is_some());

        store.remove("cam");
        assert!(store.get("cam").is_none());
    }
}
