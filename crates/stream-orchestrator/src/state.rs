//! Session lifecycle states

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

/// `Created -> Starting -> Running -> {Stopping -> Stopped | Failed}`,
/// plus `Running -> Stopped` when a finite source ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum StreamState {
    Created = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
    Stopped = 4,
    Failed = 5,
}

impl StreamState {
    /// No worker will run for this session again
    pub fn is_finished(self) -> bool {
        matches!(self, StreamState::Stopped | StreamState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StreamState::Created => "created",
            StreamState::Starting => "starting",
            StreamState::Running => "running",
            StreamState::Stopping => "stopping",
            StreamState::Stopped => "stopped",
            StreamState::Failed => "failed",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => StreamState::Created,
            1 => StreamState::Starting,
            2 => StreamState::Running,
            3 => StreamState::Stopping,
            4 => StreamState::Stopped,
            _ => StreamState::Failed,
        }
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lock-free cell holding a [`StreamState`]
#[derive(Debug)]
pub struct AtomicStreamState(AtomicU8);

impl AtomicStreamState {
    pub fn new(state: StreamState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn load(&self) -> StreamState {
        StreamState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, state: StreamState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Move `from -> to`; false if the current state is not `from`
    pub fn transition(&self, from: StreamState, to: StreamState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}
