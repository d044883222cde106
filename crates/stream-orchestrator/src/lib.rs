//! Stream Orchestration
//!
//! Long-running video sources, one dedicated worker each:
//! - Synchronized startup (one-shot handshake with timeout)
//! - Decode → submit → callback loop with a bounded in-flight window
//! - Session registry keyed by source uri, round-robin engine assignment

pub mod orchestrator;
pub mod state;
pub mod worker;

pub use orchestrator::StreamOrchestrator;
pub use state::{AtomicStreamState, StreamState};
pub use worker::{ResultCallback, SessionStats, StreamConfig, StreamSession, StreamWorker};

use thiserror::Error;

/// Stream management error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("Source already has an active session: {0}")]
    DuplicateSource(String),

    #[error("Source {uri} unavailable: {reason}")]
    SourceUnavailable { uri: String, reason: String },

    #[error("Unknown source: {0}")]
    UnknownSource(String),

    #[error("No inference engine configured")]
    NoEngine,
}
