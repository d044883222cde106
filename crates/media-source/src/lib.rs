//! Media Sources for the Inference Gateway
//!
//! Provides decoded RGB frames to the inference engines.
//! Supports:
//! - Image sequences on disk (`file://` URIs or plain directories)
//! - Synthetic feeds for tests and load generation (`synthetic://`)
//! - Still image decoding for benchmarks and calibration

pub mod files;
pub mod frame;
pub mod source;

pub use files::{find_files, IMAGE_PATTERNS};
pub use frame::{FrameContext, VideoFrame};
pub use source::{
    FrameSource, ImageSequenceSource, SourceOpener, StandardOpener, SyntheticConfig,
    SyntheticSource,
};

use thiserror::Error;

/// Media source error types
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Failed to open source: {0}")]
    Open(String),

    #[error("Decode failed: {0}")]
    Decode(String),

    #[error("Source disconnected: {0}")]
    Disconnected(String),

    #[error("Unsupported uri: {0}")]
    UnsupportedUri(String),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
