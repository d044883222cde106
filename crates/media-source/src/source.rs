//! Frame sources and the uri-based opener

use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::files::{find_files, IMAGE_PATTERNS};
use crate::frame::VideoFrame;
use crate::SourceError;

/// A pull-based supplier of decoded frames.
pub trait FrameSource: Send {
    fn uri(&self) -> &str;

    /// Next decoded frame. `Ok(None)` marks the end of a finite source.
    fn next_frame(&mut self) -> Result<Option<VideoFrame>, SourceError>;
}

/// Opens a source connection for a uri.
pub trait SourceOpener: Send + Sync {
    fn open(&self, uri: &str) -> Result<Box<dyn FrameSource>, SourceError>;
}

/// Replays image files from disk as a stream
pub struct ImageSequenceSource {
    uri: String,
    files: Vec<PathBuf>,
    position: usize,
    sequence: u64,
    loop_playback: bool,
    interval: Duration,
    started: Instant,
}

impl ImageSequenceSource {
    /// Open a directory of images, or a single image file
    pub fn open(uri: &str, loop_playback: bool, interval: Duration) -> Result<Self, SourceError> {
        let path = PathBuf::from(uri.strip_prefix("file://").unwrap_or(uri));
        let files = if path.is_dir() {
            find_files(&path, IMAGE_PATTERNS)?
        } else if path.is_file() {
            vec![path.clone()]
        } else {
            return Err(SourceError::Open(format!("{} does not exist", path.display())));
        };

        if files.is_empty() {
            return Err(SourceError::Open(format!("no images in {}", path.display())));
        }

        info!("Opened image sequence {} ({} files)", uri, files.len());
        Ok(Self {
            uri: uri.to_string(),
            files,
            position: 0,
            sequence: 0,
            loop_playback,
            interval,
            started: Instant::now(),
        })
    }
}

impl FrameSource for ImageSequenceSource {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn next_frame(&mut self) -> Result<Option<VideoFrame>, SourceError> {
        if self.position >= self.files.len() {
            if !self.loop_playback {
                return Ok(None);
            }
            self.position = 0;
        }
        if !self.interval.is_zero() {
            thread::sleep(self.interval);
        }

        let path = &self.files[self.position];
        let mut frame = VideoFrame::load(path)
            .map_err(|e| SourceError::Decode(format!("{}: {}", path.display(), e)))?;
        frame.sequence = self.sequence;
        frame.timestamp_ns = self.started.elapsed().as_nanos() as u64;

        self.position += 1;
        self.sequence += 1;
        Ok(Some(frame))
    }
}

/// Largest synthetic frame, in bytes (8K RGB)
pub const MAX_SYNTHETIC_FRAME_BYTES: usize = 7680 * 4320 * 3;

/// Parameters of a generated feed, parsed from `synthetic://name?key=value&...`
#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticConfig {
    pub width: u32,
    pub height: u32,
    /// Stop after this many frames (`None` = endless)
    pub frames: Option<u64>,
    /// Simulate a disconnect after this many frames
    pub fail_after: Option<u64>,
    /// Refuse the connection at open time
    pub refuse: bool,
    /// Delay between frames
    pub interval: Duration,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            width: 64,
            height: 48,
            frames: None,
            fail_after: None,
            refuse: false,
            interval: Duration::from_millis(5),
        }
    }
}

impl SyntheticConfig {
    /// Parse the query part of a `synthetic://` uri
    pub fn from_uri(uri: &str) -> Result<Self, SourceError> {
        let rest = uri
            .strip_prefix("synthetic://")
            .ok_or_else(|| SourceError::UnsupportedUri(uri.to_string()))?;
        let mut config = Self::default();

        let Some((_, query)) = rest.split_once('?') else {
            return Ok(config);
        };

        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, "1"));
            let bad_value = || SourceError::UnsupportedUri(format!("{uri}: bad value for {key}"));
            let number = || value.parse::<u64>().map_err(|_| bad_value());
            let dimension = || number().and_then(|n| u32::try_from(n).map_err(|_| bad_value()));
            match key {
                "width" => config.width = dimension()?,
                "height" => config.height = dimension()?,
                "frames" => config.frames = Some(number()?),
                "fail_after" => config.fail_after = Some(number()?),
                "interval_ms" => config.interval = Duration::from_millis(number()?),
                "refuse" => config.refuse = number()? != 0,
                other => warn!("Ignoring unknown synthetic parameter '{}'", other),
            }
        }

        Ok(config)
    }

    /// Bytes of one RGB frame, `None` on overflow
    pub fn frame_bytes(&self) -> Option<usize> {
        (self.width as usize)
            .checked_mul(self.height as usize)?
            .checked_mul(3)
    }
}

/// Generated moving-bar pattern, for load tests and examples without cameras
pub struct SyntheticSource {
    uri: String,
    config: SyntheticConfig,
    frame_bytes: usize,
    sequence: u64,
    started: Instant,
}

impl SyntheticSource {
    pub fn open(uri: &str, config: SyntheticConfig) -> Result<Self, SourceError> {
        if config.refuse {
            return Err(SourceError::Open(format!("connection refused by {uri}")));
        }
        if config.width == 0 || config.height == 0 {
            return Err(SourceError::Open(format!("{uri}: empty frame size")));
        }
        let frame_bytes = config
            .frame_bytes()
            .filter(|&bytes| bytes <= MAX_SYNTHETIC_FRAME_BYTES)
            .ok_or_else(|| {
                SourceError::Open(format!(
                    "{uri}: frame {}x{} exceeds {} bytes",
                    config.width, config.height, MAX_SYNTHETIC_FRAME_BYTES
                ))
            })?;
        debug!("Opened synthetic source {} ({:?})", uri, config);
        Ok(Self {
            uri: uri.to_string(),
            config,
            frame_bytes,
            sequence: 0,
            started: Instant::now(),
        })
    }

    fn render(&self) -> VideoFrame {
        let (w, h) = (self.config.width, self.config.height);
        let bar = (self.sequence % w as u64) as u32;
        let mut data = Vec::with_capacity(self.frame_bytes);
        for _y in 0..h {
            for x in 0..w {
                let v = if x.abs_diff(bar) < 4 { 255 } else { 16 };
                data.extend_from_slice(&[v, v, (self.sequence % 256) as u8]);
            }
        }
        VideoFrame::new(
            data,
            w,
            h,
            self.started.elapsed().as_nanos() as u64,
            self.sequence,
        )
    }
}

impl FrameSource for SyntheticSource {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn next_frame(&mut self) -> Result<Option<VideoFrame>, SourceError> {
        if let Some(limit) = self.config.fail_after {
            if self.sequence >= limit {
                return Err(SourceError::Disconnected(self.uri.clone()));
            }
        }
        if let Some(limit) = self.config.frames {
            if self.sequence >= limit {
                return Ok(None);
            }
        }
        if !self.config.interval.is_zero() {
            thread::sleep(self.config.interval);
        }

        let frame = self.render();
        self.sequence += 1;
        Ok(Some(frame))
    }
}

/// Opener dispatching on the uri scheme
#[derive(Debug, Clone)]
pub struct StandardOpener {
    /// Restart image sequences when they end
    pub loop_sequences: bool,
    /// Pacing between image sequence frames
    pub sequence_interval: Duration,
}

impl Default for StandardOpener {
    fn default() -> Self {
        Self {
            loop_sequences: true,
            sequence_interval: Duration::from_millis(40),
        }
    }
}

impl SourceOpener for StandardOpener {
    fn open(&self, uri: &str) -> Result<Box<dyn FrameSource>, SourceError> {
        if uri.starts_with("synthetic://") {
            let config = SyntheticConfig::from_uri(uri)?;
            return Ok(Box::new(SyntheticSource::open(uri, config)?));
        }
        if uri.starts_with("file://") || !uri.contains("://") {
            return Ok(Box::new(ImageSequenceSource::open(
                uri,
                self.loop_sequences,
                self.sequence_interval,
            )?));
        }
        Err(SourceError::UnsupportedUri(uri.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_synthetic_uri() {
        let config =
            SyntheticConfig::from_uri("synthetic://cam1?width=32&height=16&frames=3&interval_ms=0")
                .unwrap();
        assert_eq!((config.width, config.height), (32, 16));
        assert_eq!(config.frames, Some(3));
        assert!(config.interval.is_zero());
        assert!(!config.refuse);

        assert!(SyntheticConfig::from_uri("synthetic://x?width=abc").is_err());
    }

    #[test]
    fn test_synthetic_end_of_stream() {
        let config = SyntheticConfig::from_uri("synthetic://a?frames=2&interval_ms=0").unwrap();
        let mut source = SyntheticSource::open("synthetic://a", config).unwrap();

        assert_eq!(source.next_frame().unwrap().unwrap().sequence, 0);
        assert_eq!(source.next_frame().unwrap().unwrap().sequence, 1);
        assert!(source.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_synthetic_disconnect() {
        let opener = StandardOpener::default();
        let mut source = opener
            .open("synthetic://b?fail_after=1&interval_ms=0")
            .unwrap();

        assert!(source.next_frame().unwrap().is_some());
        assert!(matches!(
            source.next_frame(),
            Err(SourceError::Disconnected(_))
        ));
    }

    #[test]
    fn test_refused_and_unsupported() {
        let opener = StandardOpener::default();
        assert!(matches!(
            opener.open("synthetic://c?refuse=1"),
            Err(SourceError::Open(_))
        ));
        assert!(matches!(
            opener.open("rtsp://10.0.0.1/stream"),
            Err(SourceError::UnsupportedUri(_))
        ));
    }

    #[test]
    fn test_oversized_frames_are_refused_at_open() {
        assert!(SyntheticConfig::from_uri("synthetic://x?width=5000000000").is_err());

        let opener = StandardOpener::default();
        for uri in [
            "synthetic://big?width=70000&height=70000",
            "synthetic://big?width=4294967295&height=4294967295",
            "synthetic://wide?width=100000&height=1000",
        ] {
            assert!(
                matches!(opener.open(uri), Err(SourceError::Open(_))),
                "{uri} should be refused"
            );
        }
        assert!(opener.open("synthetic://hd?width=1920&height=1080").is_ok());
    }

    #[test]
    fn test_image_sequence_replays_in_order() {
        let dir = tempfile::tempdir().unwrap();
        for (i, name) in ["0.png", "1.png"].iter().enumerate() {
            let img = image::RgbImage::from_pixel(4, 3, image::Rgb([i as u8 * 100, 0, 0]));
            img.save(dir.path().join(name)).unwrap();
        }

        let mut source =
            ImageSequenceSource::open(dir.path().to_str().unwrap(), false, Duration::ZERO).unwrap();
        let first = source.next_frame().unwrap().unwrap();
        let second = source.next_frame().unwrap().unwrap();

        assert_eq!(first.get_pixel(0, 0), Some([0, 0, 0]));
        assert_eq!(second.get_pixel(0, 0), Some([100, 0, 0]));
        assert_eq!(second.sequence, 1);
        assert!(source.next_frame().unwrap().is_none());
    }
}
