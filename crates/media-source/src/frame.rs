//! Video frame types and processing

use std::path::Path;

use image::imageops::FilterType;
use image::RgbImage;
use ndarray::Array3;

use crate::SourceError;

/// Decoded RGB video frame
#[derive(Debug, Clone)]
pub struct VideoFrame {
    /// RGB pixel data (width * height * 3)
    pub data: Vec<u8>,
    /// Frame width
    pub width: u32,
    /// Frame height
    pub height: u32,
    /// Capture timestamp (nanoseconds)
    pub timestamp_ns: u64,
    /// Frame sequence number
    pub sequence: u64,
}

/// Metadata of the frame a streamed result belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameContext {
    pub sequence: u64,
    pub timestamp_ns: u64,
    pub width: u32,
    pub height: u32,
}

impl VideoFrame {
    /// Create a new video frame from raw RGB data
    pub fn new(data: Vec<u8>, width: u32, height: u32, timestamp_ns: u64, sequence: u64) -> Self {
        Self {
            data,
            width,
            height,
            timestamp_ns,
            sequence,
        }
    }

    /// Solid-color frame, mostly useful for warmup and tests
    pub fn filled(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        let data = rgb
            .iter()
            .copied()
            .cycle()
            .take((width * height * 3) as usize)
            .collect();
        Self::new(data, width, height, 0, 0)
    }

    /// Decode an image file (jpeg, png, ...) into an RGB frame
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        let img = image::open(path.as_ref())?.to_rgb8();
        Ok(Self::from_image(img, 0, 0))
    }

    /// Wrap an already decoded image
    pub fn from_image(img: RgbImage, timestamp_ns: u64, sequence: u64) -> Self {
        let (width, height) = img.dimensions();
        Self::new(img.into_raw(), width, height, timestamp_ns, sequence)
    }

    /// Copy into an `image` buffer, `None` if the data length does not match the dimensions
    pub fn to_image(&self) -> Option<RgbImage> {
        RgbImage::from_raw(self.width, self.height, self.data.clone())
    }

    pub fn context(&self) -> FrameContext {
        FrameContext {
            sequence: self.sequence,
            timestamp_ns: self.timestamp_ns,
            width: self.width,
            height: self.height,
        }
    }

    /// Get pixel at (x, y)
    pub fn get_pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let idx = ((y * self.width + x) * 3) as usize;
        self.data
            .get(idx..idx + 3)
            .map(|p| [p[0], p[1], p[2]])
    }

    /// Crop a region of the frame
    pub fn crop(&self, x: u32, y: u32, w: u32, h: u32) -> Option<VideoFrame> {
        if w == 0 || h == 0 || x + w > self.width || y + h > self.height {
            return None;
        }

        let mut cropped = Vec::with_capacity((w * h * 3) as usize);
        for row in y..(y + h) {
            let start = ((row * self.width + x) * 3) as usize;
            let end = start + (w * 3) as usize;
            cropped.extend_from_slice(self.data.get(start..end)?);
        }

        Some(VideoFrame {
            data: cropped,
            width: w,
            height: h,
            timestamp_ns: self.timestamp_ns,
            sequence: self.sequence,
        })
    }

    /// Resize frame using bilinear (triangle) filtering
    pub fn resize(&self, new_width: u32, new_height: u32) -> Option<VideoFrame> {
        let img = self.to_image()?;
        let resized = image::imageops::resize(&img, new_width, new_height, FilterType::Triangle);
        Some(Self::from_image(resized, self.timestamp_ns, self.sequence))
    }

    /// Planar CHW tensor scaled to [0, 1]
    pub fn to_chw_tensor(&self) -> Array3<f32> {
        let (w, h) = (self.width as usize, self.height as usize);
        let mut tensor = Array3::<f32>::zeros((3, h, w));
        for (i, pixel) in self.data.chunks_exact(3).enumerate() {
            let (y, x) = (i / w, i % w);
            if y >= h {
                break;
            }
            for c in 0..3 {
                tensor[[c, y, x]] = pixel[c] as f32 / 255.0;
            }
        }
        tensor
    }
}
