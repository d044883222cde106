//! Plate detector (YOLO-style head with four corner landmarks)

use std::sync::Arc;

use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use inference_engine::{InferenceError, InferenceTask};
use media_source::VideoFrame;
use ndarray::{ArrayD, ArrayView2, ArrayViewD, Ix2};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::{DetectionConfig, DetectionError};

/// Box (4) + objectness (1)
const BOX_FIELDS: usize = 5;
/// Four corner points, x/y interleaved
const LANDMARK_VALUES: usize = 8;
/// Letterbox fill, gray
const PAD_VALUE: u8 = 114;

/// Detected plate in source-frame pixel coordinates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlateDetection {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
    pub confidence: f32,
    /// Plate layout class (single / double row, ...)
    pub class_label: usize,
    /// Corner points: top-left, top-right, bottom-right, bottom-left
    pub landmarks: [f32; LANDMARK_VALUES],
}

impl PlateDetection {
    pub fn width(&self) -> f32 {
        (self.right - self.left).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.bottom - self.top).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// Intersection over union
    pub fn iou(&self, other: &PlateDetection) -> f32 {
        let w = (self.right.min(other.right) - self.left.max(other.left)).max(0.0);
        let h = (self.bottom.min(other.bottom) - self.top.max(other.top)).max(0.0);
        let inter = w * h;
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}

/// Aspect-preserving resize into a square network input
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub scale: f32,
    pub scaled_width: u32,
    pub scaled_height: u32,
    pub pad_x: u32,
    pub pad_y: u32,
}

impl Letterbox {
    pub fn fit(width: u32, height: u32, target: u32) -> Self {
        let scale = (target as f32 / width as f32).min(target as f32 / height as f32);
        let scaled_width = ((width as f32 * scale).round() as u32).clamp(1, target);
        let scaled_height = ((height as f32 * scale).round() as u32).clamp(1, target);
        Self {
            scale,
            scaled_width,
            scaled_height,
            pad_x: (target - scaled_width) / 2,
            pad_y: (target - scaled_height) / 2,
        }
    }

    /// Network-input point back to source pixels
    pub fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        (
            (x - self.pad_x as f32) / self.scale,
            (y - self.pad_y as f32) / self.scale,
        )
    }
}

/// Keep the highest-scored boxes, dropping same-class overlaps above `iou_threshold`.
/// Result is sorted by descending confidence and holds at most `max_objects` boxes.
pub fn non_max_suppression(
    mut candidates: Vec<PlateDetection>,
    iou_threshold: f32,
    max_objects: usize,
) -> Vec<PlateDetection> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<PlateDetection> = Vec::new();
    for candidate in candidates {
        if kept.len() >= max_objects {
            break;
        }
        let suppressed = kept.iter().any(|k| {
            k.class_label == candidate.class_label && k.iou(&candidate) > iou_threshold
        });
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}

/// Plate detection task over whole frames
pub struct PlateDetector {
    config: DetectionConfig,
}

impl PlateDetector {
    pub fn new(config: DetectionConfig) -> Result<Self, DetectionError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &DetectionConfig {
        &self.config
    }

    fn letterbox_for(&self, frame: &VideoFrame) -> Result<Letterbox, DetectionError> {
        if frame.width == 0 || frame.height == 0 {
            return Err(DetectionError::InvalidFrame("empty frame".into()));
        }
        Ok(Letterbox::fit(frame.width, frame.height, self.config.input_size))
    }

    /// Decode raw rows `[cx, cy, w, h, obj, 8 landmarks, class scores...]`
    /// and map them back onto the source frame.
    pub fn decode(
        &self,
        rows: ArrayView2<'_, f32>,
        letterbox: &Letterbox,
        frame_width: u32,
        frame_height: u32,
    ) -> Result<Vec<PlateDetection>, DetectionError> {
        let row_len = rows.ncols();
        if row_len < BOX_FIELDS + LANDMARK_VALUES {
            return Err(DetectionError::OutputShape {
                shape: rows.shape().to_vec(),
                reason: format!("rows need at least {} values", BOX_FIELDS + LANDMARK_VALUES),
            });
        }
        let (max_x, max_y) = (frame_width as f32, frame_height as f32);

        let mut candidates = Vec::new();
        for row in rows.rows() {
            let objectness = row[4];
            if objectness < self.config.confidence_threshold {
                continue;
            }

            let (class_label, class_score) = row
                .iter()
                .skip(BOX_FIELDS + LANDMARK_VALUES)
                .copied()
                .enumerate()
                .fold((0, 1.0_f32), |best, (i, s)| {
                    if i == 0 || s > best.1 {
                        (i, s)
                    } else {
                        best
                    }
                });
            let confidence = objectness * class_score;
            if confidence < self.config.confidence_threshold {
                continue;
            }

            let (cx, cy) = letterbox.unmap(row[0], row[1]);
            let (w, h) = (row[2] / letterbox.scale, row[3] / letterbox.scale);

            let mut landmarks = [0.0; LANDMARK_VALUES];
            for p in 0..LANDMARK_VALUES / 2 {
                let (x, y) = letterbox.unmap(row[BOX_FIELDS + 2 * p], row[BOX_FIELDS + 2 * p + 1]);
                landmarks[2 * p] = x.clamp(0.0, max_x);
                landmarks[2 * p + 1] = y.clamp(0.0, max_y);
            }

            candidates.push(PlateDetection {
                left: (cx - w / 2.0).clamp(0.0, max_x),
                top: (cy - h / 2.0).clamp(0.0, max_y),
                right: (cx + w / 2.0).clamp(0.0, max_x),
                bottom: (cy + h / 2.0).clamp(0.0, max_y),
                confidence,
                class_label,
                landmarks,
            });
        }

        let candidate_count = candidates.len();
        let kept = non_max_suppression(candidates, self.config.nms_threshold, self.config.max_objects);
        trace!("Decoded {} candidates, kept {}", candidate_count, kept.len());
        Ok(kept)
    }
}

impl InferenceTask for PlateDetector {
    type Input = Arc<VideoFrame>;
    type Output = Vec<PlateDetection>;

    fn preprocess(&self, frame: &Arc<VideoFrame>) -> Result<ArrayD<f32>, InferenceError> {
        let letterbox = self.letterbox_for(frame)?;
        let image = frame
            .to_image()
            .ok_or_else(|| DetectionError::InvalidFrame("pixel data does not match dimensions".into()))?;

        let resized = imageops::resize(
            &image,
            letterbox.scaled_width,
            letterbox.scaled_height,
            FilterType::Triangle,
        );
        let side = self.config.input_size;
        let mut canvas = RgbImage::from_pixel(side, side, Rgb([PAD_VALUE; 3]));
        imageops::overlay(&mut canvas, &resized, letterbox.pad_x as i64, letterbox.pad_y as i64);

        Ok(VideoFrame::from_image(canvas, 0, 0).to_chw_tensor().into_dyn())
    }

    fn postprocess(
        &self,
        frame: &Arc<VideoFrame>,
        outputs: &[ArrayViewD<'_, f32>],
    ) -> Result<Vec<PlateDetection>, InferenceError> {
        let raw = outputs
            .first()
            .ok_or_else(|| InferenceError::Postprocess("detector produced no outputs".into()))?;
        let rows = raw
            .view()
            .into_dimensionality::<Ix2>()
            .map_err(|e| DetectionError::OutputShape {
                shape: raw.shape().to_vec(),
                reason: e.to_string(),
            })?;

        let letterbox = self.letterbox_for(frame)?;
        Ok(self.decode(rows, &letterbox, frame.width, frame.height)?)
    }
}
