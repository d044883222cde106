//! Detection configuration

use serde::{Deserialize, Serialize};

use crate::DetectionError;

/// Index 0 is the CTC blank.
pub const DEFAULT_PLATE_CHARSET: &str = "#京沪津渝冀晋蒙辽吉黑苏浙皖闽赣鲁豫鄂湘粤桂琼川贵云藏陕甘青宁新学警港澳挂使领民航危0123456789ABCDEFGHJKLMNPQRSTUVWXYZ险品";

/// Detection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Minimum `objectness * class score` to keep a candidate
    pub confidence_threshold: f32,

    /// IoU above which a lower-scored box of the same class is suppressed
    pub nms_threshold: f32,

    /// Maximum detections kept per image
    pub max_objects: usize,

    /// Square detector input side (pixels)
    pub input_size: u32,

    /// Recognizer input
    pub rec_width: u32,
    pub rec_height: u32,

    /// Recognizer normalization, applied after scaling to [0, 1]
    pub rec_mean: f32,
    pub rec_std: f32,

    /// Recognizer output alphabet, blank first
    pub charset: String,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.25,
            nms_threshold: 0.45,
            max_objects: 1024,
            input_size: 640,
            rec_width: 168,
            rec_height: 48,
            rec_mean: 0.588,
            rec_std: 0.193,
            charset: DEFAULT_PLATE_CHARSET.to_string(),
        }
    }
}

impl DetectionConfig {
    pub fn validate(&self) -> Result<(), DetectionError> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(DetectionError::InvalidConfig(format!(
                "confidence_threshold {} outside [0, 1]",
                self.confidence_threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.nms_threshold) {
            return Err(DetectionError::InvalidConfig(format!(
                "nms_threshold {} outside [0, 1]",
                self.nms_threshold
            )));
        }
        if self.input_size == 0 || self.rec_width == 0 || self.rec_height == 0 {
            return Err(DetectionError::InvalidConfig("zero-sized network input".into()));
        }
        if self.rec_std <= 0.0 {
            return Err(DetectionError::InvalidConfig("rec_std must be positive".into()));
        }
        if self.charset.chars().count() < 2 {
            return Err(DetectionError::InvalidConfig(
                "charset needs a blank and at least one symbol".into(),
            ));
        }
        Ok(())
    }
}
