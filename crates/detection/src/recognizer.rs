//! Plate text recognition (CRNN-style, CTC output)

use std::sync::Arc;

use inference_engine::{InferenceError, InferenceTask};
use media_source::VideoFrame;
use ndarray::{Array3, ArrayD, ArrayView2, ArrayViewD, Ix2};

use crate::{DetectionConfig, DetectionError, PlateDetection};

/// Greedy CTC decode of `[T, C]` logits: best class per step, repeats collapsed,
/// blanks (index 0) dropped. Indices past the charset are skipped.
pub fn ctc_greedy_decode(logits: ArrayView2<'_, f32>, charset: &[char]) -> String {
    let mut text = String::new();
    let mut previous = 0usize;

    for step in logits.rows() {
        let best = step
            .iter()
            .enumerate()
            .fold((0usize, f32::NEG_INFINITY), |best, (i, &v)| {
                if v > best.1 {
                    (i, v)
                } else {
                    best
                }
            })
            .0;
        if best != 0 && best != previous {
            if let Some(&c) = charset.get(best) {
                text.push(c);
            }
        }
        previous = best;
    }
    text
}

/// Recognizes the text of one detected plate
pub struct PlateRecognizer {
    config: DetectionConfig,
    charset: Vec<char>,
}

impl PlateRecognizer {
    pub fn new(config: DetectionConfig) -> Result<Self, DetectionError> {
        config.validate()?;
        let charset = config.charset.chars().collect();
        Ok(Self { config, charset })
    }

    fn crop_plate(&self, frame: &VideoFrame, plate: &PlateDetection) -> Result<VideoFrame, DetectionError> {
        let left = plate.left.max(0.0).floor() as u32;
        let top = plate.top.max(0.0).floor() as u32;
        let right = (plate.right.ceil() as u32).min(frame.width);
        let bottom = (plate.bottom.ceil() as u32).min(frame.height);
        if right <= left || bottom <= top {
            return Err(DetectionError::InvalidFrame(format!(
                "plate box [{}, {}, {}, {}] is empty inside {}x{}",
                plate.left, plate.top, plate.right, plate.bottom, frame.width, frame.height
            )));
        }

        frame
            .crop(left, top, right - left, bottom - top)
            .and_then(|crop| crop.resize(self.config.rec_width, self.config.rec_height))
            .ok_or_else(|| DetectionError::InvalidFrame("plate crop failed".into()))
    }
}

impl InferenceTask for PlateRecognizer {
    type Input = (Arc<VideoFrame>, PlateDetection);
    type Output = String;

    fn preprocess(&self, (frame, plate): &Self::Input) -> Result<ArrayD<f32>, InferenceError> {
        let crop = self.crop_plate(frame, plate)?;
        let (mean, std) = (self.config.rec_mean, self.config.rec_std);
        let tensor: Array3<f32> = crop.to_chw_tensor().mapv(|v| (v - mean) / std);
        Ok(tensor.into_dyn())
    }

    fn postprocess(
        &self,
        _input: &Self::Input,
        outputs: &[ArrayViewD<'_, f32>],
    ) -> Result<String, InferenceError> {
        let raw = outputs
            .first()
            .ok_or_else(|| InferenceError::Postprocess("recognizer produced no outputs".into()))?;
        let logits = raw
            .view()
            .into_dimensionality::<Ix2>()
            .map_err(|e| DetectionError::OutputShape {
                shape: raw.shape().to_vec(),
                reason: e.to_string(),
            })?;
        Ok(ctc_greedy_decode(logits, &self.charset))
    }
}
