//! Model-specific pre- and post-processing plugged into an engine

use ndarray::{ArrayD, ArrayViewD};

use crate::InferenceError;

/// Turns caller inputs into network tensors and raw outputs into results.
///
/// `preprocess` runs on the submitting thread, once per item. `postprocess` runs on
/// the engine worker, once per batch slot, and receives the slot's view of every
/// network output (batch axis removed).
pub trait InferenceTask: Send + Sync + 'static {
    type Input: Send + 'static;
    type Output: Send + 'static;

    fn preprocess(&self, input: &Self::Input) -> Result<ArrayD<f32>, InferenceError>;

    fn postprocess(
        &self,
        input: &Self::Input,
        outputs: &[ArrayViewD<'_, f32>],
    ) -> Result<Self::Output, InferenceError>;
}
