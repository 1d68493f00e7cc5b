use anyhow::Result;
use image::{GrayImage, RgbImage};
use thiserror::Error;

/// Failure modes of the segmentation collaborator.
#[derive(Debug, Error)]
pub enum SegmentationError {
    #[error("model returned {got} outputs, expected {expected}")]
    WrongOutputCount { expected: usize, got: usize },

    #[error("matte tensor has shape {got:?}, expected [1, 1, height, width]")]
    MalformedMatte { got: Vec<usize> },
}

/// Trait for per-pixel foreground segmentation models.
///
/// Allows swapping between different backends (MODNet, RVM, PP-HumanSeg, etc.)
pub trait Segmenter {
    /// Segment a square RGB frame at the model's input resolution.
    ///
    /// # Returns
    /// * A binary mask at the same resolution; non-zero pixels denote
    ///   "subject present"
    fn segment(&mut self, frame: &RgbImage) -> Result<GrayImage>;

    /// Reset internal state (for models with temporal/recurrent components).
    ///
    /// Called when a new capture session starts.
    fn reset_state(&mut self) {
        // Default implementation: no-op for stateless models
    }

    /// Get the model's input dimensions
    ///
    /// Returns (width, height)
    fn input_size(&self) -> (u32, u32);
}
