use super::preprocess::{Preprocessor, TARGET_SIZE};
use super::types::{SegmentationError, Segmenter};
use anyhow::{ensure, Context, Result};
use image::{GrayImage, RgbImage};
use ndarray::IxDyn;
use ort::{GraphOptimizationLevel, Session};
use std::path::Path;

/// MODNet portrait matting model
///
/// Stateless per-frame matting: one square RGB input, one single-channel
/// matte output at the same resolution.
pub struct ModNet {
    session: Session,
    preprocessor: Preprocessor,
    width: u32,
    height: u32,
}

impl ModNet {
    /// Create a new MODNet model from an ONNX file
    ///
    /// # Arguments
    /// * `model_path` - Path to the ONNX model file
    pub fn new<P: AsRef<Path>>(model_path: P) -> Result<Self> {
        let path = model_path.as_ref();

        tracing::info!("Loading MODNet model from {}", path.display());

        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(4)?
            .commit_from_file(path)
            .with_context(|| format!("Failed to load model from {}", path.display()))?;

        tracing::info!("MODNet model loaded successfully");

        let width = TARGET_SIZE;
        let height = TARGET_SIZE;

        let preprocessor = Preprocessor::new(width);

        Ok(Self {
            session,
            preprocessor,
            width,
            height,
        })
    }
}

impl Segmenter for ModNet {
    fn segment(&mut self, frame: &RgbImage) -> Result<GrayImage> {
        let _span = tracing::debug_span!("modnet_segment").entered();

        let (frame_width, frame_height) = frame.dimensions();
        ensure!(
            (frame_width, frame_height) == (self.width, self.height),
            "expected a {}x{} input frame, got {}x{}",
            self.width,
            self.height,
            frame_width,
            frame_height
        );

        let input_tensor = self.preprocessor.to_tensor(frame);

        let _infer_span = tracing::debug_span!("inference").entered();
        let outputs = self
            .session
            .run(ort::inputs![input_tensor.view()]?)
            .context("Failed to run inference")?;
        drop(_infer_span);

        // MODNet has a single output: the alpha matte, shape [1, 1, H, W]
        if outputs.len() != 1 {
            return Err(SegmentationError::WrongOutputCount {
                expected: 1,
                got: outputs.len(),
            }
            .into());
        }

        let matte = outputs[0]
            .try_extract_tensor::<f32>()?
            .view()
            .to_owned()
            .into_dimensionality::<IxDyn>()?;

        let shape = matte.shape();
        if shape.len() != 4
            || shape[0] != 1
            || shape[1] != 1
            || shape[2] != self.height as usize
            || shape[3] != self.width as usize
        {
            return Err(SegmentationError::MalformedMatte {
                got: shape.to_vec(),
            }
            .into());
        }

        let matte_flat: Vec<f32> = matte.iter().copied().collect();

        Ok(Preprocessor::mask_from_matte(
            &matte_flat,
            self.width,
            self.height,
        ))
    }

    fn input_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}
