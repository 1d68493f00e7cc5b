mod modnet;
mod preprocess;
pub mod types;

pub use modnet::ModNet;
pub use preprocess::{Preprocessor, TARGET_SIZE};
pub use types::{SegmentationError, Segmenter};

use anyhow::Result;
use std::path::Path;

/// Create a default segmentation model (MODNet)
pub fn create_default_model<P: AsRef<Path>>(model_path: P) -> Result<Box<dyn Segmenter + Send>> {
    let model = ModNet::new(model_path)?;
    Ok(Box::new(model))
}
