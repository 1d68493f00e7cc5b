mod png;

pub use png::PngFileOutput;

use anyhow::Result;
use image::RgbImage;

/// Trait for composite image destinations
pub trait ImageSink {
    /// Write the final image to the output
    fn write_image(&mut self, image: &RgbImage) -> Result<()>;
}
