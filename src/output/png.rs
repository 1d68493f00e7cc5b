use super::ImageSink;
use anyhow::{Context, Result};
use image::RgbImage;
use std::path::PathBuf;

/// Writes the final composite to a PNG file.
pub struct PngFileOutput {
    path: PathBuf,
}

impl PngFileOutput {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }
}

impl ImageSink for PngFileOutput {
    fn write_image(&mut self, image: &RgbImage) -> Result<()> {
        image
            .save(&self.path)
            .with_context(|| format!("Failed to write image to {}", self.path.display()))?;

        tracing::info!(
            "Wrote {}x{} composite to {}",
            image.width(),
            image.height(),
            self.path.display()
        );

        Ok(())
    }
}
