use image::{imageops, GrayImage, RgbImage};
use ndarray::Array4;

/// Side length of the square frames handed to the segmentation model.
pub const TARGET_SIZE: u32 = 448;

/// Matte values at or above this count as foreground in the binary mask.
const FOREGROUND_THRESHOLD: f32 = 0.5;

/// Preprocessor for normalizing capture frames into model inputs
pub struct Preprocessor {
    target_size: u32,
}

impl Preprocessor {
    pub fn new(target_size: u32) -> Self {
        Self { target_size }
    }

    /// Normalize a raw capture frame into a model-ready square frame.
    ///
    /// Steps:
    /// 1. Crop a centered square, side = min(width, height)
    /// 2. Resize to the target resolution
    pub fn normalize_frame(&self, frame: &RgbImage) -> RgbImage {
        let _span = tracing::debug_span!("normalize_frame").entered();

        let (width, height) = frame.dimensions();
        let side = width.min(height);
        let x_offset = (width - side) / 2;
        let y_offset = (height - side) / 2;
        let square = imageops::crop_imm(frame, x_offset, y_offset, side, side).to_image();

        if square.dimensions() == (self.target_size, self.target_size) {
            square
        } else {
            imageops::resize(
                &square,
                self.target_size,
                self.target_size,
                imageops::FilterType::Lanczos3,
            )
        }
    }

    /// Convert a normalized frame into an NCHW tensor scaled to [-1, 1]
    /// (the range MODNet was trained on).
    ///
    /// Returns: Array4<f32> with shape [1, 3, height, width]
    pub fn to_tensor(&self, image: &RgbImage) -> Array4<f32> {
        let _span = tracing::debug_span!("to_tensor").entered();

        let (width, height) = image.dimensions();
        let mut tensor = Array4::<f32>::zeros((1, 3, height as usize, width as usize));

        for y in 0..height {
            for x in 0..width {
                let pixel = image.get_pixel(x, y);

                let r = (pixel[0] as f32 / 255.0 - 0.5) / 0.5;
                let g = (pixel[1] as f32 / 255.0 - 0.5) / 0.5;
                let b = (pixel[2] as f32 / 255.0 - 0.5) / 0.5;

                // Store in NCHW format
                tensor[[0, 0, y as usize, x as usize]] = r;
                tensor[[0, 1, y as usize, x as usize]] = g;
                tensor[[0, 2, y as usize, x as usize]] = b;
            }
        }

        tensor
    }

    /// Build a binary mask from a flattened matte at the same resolution.
    ///
    /// Foreground pixels become 255, everything else 0.
    pub fn mask_from_matte(matte: &[f32], width: u32, height: u32) -> GrayImage {
        GrayImage::from_fn(width, height, |x, y| {
            let idx = (y * width + x) as usize;
            if matte[idx] >= FOREGROUND_THRESHOLD {
                image::Luma([255])
            } else {
                image::Luma([0])
            }
        })
    }
}
