mod capture;
mod geometry;
mod output;
mod pipeline;
mod segmentation;
mod selector;
mod store;

use anyhow::{bail, Context, Result};
use capture::{CaptureSource, WebcamCapture};
use clap::Parser;
use output::{ImageSink, PngFileOutput};
use pipeline::{FrameStatus, Pipeline, PipelineObserver};
use selector::CompositionStatus;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Input webcam device index
    #[arg(short, long, default_value_t = 0)]
    input_device: u32,

    /// Capture resolution width
    #[arg(long, default_value_t = 1280)]
    capture_width: u32,

    /// Capture resolution height
    #[arg(long, default_value_t = 720)]
    capture_height: u32,

    /// Frames per second submitted to the pipeline
    #[arg(long, default_value_t = 10)]
    fps: u32,

    /// Number of frames to capture for one shot
    #[arg(short = 'n', long, default_value_t = 40)]
    frames: u32,

    /// Path to the segmentation model (ONNX file)
    #[arg(long)]
    model: String,

    /// Path of the composite PNG to write
    #[arg(short, long, default_value = "action-shot.png")]
    output: String,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

/// Logs pipeline progress as frames finish segmentation.
struct ProgressLogger;

impl PipelineObserver for ProgressLogger {
    fn on_frame_processed(&self, status: FrameStatus, processed: usize, remaining: usize) {
        match status {
            FrameStatus::Success => {
                tracing::info!("Segmented frame {} ({} queued)", processed, remaining)
            }
            FrameStatus::Failure => tracing::warn!(
                "Segmentation failed after {} frames, {} still queued",
                processed,
                remaining
            ),
        }
    }

    fn on_composition_finished(&self, status: CompositionStatus, _image: Option<&image::RgbImage>) {
        if status == CompositionStatus::Degraded {
            tracing::warn!("No frames qualified, falling back to the last processed frame");
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    tracing::info!("Strobeshot starting");
    tracing::info!("Capture: {}x{}", args.capture_width, args.capture_height);
    tracing::info!("Shot: {} frames at {} fps", args.frames, args.fps);

    // Initialize capture
    let mut capture = WebcamCapture::new(
        args.input_device,
        args.capture_width,
        args.capture_height,
        args.fps,
    )
    .context("Failed to initialize webcam capture")?;

    // Initialize segmentation
    tracing::info!("Loading segmentation model from {}", args.model);
    let model = segmentation::create_default_model(&args.model)
        .context("Failed to load segmentation model")?;
    tracing::info!("Segmentation model loaded successfully");

    let pipeline = Pipeline::new(model, Arc::new(ProgressLogger));

    capture_frames(&mut capture, &pipeline, args.frames, args.fps)?;
    drop(capture);

    // Frames may still be queued behind the segmentation model.
    if pipeline.is_processing() {
        tracing::info!("Waiting for segmentation to drain");
        if !pipeline.wait_idle(Duration::from_secs(300)) {
            tracing::warn!("Timed out waiting for segmentation, composing what is ready");
        }
    }
    let counts = pipeline.counts();
    tracing::info!(
        "Processed {} of {} captured frames",
        counts.masks,
        counts.submitted
    );

    let direction = pipeline.dominant_direction();
    tracing::debug!(
        "Dominant motion direction: ({:.2}, {:.2})",
        direction.x,
        direction.y
    );

    let composition = pipeline.composite_frames();
    let Some(image) = composition.image else {
        bail!("No frames were processed, nothing to write");
    };
    tracing::info!(
        "Composed action shot from {} frames",
        composition.selected.len()
    );

    let mut sink = PngFileOutput::new(&args.output);
    sink.write_image(&image)?;

    Ok(())
}

fn capture_frames<C>(capture: &mut C, pipeline: &Pipeline, frames: u32, fps: u32) -> Result<()>
where
    C: CaptureSource,
{
    let frame_duration = Duration::from_secs_f32(1.0 / fps as f32);
    let mut total_capture_time = Duration::ZERO;

    let (width, height) = capture.resolution();
    tracing::info!(
        "Capturing {}x{} frames, move the subject across the frame",
        width,
        height
    );

    for count in 1..=frames {
        let loop_start = Instant::now();

        let capture_start = Instant::now();
        let frame = capture
            .capture_frame()
            .context("Failed to capture frame")?;
        total_capture_time += capture_start.elapsed();

        pipeline.submit_frame(frame);

        // Log stats every 10 frames
        if count % 10 == 0 {
            let avg_capture_ms = total_capture_time.as_secs_f64() * 1000.0 / count as f64;
            tracing::info!(
                "Captured {}/{} frames, capture={:.1}ms avg",
                count,
                frames,
                avg_capture_ms
            );
        }

        // Frame rate limiting
        let elapsed = loop_start.elapsed();
        if elapsed < frame_duration {
            std::thread::sleep(frame_duration - elapsed);
        }
    }

    Ok(())
}
