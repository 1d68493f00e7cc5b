use std::sync::Arc;

use image::{GrayImage, RgbImage};

use crate::geometry::{self, Axis, BoundingBox, Vec2};

/// A subject bounding box may cover at most this fraction of the mask in
/// each dimension. Larger boxes are whole-frame false positives from the
/// segmentation model and are ignored.
const MAX_SUBJECT_FRACTION: f32 = 0.7;

/// Outcome of a composition request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositionStatus {
    Success,
    /// No frame passed the bounding-box filters; the composite fell back to
    /// the most recent processed frame, or to nothing at all.
    Degraded,
}

/// Final composite plus the frame indices that produced it.
#[derive(Debug)]
pub struct Composition {
    pub status: CompositionStatus,
    pub image: Option<RgbImage>,
    /// Selected frame indices in chronological order.
    pub selected: Vec<usize>,
}

struct MaskBox {
    bbox: Option<BoundingBox>,
    /// True when the box exists and covers less than the subject fraction
    /// limit in both dimensions.
    qualifying: bool,
}

fn mask_boxes(masks: &[Arc<GrayImage>]) -> Vec<MaskBox> {
    masks
        .iter()
        .map(|mask| {
            let (width, height) = mask.dimensions();
            let bbox = geometry::bounding_box(mask);
            let qualifying = bbox.is_some_and(|b| {
                (b.width as f32) < MAX_SUBJECT_FRACTION * width as f32
                    && (b.height as f32) < MAX_SUBJECT_FRACTION * height as f32
            });
            MaskBox { bbox, qualifying }
        })
        .collect()
}

/// Principal axis of subject displacement between the first mask with any
/// bounding box and the last mask with a qualifying one.
///
/// Returns the zero vector when either endpoint is missing or both centers
/// coincide.
pub fn dominant_direction(masks: &[Arc<GrayImage>]) -> Vec2 {
    direction_from_boxes(&mask_boxes(masks))
}

fn direction_from_boxes(boxes: &[MaskBox]) -> Vec2 {
    let start = boxes.iter().find_map(|entry| entry.bbox);
    let end = boxes
        .iter()
        .rev()
        .find_map(|entry| if entry.qualifying { entry.bbox } else { None });

    match (start, end) {
        (Some(start), Some(end)) => {
            let start_center = start.center();
            let end_center = end.center();
            if start_center == end_center {
                Vec2::ZERO
            } else {
                (start_center - end_center).normalize()
            }
        }
        _ => Vec2::ZERO,
    }
}

/// Pick the frames to composite, walking the mask sequence backward.
///
/// The most recent qualifying mask is always taken. Each earlier qualifying
/// mask is taken only when its center is further from the previously taken
/// box than half their combined quarter-spans, measured along the dominant
/// motion axis. This enforces a minimum spacing proportional to subject
/// size, so near-duplicate poses are skipped.
///
/// Returns indices in chronological order.
pub fn select_frames(masks: &[Arc<GrayImage>]) -> Vec<usize> {
    let boxes = mask_boxes(masks);
    let direction = direction_from_boxes(&boxes);
    let axis = if direction.x.abs() >= direction.y.abs() {
        Axis::X
    } else {
        Axis::Y
    };

    let mut selected = Vec::new();
    let mut previous: Option<BoundingBox> = None;

    for (index, entry) in boxes.iter().enumerate().rev() {
        if !entry.qualifying {
            continue;
        }
        let Some(bbox) = entry.bbox else {
            continue;
        };

        match previous {
            None => {
                selected.push(index);
                previous = Some(bbox);
            }
            Some(prev) => {
                let distance = (prev.center_along(axis) - bbox.center_along(axis)).abs();
                let bound = (prev.span(axis) + bbox.span(axis)) as f32 / 4.0;
                // Strictly greater: a distance of exactly half the bound is
                // rejected as a near-duplicate.
                if distance > bound * 0.5 {
                    selected.push(index);
                    previous = Some(bbox);
                }
            }
        }
    }

    selected.reverse();
    selected
}

/// Compose the final action-shot image.
///
/// The frame at the last selected index is the background; every selected
/// frame's subject pixels are then stamped onto it oldest-first, so on
/// overlap the most recent subject wins. An empty selection degrades to the
/// most recent processed frame.
///
/// `frames` and `masks` must be index-aligned; `masks` may be the shorter of
/// the two while a frame's segmentation is still in flight.
pub fn compose(frames: &[Arc<RgbImage>], masks: &[Arc<GrayImage>]) -> Composition {
    let selected = select_frames(masks);

    let (status, image) = match selected.last() {
        None => (
            CompositionStatus::Degraded,
            frames.last().map(|frame| (**frame).clone()),
        ),
        Some(&base_index) => (
            CompositionStatus::Success,
            Some(overlay(frames, masks, &selected, base_index)),
        ),
    };

    Composition {
        status,
        image,
        selected,
    }
}

fn overlay(
    frames: &[Arc<RgbImage>],
    masks: &[Arc<GrayImage>],
    selected: &[usize],
    base_index: usize,
) -> RgbImage {
    let mut canvas = (*frames[base_index]).clone();

    for &index in selected {
        let frame = &frames[index];
        let mask = &masks[index];
        for (x, y, pixel) in frame.enumerate_pixels() {
            if mask.get_pixel(x, y)[0] != 0 {
                canvas.put_pixel(x, y, *pixel);
            }
        }
    }

    canvas
}
