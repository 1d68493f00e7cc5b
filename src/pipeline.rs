use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use image::RgbImage;

use crate::geometry::Vec2;
use crate::segmentation::{Preprocessor, Segmenter};
use crate::selector::{self, Composition, CompositionStatus};
use crate::store::{Counts, FrameStore};

/// Outcome of one segmentation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    Success,
    Failure,
}

/// Receives progress notifications from the pipeline.
///
/// `on_frame_processed` fires exactly once per attempted frame, always from
/// the single worker thread and in processing order. `on_composition_finished`
/// fires exactly once per `composite_frames` call, on the caller's thread.
pub trait PipelineObserver: Send + Sync {
    fn on_frame_processed(&self, _status: FrameStatus, _processed: usize, _remaining: usize) {}

    fn on_composition_finished(&self, _status: CompositionStatus, _image: Option<&RgbImage>) {}
}

struct Shared {
    store: FrameStore,
    segmenter: Mutex<Box<dyn Segmenter + Send>>,
    preprocessor: Preprocessor,
    observer: Arc<dyn PipelineObserver>,
}

/// Frame pipeline for one action shot: accepts raw frames from any thread,
/// normalizes and segments them on a single worker thread, and composes the
/// final image on demand.
pub struct Pipeline {
    shared: Arc<Shared>,
}

impl Pipeline {
    pub fn new(segmenter: Box<dyn Segmenter + Send>, observer: Arc<dyn PipelineObserver>) -> Self {
        let (input_width, _) = segmenter.input_size();
        Self {
            shared: Arc::new(Shared {
                store: FrameStore::new(),
                segmenter: Mutex::new(segmenter),
                preprocessor: Preprocessor::new(input_width),
                observer,
            }),
        }
    }

    /// Queue a raw frame and trigger processing if the worker is idle.
    pub fn submit_frame(&self, frame: RgbImage) {
        self.shared.store.submit_frame(frame);
        self.process_frames();
    }

    /// Idempotent processing trigger: starts the worker thread unless one is
    /// already draining the queue or there is nothing to drain.
    pub fn process_frames(&self) {
        if !self.shared.store.frame_available() {
            return;
        }
        if !self.shared.store.try_begin_processing() {
            return;
        }
        let spawned = thread::Builder::new().name("frame-worker".into()).spawn({
            let shared = Arc::clone(&self.shared);
            move || drain_queue(&shared)
        });
        if let Err(error) = spawned {
            tracing::error!("Failed to spawn frame worker: {error}");
            self.shared.store.finish_processing();
        }
    }

    /// Start a new session: clear all queued frames, processed frames and
    /// masks, and reset the segmentation model's internal state.
    ///
    /// An in-flight segmentation call is not cancelled; its late result is
    /// discarded by the store's session epoch check. Model state is cleared
    /// only between inferences, so this waits for at most one to finish.
    pub fn reset(&self) {
        self.shared.store.reset();
        let mut segmenter = self
            .shared
            .segmenter
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        segmenter.reset_state();
    }

    /// Principal axis of subject motion across the masks segmented so far.
    pub fn dominant_direction(&self) -> Vec2 {
        let (_, masks) = self.shared.store.snapshot();
        selector::dominant_direction(&masks)
    }

    /// Select the spread-out frames and compose the action shot.
    pub fn composite_frames(&self) -> Composition {
        let (frames, masks) = self.shared.store.snapshot();
        let composition = selector::compose(&frames, &masks);
        self.shared
            .observer
            .on_composition_finished(composition.status, composition.image.as_ref());
        composition
    }

    pub fn counts(&self) -> Counts {
        self.shared.store.counts()
    }

    pub fn is_processing(&self) -> bool {
        self.shared.store.is_processing()
    }

    /// Block until the worker goes idle or `timeout` elapses. Returns true
    /// when idle was reached.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.shared.store.wait_idle(timeout)
    }
}

fn drain_queue(shared: &Shared) {
    loop {
        let Some((frame, epoch)) = shared.store.take_next_frame() else {
            if shared.store.try_finish_processing() {
                return;
            }
            // A frame arrived between the dequeue and the finish attempt.
            continue;
        };

        let processed = Arc::new(shared.preprocessor.normalize_frame(&frame));
        if !shared.store.push_processed(epoch, Arc::clone(&processed)) {
            tracing::debug!("Discarding frame dequeued before a reset");
            continue;
        }

        // The segmenter has its own lock so the store stays free for
        // submissions while inference runs.
        let segment_start = Instant::now();
        let result = {
            let mut segmenter = shared
                .segmenter
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            segmenter.segment(&processed)
        };

        match result {
            Ok(mask) => {
                if !shared.store.push_mask(epoch, Arc::new(mask)) {
                    tracing::debug!("Discarding mask segmented before a reset");
                    continue;
                }
                let counts = shared.store.counts();
                tracing::debug!(
                    "Segmented frame {} in {:.1}ms, {} queued",
                    counts.masks,
                    segment_start.elapsed().as_secs_f64() * 1000.0,
                    counts.pending
                );
                shared
                    .observer
                    .on_frame_processed(FrameStatus::Success, counts.masks, counts.pending);
            }
            Err(error) => {
                if !shared.store.pop_processed(epoch) {
                    tracing::debug!("Discarding segmentation failure from before a reset");
                    continue;
                }
                tracing::warn!("Segmentation failed, stopping this pass: {error:#}");
                let counts = shared.store.counts();
                shared
                    .observer
                    .on_frame_processed(FrameStatus::Failure, counts.masks, counts.pending);
                // Fail-stop: the caller decides whether to trigger again for
                // the remaining queue or abandon the session.
                shared.store.finish_processing();
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    use anyhow::Result;
    use image::GrayImage;

    const SIZE: u32 = 32;

    /// Returns a small mask whose box moves right with each call, so a full
    /// run produces frames the selector accepts. When `start_gate` is set,
    /// the first call blocks until the test releases it.
    struct StubSegmenter {
        calls: Arc<AtomicUsize>,
        fail_on: Option<usize>,
        start_gate: Option<mpsc::Receiver<()>>,
    }

    impl StubSegmenter {
        fn boxed(calls: &Arc<AtomicUsize>, fail_on: Option<usize>) -> Box<dyn Segmenter + Send> {
            Box::new(Self {
                calls: Arc::clone(calls),
                fail_on,
                start_gate: None,
            })
        }
    }

    impl Segmenter for StubSegmenter {
        fn segment(&mut self, _frame: &RgbImage) -> Result<GrayImage> {
            if let Some(gate) = self.start_gate.take() {
                gate.recv().ok();
            }
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_on == Some(call) {
                anyhow::bail!("stub failure on call {call}");
            }
            let mut mask = GrayImage::new(SIZE, SIZE);
            let x = (call as u32 * 4) % (SIZE - 4);
            for dy in 0..4 {
                for dx in 0..4 {
                    mask.put_pixel(x + dx, 14 + dy, image::Luma([255]));
                }
            }
            Ok(mask)
        }

        fn input_size(&self) -> (u32, u32) {
            (SIZE, SIZE)
        }
    }

    /// Blocks inside `segment` until the test releases it, reporting when
    /// each call starts.
    struct GatedSegmenter {
        started: mpsc::Sender<()>,
        release: mpsc::Receiver<()>,
        calls: Arc<AtomicUsize>,
    }

    impl Segmenter for GatedSegmenter {
        fn segment(&mut self, _frame: &RgbImage) -> Result<GrayImage> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.started.send(()).ok();
            self.release.recv().ok();
            Ok(GrayImage::new(SIZE, SIZE))
        }

        fn input_size(&self) -> (u32, u32) {
            (SIZE, SIZE)
        }
    }

    #[derive(Default)]
    struct Recorder {
        frames: Mutex<Vec<(FrameStatus, usize, usize)>>,
        compositions: Mutex<Vec<CompositionStatus>>,
    }

    impl PipelineObserver for Recorder {
        fn on_frame_processed(&self, status: FrameStatus, processed: usize, remaining: usize) {
            self.frames.lock().unwrap().push((status, processed, remaining));
        }

        fn on_composition_finished(&self, status: CompositionStatus, _image: Option<&RgbImage>) {
            self.compositions.lock().unwrap().push(status);
        }
    }

    fn raw_frame() -> RgbImage {
        RgbImage::new(64, 48)
    }

    #[test]
    fn processes_all_submitted_frames_in_order() {
        let calls = Arc::new(AtomicUsize::new(0));
        let recorder = Arc::new(Recorder::default());
        let pipeline = Pipeline::new(StubSegmenter::boxed(&calls, None), recorder.clone());

        for _ in 0..3 {
            pipeline.submit_frame(raw_frame());
        }
        assert!(pipeline.wait_idle(Duration::from_secs(5)));

        let counts = pipeline.counts();
        assert_eq!(counts.submitted, 3);
        assert_eq!(counts.pending, 0);
        assert_eq!(counts.processed, 3);
        assert_eq!(counts.masks, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let events = recorder.frames.lock().unwrap();
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|(status, _, _)| *status == FrameStatus::Success));
        // The processed count in consecutive notifications strictly grows.
        assert!(events.windows(2).all(|pair| pair[0].1 < pair[1].1));
    }

    #[test]
    fn process_frames_trigger_is_idempotent() {
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let calls = Arc::new(AtomicUsize::new(0));
        let pipeline = Pipeline::new(
            Box::new(GatedSegmenter {
                started: started_tx,
                release: release_rx,
                calls: Arc::clone(&calls),
            }),
            Arc::new(Recorder::default()),
        );

        pipeline.submit_frame(raw_frame());
        pipeline.submit_frame(raw_frame());
        started_rx.recv().unwrap();

        // The worker is mid-segmentation; extra triggers must not start a
        // second one or consume frames twice.
        pipeline.process_frames();
        pipeline.process_frames();
        release_tx.send(()).unwrap();

        started_rx.recv().unwrap();
        release_tx.send(()).unwrap();

        assert!(pipeline.wait_idle(Duration::from_secs(5)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(pipeline.counts().processed, 2);
    }

    #[test]
    fn failed_segmentation_stops_the_pass_and_rolls_back() {
        let (gate_tx, gate_rx) = mpsc::channel();
        let calls = Arc::new(AtomicUsize::new(0));
        let recorder = Arc::new(Recorder::default());
        let pipeline = Pipeline::new(
            Box::new(StubSegmenter {
                calls: Arc::clone(&calls),
                fail_on: Some(2),
                start_gate: Some(gate_rx),
            }),
            recorder.clone(),
        );

        // Hold the worker at its first segmentation until all three frames
        // are queued, so the failure on frame 2 leaves frame 3 pending.
        for _ in 0..3 {
            pipeline.submit_frame(raw_frame());
        }
        gate_tx.send(()).unwrap();
        assert!(pipeline.wait_idle(Duration::from_secs(5)));

        // Frame 2 failed: its processed frame was rolled back and frame 3
        // stays queued until the caller triggers again.
        let counts = pipeline.counts();
        assert_eq!(counts.processed, 1);
        assert_eq!(counts.masks, 1);
        assert_eq!(counts.pending, 1);
        {
            let events = recorder.frames.lock().unwrap();
            let statuses: Vec<FrameStatus> = events.iter().map(|(status, _, _)| *status).collect();
            assert_eq!(statuses, vec![FrameStatus::Success, FrameStatus::Failure]);
        }

        pipeline.process_frames();
        assert!(pipeline.wait_idle(Duration::from_secs(5)));

        let counts = pipeline.counts();
        assert_eq!(counts.processed, 2);
        assert_eq!(counts.masks, 2);
        assert_eq!(counts.pending, 0);
    }

    #[test]
    fn reset_discards_the_in_flight_result() {
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let calls = Arc::new(AtomicUsize::new(0));
        let recorder = Arc::new(Recorder::default());
        let pipeline = Arc::new(Pipeline::new(
            Box::new(GatedSegmenter {
                started: started_tx,
                release: release_rx,
                calls: Arc::clone(&calls),
            }),
            recorder.clone(),
        ));

        pipeline.submit_frame(raw_frame());
        started_rx.recv().unwrap();

        // reset() clears the store first, then blocks on the segmenter lock
        // until the in-flight call finishes.
        let resetter = {
            let pipeline = Arc::clone(&pipeline);
            thread::spawn(move || pipeline.reset())
        };
        let deadline = Instant::now() + Duration::from_secs(5);
        while pipeline.counts().submitted != 0 {
            assert!(Instant::now() < deadline, "store reset did not happen");
            thread::sleep(Duration::from_millis(1));
        }

        release_tx.send(()).unwrap();
        resetter.join().unwrap();
        assert!(pipeline.wait_idle(Duration::from_secs(5)));

        // The late mask was refused by the epoch check, without notifying.
        let counts = pipeline.counts();
        assert_eq!(counts.submitted, 0);
        assert_eq!(counts.processed, 0);
        assert_eq!(counts.masks, 0);
        assert!(recorder.frames.lock().unwrap().is_empty());
    }

    #[test]
    fn composite_frames_notifies_the_observer() {
        let calls = Arc::new(AtomicUsize::new(0));
        let recorder = Arc::new(Recorder::default());
        let pipeline = Pipeline::new(StubSegmenter::boxed(&calls, None), recorder.clone());

        // Nothing processed yet: degraded, with no image at all.
        let composition = pipeline.composite_frames();
        assert_eq!(composition.status, CompositionStatus::Degraded);
        assert!(composition.image.is_none());

        for _ in 0..3 {
            pipeline.submit_frame(raw_frame());
        }
        assert!(pipeline.wait_idle(Duration::from_secs(5)));

        let composition = pipeline.composite_frames();
        assert_eq!(composition.status, CompositionStatus::Success);
        assert_eq!(composition.selected, vec![0, 1, 2]);
        assert_eq!(
            composition.image.unwrap().dimensions(),
            (SIZE, SIZE)
        );

        let compositions = recorder.compositions.lock().unwrap();
        assert_eq!(
            *compositions,
            vec![CompositionStatus::Degraded, CompositionStatus::Success]
        );
    }
}
