use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use image::{GrayImage, RgbImage};

/// Sequence lengths observed under one lock acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Counts {
    pub submitted: u64,
    pub pending: usize,
    pub processed: usize,
    pub masks: usize,
}

struct StoreInner {
    /// Raw frames queued for processing, oldest first.
    pending: VecDeque<RgbImage>,
    /// Square-cropped, resized frames in processing order.
    processed: Vec<Arc<RgbImage>>,
    /// Binary masks, index-aligned with `processed`.
    masks: Vec<Arc<GrayImage>>,
    /// True while a worker is draining the queue.
    processing: bool,
    /// Total raw frames ever submitted in the current session.
    submitted: u64,
    /// Session counter, bumped by `reset`. Appends carrying a stale epoch
    /// are refused so late segmentation results cannot leak across sessions.
    epoch: u64,
}

/// Shared state for the frame pipeline: the pending-frame FIFO, the processed
/// frame and mask sequences, and the processing flag, all behind one lock.
///
/// Critical sections are queue and handle manipulation only; segmentation
/// never runs under this lock.
pub struct FrameStore {
    inner: Mutex<StoreInner>,
    idle: Condvar,
}

impl FrameStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                pending: VecDeque::new(),
                processed: Vec::new(),
                masks: Vec::new(),
                processing: false,
                submitted: 0,
                epoch: 0,
            }),
            idle: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        // Critical sections hold no intermediate states, so a poisoned lock
        // still guards consistent data.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a raw frame for processing.
    pub fn submit_frame(&self, frame: RgbImage) {
        let mut inner = self.lock();
        inner.pending.push_back(frame);
        inner.submitted += 1;
    }

    pub fn frame_available(&self) -> bool {
        !self.lock().pending.is_empty()
    }

    /// Remove and return the oldest queued frame, tagged with the current
    /// session epoch. Returns `None` when the queue is empty.
    pub fn take_next_frame(&self) -> Option<(RgbImage, u64)> {
        let mut inner = self.lock();
        let epoch = inner.epoch;
        inner.pending.pop_front().map(|frame| (frame, epoch))
    }

    /// Flip Idle -> Processing. Returns false when a worker is already
    /// running, in which case the caller must not start another.
    pub fn try_begin_processing(&self) -> bool {
        let mut inner = self.lock();
        if inner.processing {
            false
        } else {
            inner.processing = true;
            true
        }
    }

    /// Flip Processing -> Idle and wake any `wait_idle` callers.
    pub fn finish_processing(&self) {
        let mut inner = self.lock();
        inner.processing = false;
        drop(inner);
        self.idle.notify_all();
    }

    /// Flip Processing -> Idle only when the pending queue is empty. Returns
    /// false (flag untouched) when frames arrived since the last dequeue, in
    /// which case the worker must keep draining. The queue check and the flag
    /// clear share one lock acquisition: a concurrently submitted frame is
    /// either seen here or finds the flag still set.
    pub fn try_finish_processing(&self) -> bool {
        let mut inner = self.lock();
        if !inner.pending.is_empty() {
            return false;
        }
        inner.processing = false;
        drop(inner);
        self.idle.notify_all();
        true
    }

    pub fn is_processing(&self) -> bool {
        self.lock().processing
    }

    /// Append a processed frame. Refused (returns false) when `epoch` is
    /// stale, i.e. a reset happened after the frame was dequeued.
    pub fn push_processed(&self, epoch: u64, frame: Arc<RgbImage>) -> bool {
        let mut inner = self.lock();
        if inner.epoch != epoch {
            return false;
        }
        inner.processed.push(frame);
        true
    }

    /// Remove the most recent processed frame. Used to roll back after a
    /// failed segmentation so masks and frames stay index-aligned. Returns
    /// false on a stale epoch (the reset already cleared the sequence).
    pub fn pop_processed(&self, epoch: u64) -> bool {
        let mut inner = self.lock();
        if inner.epoch != epoch {
            return false;
        }
        inner.processed.pop();
        true
    }

    /// Append a mask for the most recently processed frame. Refused on a
    /// stale epoch.
    pub fn push_mask(&self, epoch: u64, mask: Arc<GrayImage>) -> bool {
        let mut inner = self.lock();
        if inner.epoch != epoch {
            return false;
        }
        inner.masks.push(mask);
        true
    }

    pub fn counts(&self) -> Counts {
        let inner = self.lock();
        Counts {
            submitted: inner.submitted,
            pending: inner.pending.len(),
            processed: inner.processed.len(),
            masks: inner.masks.len(),
        }
    }

    /// Cheap copy of the processed frame and mask sequences (Arc clones).
    pub fn snapshot(&self) -> (Vec<Arc<RgbImage>>, Vec<Arc<GrayImage>>) {
        let inner = self.lock();
        (inner.processed.clone(), inner.masks.clone())
    }

    /// Atomically clear all three sequences and start a new session epoch.
    ///
    /// The processing flag is left alone: a worker that is mid-segmentation
    /// keeps running, but its late appends are refused by the epoch check.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.pending.clear();
        inner.processed.clear();
        inner.masks.clear();
        inner.submitted = 0;
        inner.epoch += 1;
    }

    /// Block until the processing loop goes idle, or `timeout` elapses.
    /// Returns true when idle was reached.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();
        while inner.processing {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .idle
                .wait_timeout(inner, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            inner = guard;
        }
        true
    }
}

impl Default for FrameStore {
    fn default() -> Self {
        Self::new()
    }
}
