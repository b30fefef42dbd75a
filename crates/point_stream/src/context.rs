//! The explicit context object shared by registration, workers and the render thread.

use crate::config::StreamConfig;
use crate::data::{Aabb, LoadTask, PointSource};
use crate::error::{Result, StreamError};
use crate::ingest::queue::{LoadQueue, Totals, UploadQueue};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Counters advanced by the render thread after each upload. Within a session
/// they only grow; the rasterizer sizes its dispatch from `batches_loaded`.
#[derive(Debug, Default)]
pub struct Progress {
    points_loaded: AtomicU64,
    batches_loaded: AtomicU64,
    uploads_rejected: AtomicU64,
}

impl Progress {
    #[inline]
    pub fn points_loaded(&self) -> u64 {
        self.points_loaded.load(Ordering::Acquire)
    }

    #[inline]
    pub fn batches_loaded(&self) -> u64 {
        self.batches_loaded.load(Ordering::Acquire)
    }

    #[inline]
    pub fn uploads_rejected(&self) -> u64 {
        self.uploads_rejected.load(Ordering::Acquire)
    }

    pub(crate) fn advance(&self, points: u64, batches: u64) {
        self.points_loaded.fetch_add(points, Ordering::AcqRel);
        self.batches_loaded.fetch_add(batches, Ordering::AcqRel);
    }

    pub(crate) fn reject(&self) {
        self.uploads_rejected.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn reset(&self) {
        self.points_loaded.store(0, Ordering::Release);
        self.batches_loaded.store(0, Ordering::Release);
        self.uploads_rejected.store(0, Ordering::Release);
    }
}

/// A load task that could not be encoded.
#[derive(Debug)]
pub struct TaskFailure {
    pub source_index: u32,
    pub source_name: String,
    pub first_point: u64,
    pub num_points: u64,
    pub error: StreamError,
}

pub struct StreamContext {
    pub config: StreamConfig,
    pub load_queue: LoadQueue,
    pub upload_queue: UploadQueue,
    pub progress: Progress,
    /// Bumped on reset, only while holding the load-queue lock.
    generation: AtomicU64,
    failures: Mutex<Vec<TaskFailure>>,
}

impl StreamContext {
    pub fn new(config: StreamConfig) -> Result<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new(Self {
            config,
            load_queue: LoadQueue::new(),
            upload_queue: UploadQueue::new(),
            progress: Progress::default(),
            generation: AtomicU64::new(0),
            failures: Mutex::new(Vec::new()),
        }))
    }

    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn totals(&self) -> Totals {
        self.load_queue.totals()
    }

    pub fn sources(&self) -> Vec<Arc<PointSource>> {
        self.load_queue.lock().sources.clone()
    }

    pub fn framing_bounds(&self) -> Aabb {
        self.load_queue.lock().framing_bounds
    }

    pub fn session_bounds(&self) -> Aabb {
        self.load_queue.lock().session_bounds
    }

    /// Record a failed task of the current session. Failures of tasks from
    /// before the last reset are dropped.
    pub(crate) fn record_failure(&self, task: &LoadTask, error: StreamError) {
        // Held across the generation check so a concurrent reset clears it.
        let mut failures = self.failures.lock();
        if task.generation() != self.generation() {
            log::debug!("ignoring failure of stale task of '{}': {}", task.source.name, error);
            return;
        }

        log::error!(
            "failed to encode {} points of '{}' from {}: {}",
            task.num_points,
            task.source.name,
            task.first_point,
            error
        );
        task.source.mark_failed();
        failures.push(TaskFailure {
            source_index: task.source.index,
            source_name: task.source.name.clone(),
            first_point: task.first_point,
            num_points: task.num_points,
            error,
        });
    }

    /// Drain the failures recorded by worker threads since the last call.
    pub fn take_failures(&self) -> Vec<TaskFailure> {
        std::mem::take(&mut *self.failures.lock())
    }

    pub fn failure_count(&self) -> usize {
        self.failures.lock().len()
    }

    /// Drop every source, queued task and counter and start a new generation.
    /// Work still in flight belongs to the old generation and is discarded.
    pub(crate) fn reset(&self) {
        let mut state = self.load_queue.lock();
        self.generation.fetch_add(1, Ordering::AcqRel);
        state.clear();
        self.upload_queue.clear();
        self.progress.reset();
        self.failures.lock().clear();
    }
}
