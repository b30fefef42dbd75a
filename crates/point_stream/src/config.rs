//! Pipeline sizing constants and the runtime configuration.

use crate::error::{Result, StreamError};
use std::time::Duration;

/// Threads per workgroup of the consuming rasterizer.
pub const WORKGROUP_SIZE: u64 = 128;

/// Points each rasterizer thread walks through.
pub const POINTS_PER_THREAD: u64 = 80;

/// Nominal batch size; one batch is one workgroup dispatch.
pub const POINTS_PER_BATCH: u64 = WORKGROUP_SIZE * POINTS_PER_THREAD;

/// Stride of one batch metadata record in the metadata buffer.
pub const BATCH_METADATA_BYTES: u64 = 64;

/// Every per-point attribute is one packed u32.
pub const BYTES_PER_POINT_ATTRIBUTE: u64 = 4;

pub const DEFAULT_MAX_POINTS: u64 = 1_000_000_000;

/// Roughly a million points per load task.
pub const DEFAULT_POINTS_PER_TASK: u64 = 100 * POINTS_PER_BATCH;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Capacity of the global point index space. Also the per-source clamp.
    pub max_points: u64,
    /// Ceiling on points per load task. Must be a multiple of `POINTS_PER_BATCH`.
    pub points_per_task: u64,
    /// Worker count; `None` derives it from the available cores.
    pub worker_threads: Option<usize>,
    /// Upper bound on how long an idle worker sleeps before re-checking the queue.
    pub poll_interval: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_points: DEFAULT_MAX_POINTS,
            points_per_task: DEFAULT_POINTS_PER_TASK,
            worker_threads: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl StreamConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_points == 0 || self.max_points > u32::MAX as u64 {
            return Err(StreamError::InvalidConfig(format!(
                "max_points must be in 1..={}, got {}",
                u32::MAX,
                self.max_points
            )));
        }

        if self.points_per_task == 0 || self.points_per_task % POINTS_PER_BATCH != 0 {
            return Err(StreamError::InvalidConfig(format!(
                "points_per_task must be a non-zero multiple of {}, got {}",
                POINTS_PER_BATCH, self.points_per_task
            )));
        }

        if self.worker_threads == Some(0) {
            return Err(StreamError::InvalidConfig(
                "worker_threads must be at least 1".into(),
            ));
        }

        Ok(())
    }

    /// Largest number of batches the metadata buffer has to address.
    ///
    /// Every source may end in a short batch, so the only hard bound is one
    /// point per batch. The buffer is sparse; only touched pages are backed.
    #[inline]
    pub fn max_batches(&self) -> u64 {
        self.max_points
    }

    pub fn resolved_worker_threads(&self) -> usize {
        self.worker_threads.unwrap_or_else(|| {
            let cores = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1);
            worker_count_for(cores)
        })
    }
}

/// Encoder threads for a given core count. Leaves cores free for the render thread.
pub fn worker_count_for(cores: usize) -> usize {
    match cores {
        0..=2 => 1,
        3 => 2,
        4 => 3,
        5 | 6 => 4,
        7 | 8 => 5,
        n => n / 2 + 1,
    }
}
