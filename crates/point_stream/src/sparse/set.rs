//! The five buffers the rasterizer reads, and the render-thread upload step.

use super::{page_aligned, SparseAllocator, SparseBuffer};
use crate::config::{StreamConfig, BATCH_METADATA_BYTES, BYTES_PER_POINT_ATTRIBUTE};
use crate::context::StreamContext;
use crate::data::UploadTask;
use crate::error::{Result, StreamError};
use std::time::Instant;

/// What one call to [`SparseBufferSet::drain_one`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// The upload queue was empty.
    Idle,
    /// A task from before the last reset was dropped.
    Discarded,
    Uploaded {
        point_offset: u64,
        num_points: u64,
        num_batches: u64,
    },
}

pub struct SparseBufferSet<B> {
    pub xyz_low: B,
    pub xyz_med: B,
    pub xyz_high: B,
    pub colors: B,
    /// 64-byte batch records, packed in upload order.
    pub batches: B,
    max_points: u64,
}

impl<B: SparseBuffer> SparseBufferSet<B> {
    pub fn new<A>(allocator: &A, config: &StreamConfig) -> Result<Self>
    where
        A: SparseAllocator<Buffer = B>,
    {
        let attribute_bytes = config.max_points * BYTES_PER_POINT_ATTRIBUTE;
        let metadata_bytes = config.max_batches() * BATCH_METADATA_BYTES;

        Ok(Self {
            xyz_low: allocator.allocate("xyz_low", attribute_bytes)?,
            xyz_med: allocator.allocate("xyz_med", attribute_bytes)?,
            xyz_high: allocator.allocate("xyz_high", attribute_bytes)?,
            colors: allocator.allocate("colors", attribute_bytes)?,
            batches: allocator.allocate("batches", metadata_bytes)?,
            max_points: config.max_points,
        })
    }

    /// Attribute buffers in the order of [`UploadTask::attribute_bytes`].
    pub fn attributes(&self) -> [&B; 4] {
        [&self.xyz_low, &self.xyz_med, &self.xyz_high, &self.colors]
    }

    fn attributes_mut(&mut self) -> [&mut B; 4] {
        [&mut self.xyz_low, &mut self.xyz_med, &mut self.xyz_high, &mut self.colors]
    }

    pub fn committed_bytes(&self) -> u64 {
        self.attributes().iter().map(|b| b.committed_bytes()).sum::<u64>() + self.batches.committed_bytes()
    }

    pub fn decommit_all(&mut self) {
        for buffer in self.attributes_mut() {
            buffer.decommit_all();
        }
        self.batches.decommit_all();
    }

    /// Pop one upload task and make it visible to the rasterizer.
    ///
    /// A task that would write past the end of any buffer is dropped with
    /// `CapacityExceeded` before anything is committed. A task whose commit
    /// or write fails is dropped the same way. Either way the progress
    /// counters are left alone and the source is marked failed.
    pub fn drain_one(&mut self, ctx: &StreamContext) -> Result<DrainOutcome> {
        let Some(task) = ctx.upload_queue.pop() else {
            return Ok(DrainOutcome::Idle);
        };

        if task.generation() != ctx.generation() {
            log::debug!("discarding upload of '{}' from an earlier session", task.source.name);
            return Ok(DrainOutcome::Discarded);
        }

        let started = Instant::now();
        let batch_cursor = ctx.progress.batches_loaded();
        if let Err(err) = self
            .check_bounds(&task, batch_cursor)
            .and_then(|()| self.upload(&task, batch_cursor))
        {
            log::error!("rejected upload of '{}': {}", task.source.name, err);
            ctx.progress.reject();
            task.source.mark_failed();
            return Err(err);
        }

        ctx.progress.advance(task.num_points, task.num_batches);
        task.source.record_upload(task.num_points, task.num_batches);

        log::debug!(
            "uploaded {} points ({} batches) at {} in {:.2} ms",
            task.num_points,
            task.num_batches,
            task.point_offset,
            started.elapsed().as_secs_f64() * 1e3
        );

        Ok(DrainOutcome::Uploaded {
            point_offset: task.point_offset,
            num_points: task.num_points,
            num_batches: task.num_batches,
        })
    }

    fn check_bounds(&self, task: &UploadTask, batch_cursor: u64) -> Result<()> {
        if task.point_offset + task.num_points > self.max_points {
            return Err(StreamError::CapacityExceeded {
                offset: task.point_offset,
                count: task.num_points,
                capacity: self.max_points,
            });
        }

        let metadata_end = (batch_cursor + task.num_batches) * BATCH_METADATA_BYTES;
        if metadata_end > self.batches.capacity() {
            return Err(StreamError::CapacityExceeded {
                offset: batch_cursor,
                count: task.num_batches,
                capacity: self.batches.capacity() / BATCH_METADATA_BYTES,
            });
        }

        Ok(())
    }

    fn upload(&mut self, task: &UploadTask, batch_cursor: u64) -> Result<()> {
        if task.is_empty() {
            return Ok(());
        }

        store(&mut self.batches, batch_cursor * BATCH_METADATA_BYTES, task.batch_bytes())?;

        let offset = task.point_offset * BYTES_PER_POINT_ATTRIBUTE;
        for (buffer, bytes) in self.attributes_mut().into_iter().zip(task.attribute_bytes()) {
            store(buffer, offset, bytes)?;
        }

        Ok(())
    }
}

/// Commit the pages under `offset..offset + bytes.len()` and copy `bytes` in.
fn store<B: SparseBuffer>(buffer: &mut B, offset: u64, bytes: &[u8]) -> Result<()> {
    let range = page_aligned(offset, bytes.len() as u64, buffer.page_size(), buffer.capacity());
    buffer
        .commit(range)
        .and_then(|()| buffer.write(offset, bytes))
        .map_err(|err| {
            log::warn!("'{}': {} bytes at {}: {}", buffer.label(), bytes.len(), offset, err);
            err
        })
}
