//! The render-thread facade over the whole pipeline.

use crate::config::StreamConfig;
use crate::context::{StreamContext, TaskFailure};
use crate::data::{Aabb, PointRecords, PointSource};
use crate::error::Result;
use crate::ingest::splitter::{self, Registration};
use crate::ingest::{Totals, WorkerPool};
use crate::sparse::{DrainOutcome, SparseAllocator, SparseBuffer, SparseBufferSet};
use std::path::Path;
use std::sync::Arc;

/// Owns the worker pool and the sparse buffers.
///
/// Registration may be called from any thread that can reach the streamer;
/// [`PointStreamer::drain_one_upload`] must be called from the thread that owns
/// the buffers, once per frame.
pub struct PointStreamer<B> {
    ctx: Arc<StreamContext>,
    pool: WorkerPool,
    buffers: SparseBufferSet<B>,
}

impl<B: SparseBuffer> PointStreamer<B> {
    pub fn new<A>(config: StreamConfig, allocator: &A) -> Result<Self>
    where
        A: SparseAllocator<Buffer = B>,
    {
        let ctx = StreamContext::new(config)?;
        let buffers = SparseBufferSet::new(allocator, &ctx.config)?;
        let pool = WorkerPool::spawn(ctx.clone(), ctx.config.resolved_worker_threads())?;

        Ok(Self { ctx, pool, buffers })
    }

    #[inline]
    pub fn context(&self) -> &Arc<StreamContext> {
        &self.ctx
    }

    pub fn register_files<P: AsRef<Path> + Sync>(&self, paths: &[P]) -> Result<Registration> {
        splitter::register_files(&self.ctx, paths)
    }

    pub fn register_directory(&self, root: impl AsRef<Path>) -> Result<Registration> {
        splitter::register_directory(&self.ctx, root.as_ref())
    }

    pub fn register_records(&self, name: &str, records: PointRecords) -> Result<Registration> {
        splitter::register_records(&self.ctx, name, records)
    }

    /// Upload at most one encoded task.
    pub fn drain_one_upload(&mut self) -> Result<DrainOutcome> {
        self.buffers.drain_one(&self.ctx)
    }

    pub fn num_points_loaded(&self) -> u64 {
        self.ctx.progress.points_loaded()
    }

    pub fn num_batches_loaded(&self) -> u64 {
        self.ctx.progress.batches_loaded()
    }

    pub fn num_points(&self) -> u64 {
        self.ctx.totals().num_points
    }

    pub fn num_batches(&self) -> u64 {
        self.ctx.totals().num_batches
    }

    pub fn totals(&self) -> Totals {
        self.ctx.totals()
    }

    /// Bounds of the most recent registration call.
    pub fn framing_bounds(&self) -> Aabb {
        self.ctx.framing_bounds()
    }

    /// Bounds of every source registered since the last reset.
    pub fn session_bounds(&self) -> Aabb {
        self.ctx.session_bounds()
    }

    pub fn sources(&self) -> Vec<Arc<PointSource>> {
        self.ctx.sources()
    }

    pub fn take_failures(&self) -> Vec<TaskFailure> {
        self.ctx.take_failures()
    }

    pub fn buffers(&self) -> &SparseBufferSet<B> {
        &self.buffers
    }

    pub fn worker_count(&self) -> usize {
        self.pool.len()
    }

    /// Nothing is queued, being encoded or waiting for upload.
    pub fn is_idle(&self) -> bool {
        self.ctx.load_queue.is_drained() && self.ctx.upload_queue.is_empty()
    }

    /// Forget every source and release all buffer pages. Tasks still being
    /// encoded finish in the background and are dropped.
    pub fn reset(&mut self) {
        self.ctx.reset();
        self.buffers.decommit_all();
        log::info!("stream reset, generation {}", self.ctx.generation());
    }

    /// Stop and join the workers. Registration still queues tasks afterwards
    /// but nothing encodes them.
    pub fn shutdown(&mut self) {
        self.pool.shutdown();
    }
}
