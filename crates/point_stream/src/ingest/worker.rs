//! Encoder threads: load queue in, upload queue out.

use crate::context::StreamContext;
use crate::data::LoadTask;
use crate::error::{Result, StreamError};
use crate::ingest::encoder;
use crate::ingest::queue::Popped;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

pub struct WorkerPool {
    ctx: Arc<StreamContext>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(ctx: Arc<StreamContext>, threads: usize) -> Result<Self> {
        let mut handles = Vec::with_capacity(threads);
        for i in 0..threads {
            let worker_ctx = ctx.clone();
            let handle = thread::Builder::new()
                .name(format!("point-stream-worker-{}", i))
                .spawn(move || run(&worker_ctx))
                .map_err(|e| StreamError::io(format!("<worker {}>", i), e))?;
            handles.push(handle);
        }
        log::info!("started {} encoder threads", threads);
        Ok(Self { ctx, handles })
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Stop and join every worker. Queued tasks are left in the queue.
    pub fn shutdown(&mut self) {
        if self.handles.is_empty() {
            return;
        }
        self.ctx.load_queue.stop();
        for handle in self.handles.drain(..) {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if handle.join().is_err() {
                log::error!("{} exited with a panic", name);
            }
        }
        log::debug!("encoder threads stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(ctx: &StreamContext) {
    loop {
        let task = match ctx.load_queue.pop_wait(ctx.config.poll_interval) {
            Popped::Task(task) => task,
            Popped::Empty => continue,
            Popped::Stopped => return,
        };

        if task.generation() == ctx.generation() {
            process(ctx, &task);
        } else {
            log::debug!("dropping stale task of '{}'", task.source.name);
        }
        ctx.load_queue.task_done();
    }
}

fn process(ctx: &StreamContext, task: &LoadTask) {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| encoder::encode(task)));

    // A reset may have happened while encoding.
    if task.generation() != ctx.generation() {
        log::debug!("dropping result of stale task of '{}'", task.source.name);
        return;
    }

    match outcome {
        Ok(Ok(upload)) => ctx.upload_queue.push(upload),
        Ok(Err(err)) => ctx.record_failure(task, err),
        Err(payload) => {
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            ctx.record_failure(task, StreamError::WorkerPanic(msg));
        }
    }
}
