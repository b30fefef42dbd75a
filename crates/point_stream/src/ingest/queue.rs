//! The two hand-off points of the pipeline.
//!
//! `LoadQueue` also owns the registered totals and bounds: they change in the
//! same critical section that enqueues a source's tasks, so a reader never
//! sees tasks without the totals that account for them (or the reverse).

use crate::data::{Aabb, LoadTask, PointSource, UploadTask};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::Arc;
use std::time::Duration;

/// Totals over every source registered in the current session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Totals {
    pub num_points: u64,
    pub num_batches: u64,
    pub num_sources: u32,
}

#[derive(Debug)]
pub struct LoadState {
    tasks: Vec<LoadTask>,
    pub totals: Totals,
    /// Registered sources, in registration order.
    pub sources: Vec<Arc<PointSource>>,
    /// Union of every source box of the session.
    pub session_bounds: Aabb,
    /// Union of the boxes registered by the most recent call, for camera framing.
    pub framing_bounds: Aabb,
    /// Tasks popped but not yet reported back with `task_done`.
    in_flight: usize,
    stopped: bool,
}

impl LoadState {
    pub fn push(&mut self, task: LoadTask) {
        self.tasks.push(task);
    }

    #[inline]
    pub fn pending(&self) -> usize {
        self.tasks.len()
    }

    fn pop(&mut self) -> Option<LoadTask> {
        let task = self.tasks.pop()?;
        self.in_flight += 1;
        Some(task)
    }

    /// Forget every queued task, source and total. The stop flag and the
    /// in-flight count are kept.
    pub fn clear(&mut self) {
        self.tasks.clear();
        self.totals = Totals::default();
        self.sources.clear();
        self.session_bounds = Aabb::EMPTY;
        self.framing_bounds = Aabb::EMPTY;
    }
}

pub enum Popped {
    Task(LoadTask),
    Empty,
    Stopped,
}

#[derive(Debug)]
pub struct LoadQueue {
    state: Mutex<LoadState>,
    ready: Condvar,
}

impl Default for LoadQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LoadState {
                tasks: Vec::new(),
                totals: Totals::default(),
                sources: Vec::new(),
                session_bounds: Aabb::EMPTY,
                framing_bounds: Aabb::EMPTY,
                in_flight: 0,
                stopped: false,
            }),
            ready: Condvar::new(),
        }
    }

    /// Exclusive access for registration. Call [`LoadQueue::notify`] after
    /// releasing the guard when tasks were pushed.
    pub fn lock(&self) -> MutexGuard<'_, LoadState> {
        self.state.lock()
    }

    pub fn notify(&self) {
        self.ready.notify_all();
    }

    /// Pop without waiting. Like [`LoadQueue::pop_wait`], a returned task
    /// counts as in flight until [`LoadQueue::task_done`].
    pub fn try_pop(&self) -> Option<LoadTask> {
        self.state.lock().pop()
    }

    pub fn task_done(&self) {
        let mut state = self.state.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
    }

    /// No task is queued or being worked on.
    pub fn is_drained(&self) -> bool {
        let state = self.state.lock();
        state.tasks.is_empty() && state.in_flight == 0
    }

    /// Pop one task, sleeping up to `timeout` while the queue is empty.
    /// The lock is released before the task is returned.
    pub fn pop_wait(&self, timeout: Duration) -> Popped {
        let mut state = self.state.lock();

        if state.stopped {
            return Popped::Stopped;
        }

        if state.tasks.is_empty() {
            self.ready.wait_for(&mut state, timeout);
            if state.stopped {
                return Popped::Stopped;
            }
        }

        match state.pop() {
            Some(task) => Popped::Task(task),
            None => Popped::Empty,
        }
    }

    pub fn stop(&self) {
        self.state.lock().stopped = true;
        self.ready.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    pub fn len(&self) -> usize {
        self.state.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn totals(&self) -> Totals {
        self.state.lock().totals
    }
}

#[derive(Debug, Default)]
pub struct UploadQueue {
    tasks: Mutex<Vec<UploadTask>>,
}

impl UploadQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, task: UploadTask) {
        self.tasks.lock().push(task);
    }

    pub fn pop(&self) -> Option<UploadTask> {
        self.tasks.lock().pop()
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.tasks.lock().clear();
    }
}
