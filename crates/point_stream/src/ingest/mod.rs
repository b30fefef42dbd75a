//! CPU side of the pipeline: registration, queues, encoding and the worker pool.

pub mod encoder;
pub mod queue;
pub mod splitter;
pub mod worker;

pub use queue::{LoadQueue, Popped, Totals, UploadQueue};
pub use splitter::{PendingSource, Registration};
pub use worker::WorkerPool;
