// src/lib.rs
//! Progressive point-cloud streaming library.
//!
//! Registered sources are cut into load tasks, encoded on a pool of worker
//! threads into a tiered 30-bit position layout, and uploaded by the render
//! thread into sparse buffers that only commit the pages they touch. Each
//! upload becomes visible to a compute rasterizer as soon as it lands.

pub mod config;
pub mod context;
pub mod data;
pub mod error;
pub mod ingest;
pub mod sparse;
pub mod streamer;

pub use config::StreamConfig;
pub use context::{StreamContext, TaskFailure};
pub use data::{Aabb, PointRecords, PointSource};
pub use error::{Result, StreamError};
pub use ingest::Registration;
pub use sparse::{DrainOutcome, HostAllocator, SparseBuffer, WgpuAllocator};
pub use streamer::PointStreamer;
