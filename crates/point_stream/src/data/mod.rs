// src/data/mod.rs
//! Data handling for the streaming pipeline.
//!
//! This module provides:
//! - Registered point sources and the readers behind them.
//! - The load/upload work units and the GPU-facing batch record.

pub mod source;
pub mod types;

// Re-export commonly used types for convenience.
pub use self::source::{LasFile, PointBlock, PointRecords, PointSource, ReadPoints, SourceKind};
pub use self::types::{Aabb, Batch, BatchMetadata, LoadTask, UploadTask};
