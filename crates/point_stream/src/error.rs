use std::path::PathBuf;
use thiserror::Error;

pub type Result<T, E = StreamError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unsupported input {path}: {reason}")]
    UnsupportedFormat { path: PathBuf, reason: String },

    #[error("source '{source_name}' is missing required attribute '{attribute}'")]
    MissingAttribute {
        source_name: String,
        attribute: &'static str,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("upload of {count} points at offset {offset} exceeds capacity of {capacity}")]
    CapacityExceeded { offset: u64, count: u64, capacity: u64 },

    #[error("write of {len} bytes at {offset} touches uncommitted pages")]
    Uncommitted { offset: u64, len: u64 },

    #[error("GPU error: {0}")]
    Gpu(String),

    #[error("worker panicked: {0}")]
    WorkerPanic(String),
}

impl StreamError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
