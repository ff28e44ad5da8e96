//! Error types for chunkvault

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for chunkvault operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("IO error on {path}: {source}")]
    IoPath {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Invalid argument: {reason}")]
    InvalidArgument { reason: String },

    #[error("Chunk not found: {digest}")]
    ChunkNotFound { digest: String },

    #[error("Snapshot not found: {id}")]
    SnapshotNotFound { id: String },

    #[error("File not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Integrity verification failed: {reason}")]
    Integrity { reason: String },

    #[error("Invalid state: {reason}")]
    State { reason: String },

    #[error("Transient failure: {reason}")]
    Transient { reason: String },

    #[error("Scheduling error: {reason}")]
    Scheduling { reason: String },

    #[error("Invalid configuration: {reason}")]
    Configuration { reason: String },

    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    /// Attach a path to a bare IO error.
    pub fn io_at(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::IoPath {
            path: path.into(),
            source,
        }
    }

    /// True for errors caused by a digest or format mismatch.
    pub fn is_integrity(&self) -> bool {
        matches!(self, Error::Integrity { .. })
    }
}

/// Result type alias for chunkvault operations
pub type Result<T> = std::result::Result<T, Error>;
