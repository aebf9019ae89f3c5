//! The error taxonomy from spec section 7, modeled as a closed enum so the
//! CLI can map each kind to its documented exit code and the orchestrator
//! can distinguish transient from deterministic failures.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CdxError {
    #[error("input unreadable: {path:?}: {source}")]
    InputUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed-record rate {rate:.4} exceeds threshold {threshold:.4} in {path:?}")]
    MalformedRateExceeded {
        path: PathBuf,
        rate: f64,
        threshold: f64,
    },

    #[error("output unwritable: {path:?}: {source}")]
    OutputUnwritable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("insufficient scratch space for {path:?}: need {needed_bytes}, have {available_bytes}")]
    InsufficientScratch {
        path: PathBuf,
        needed_bytes: u64,
        available_bytes: u64,
    },

    #[error("insufficient memory budget: requested {requested_mb}MiB, total budget {total_mb}MiB")]
    InsufficientMemory { requested_mb: u64, total_mb: u64 },

    #[error("artifact corrupted: {path:?}: {reason}")]
    ArtifactCorrupted { path: PathBuf, reason: String },

    #[error("cancelled")]
    Cancelled,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("deadline exceeded")]
    Timeout,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl CdxError {
    /// Whether the orchestrator should retry this failure with backoff
    /// (transient) rather than quarantine the shard/collection
    /// (deterministic). Per spec section 4.6/7.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CdxError::InputUnreadable { .. }
                | CdxError::InsufficientScratch { .. }
                | CdxError::InsufficientMemory { .. }
                | CdxError::Io(_)
        )
    }

    /// The process exit code this error maps to, per spec section 6.
    pub fn exit_code(&self) -> i32 {
        match self {
            CdxError::InvalidArguments(_) => 2,
            CdxError::MalformedRateExceeded { .. } | CdxError::ArtifactCorrupted { .. } => 5,
            CdxError::InsufficientScratch { .. } | CdxError::InsufficientMemory { .. } => 3,
            CdxError::Cancelled => 4,
            CdxError::NotFound(_) => 0,
            CdxError::Timeout => 0,
            _ => 1,
        }
    }
}

impl From<bincode::Error> for CdxError {
    fn from(e: bincode::Error) -> Self {
        CdxError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CdxError>;
