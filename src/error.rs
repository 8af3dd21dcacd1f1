//! Error taxonomy shared by every component

use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by store, registry, compiler and download operations
#[derive(Debug, Error)]
pub enum SwapError {
    /// Unknown alias or model id
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    /// Duplicate id on a non-overwrite write
    #[error("{0}")]
    Conflict(String),

    /// Validation failure (missing artifact, port collision, bad argument type)
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Download(#[from] DownloadError),

    /// Disk I/O, permission or record format failure
    #[error("storage error at {path:?}: {message}")]
    Storage { path: PathBuf, message: String },
}

pub type SwapResult<T> = Result<T, SwapError>;

impl SwapError {
    pub fn model_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "model",
            name: id.into(),
        }
    }

    pub fn alias_not_found(alias: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "alias",
            name: alias.into(),
        }
    }

    pub fn storage(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        Self::Storage {
            path: path.into(),
            message: err.to_string(),
        }
    }

    /// Process exit code for this error class
    pub fn exit_code(&self) -> i32 {
        match self {
            SwapError::NotFound { .. } => 2,
            SwapError::Conflict(_) => 3,
            SwapError::Config(_) => 4,
            SwapError::Download(_) => 5,
            SwapError::Storage { .. } => 6,
        }
    }
}

/// Download failures that survive the retry loop
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Final size or checksum does not match what the hub advertised
    #[error("integrity check failed for {file}: {reason}")]
    Integrity { file: String, reason: String },

    /// Transient failures kept happening until the attempt ceiling
    #[error("download of {file} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        file: String,
        attempts: u32,
        last_error: String,
    },

    /// Interrupted by the operator; partial data kept for resume
    #[error("download of {file} cancelled at {bytes} bytes")]
    Cancelled { file: String, bytes: u64 },

    /// Non-retryable answer from the hub (404, 401, ...)
    #[error("hub rejected {file}: {reason}")]
    Remote { file: String, reason: String },

    #[error("local I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
