use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the merge engine.
///
/// Per-line and per-record failures are not represented here; they are
/// counted in the run statistics and the affected line is discarded.
#[derive(Debug, Error)]
pub enum TidemarkError {
    #[error("source I/O error: {0}")]
    SourceIo(#[from] std::io::Error),
    #[error("failed to open '{path}' for reading: {source}")]
    OpenFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt block {generation}: {reason}")]
    CorruptBlock { generation: u64, reason: String },
    #[error("invalid frame: {0}")]
    InvalidFrame(&'static str),
    #[error("checksum mismatch (expected {expected:#010x}, actual {actual:#010x})")]
    ChecksumMismatch { expected: u32, actual: u32 },
    #[error("compression error: {0}")]
    CompressionError(String),
    #[error("decompression error: {0}")]
    DecompressionError(String),
    #[error("pipeline contract violation: {0}")]
    ContractViolation(String),
    #[error("run cancelled")]
    Cancelled,
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<TidemarkError>,
    },
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl TidemarkError {
    pub fn with_context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }
}

pub type Result<T> = std::result::Result<T, TidemarkError>;
