use std::path::PathBuf;

use thiserror::Error;

/// Failures that abort loading a whole input table.
///
/// Individual malformed rows never surface here; loaders log and skip them.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("input table not found: {}", path.display())]
    MissingInput { path: PathBuf },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, ReconcileError>;
