use std::{io, path::PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or mismatched inputs (shapes, offsets, configuration).
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    /// Empty trace set, zero-length sample window or empty batch.
    #[error("Degenerate input: {0}")]
    DegenerateInput(String),
    #[error("Failed to load {path}: {reason}")]
    LoadError { path: PathBuf, reason: String },
    #[error("Malformed index record at line {line}: {reason}")]
    ParseError { line: usize, reason: String },
    #[error("Failed to save/load maskcpa data")]
    SaveLoadError(#[from] serde_json::Error),
    #[error(transparent)]
    IoError(#[from] io::Error),
    #[error(transparent)]
    NpyWrite(#[from] ndarray_npy::WriteNpyError),
}
