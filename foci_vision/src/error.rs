//! Error types for the foci post-processing engine.
//!
//! Only malformed input and infrastructure failures are errors. Degenerate
//! geometry (empty cages, zero volumes) resolves to 0 inside the algorithms and
//! a failed nearest-nucleus search is an absent assignment, not an error.

use thiserror::Error;

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// Two input volumes that must share a shape do not.
    #[error("Shape mismatch for {what}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Which input failed the check.
        what: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// A configuration value is outside its valid domain.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A chunk worker panicked or was cancelled.
    #[error("Worker failed: {0}")]
    Worker(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration parse error: {0}")]
    Config(#[from] serde_json::Error),
}

impl PipelineError {
    pub fn invalid_config<S: Into<String>>(msg: S) -> Self {
        PipelineError::InvalidConfig(msg.into())
    }

    pub fn shape_mismatch(what: &'static str, expected: &[usize], actual: &[usize]) -> Self {
        PipelineError::ShapeMismatch {
            what,
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}

/// Rejects `actual` when it differs from `expected`.
pub(crate) fn ensure_shape(what: &'static str, expected: &[usize], actual: &[usize]) -> Result<()> {
    if expected != actual {
        return Err(PipelineError::shape_mismatch(what, expected, actual));
    }
    Ok(())
}
