//! Image codec backend trait and shared types.
//!
//! The [`ImageBackend`] trait defines the two pixel-level operations the
//! transfer engine needs after a file has been copied: convert and optimize.
//! Validation never goes through the backend; it works on bytes only.
//!
//! The production implementation is
//! [`RustBackend`](super::rust_backend::RustBackend), built on the `image`
//! crate's pure Rust codecs.

use super::params::{ConvertParams, OptimizeParams};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Processing failed: {0}")]
    ProcessingFailed(String),
}

/// What an optimize pass did to the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizeOutcome {
    /// The re-encoded file was smaller and replaced the original.
    Rewritten { before: u64, after: u64 },
    /// Re-encoding did not help (or the format is skipped); file untouched.
    Unchanged,
}

/// Trait for image codec backends.
pub trait ImageBackend {
    /// Write `params.source` re-encoded as `params.target` to `params.output`.
    /// The source is left in place; the caller removes it.
    fn convert(&self, params: &ConvertParams) -> Result<(), BackendError>;

    /// Re-encode `params.path` in place, keeping its format and extension.
    fn optimize(&self, params: &OptimizeParams) -> Result<OptimizeOutcome, BackendError>;
}
