//! Parameter types for image operations.
//!
//! These structs describe *what* to do, not *how*. The transfer engine
//! decides which files to convert or optimize; the [`backend`](super::backend)
//! does the pixel work. Tests swap in a mock backend without touching the
//! transfer logic.
//!
//! ## Types
//!
//! - [`Quality`]: lossy encoding quality, 90.
//! - [`ConvertParams`]: re-encode `source` into `output` in a new format.
//! - [`OptimizeParams`]: re-encode `path` in place, keeping its format.

use super::format::{ConvertTarget, ImageKind};
use std::path::PathBuf;

/// Quality setting for lossy image encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quality(u8);

impl Quality {
    /// Quality as the JPEG encoder takes it.
    pub fn as_u8(self) -> u8 {
        self.0
    }
}

impl Default for Quality {
    fn default() -> Self {
        Self(90)
    }
}

/// Convert a copied file into another format.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvertParams {
    pub source: PathBuf,
    /// Same stem as `source`, new extension. Must not exist yet.
    pub output: PathBuf,
    pub target: ConvertTarget,
    pub quality: Quality,
}

impl ConvertParams {
    /// Parameters for converting `source` next to itself.
    pub fn beside(source: PathBuf, target: ConvertTarget) -> Self {
        let output = source.with_extension(target.extension());
        Self {
            source,
            output,
            target,
            quality: Quality::default(),
        }
    }
}

/// Re-encode a copied file in place to shrink it.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizeParams {
    pub path: PathBuf,
    pub format: ImageKind,
    pub quality: Quality,
}
