//! Byte ceilings for single files and whole batches.
//!
//! Configuration may lower the ceilings but never raise them. The clamp runs
//! every time a limit is read rather than when the config is written, so a
//! hand-edited config file cannot lift a limit past the hard maximum.
//!
//! | Limit | Hard maximum | Non-positive configured value |
//! |---|---|---|
//! | Per file | 50 MiB | hard maximum |
//! | Aggregate per batch | 200 MiB | hard maximum (never "unlimited") |

use std::fmt;
use thiserror::Error;

const MIB: u64 = 1024 * 1024;

/// No single file larger than this is ever admitted.
pub const HARD_MAX_FILE_BYTES: u64 = 50 * MIB;

/// No batch whose admitted files sum past this is ever copied.
pub const HARD_MAX_TOTAL_BYTES: u64 = 200 * MIB;

/// Decoded pixel ceiling (width × height). Independent of on-disk size.
pub const MAX_IMAGE_PIXELS: u64 = 89_000_000;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SizeViolation {
    #[error("File too large: {} (maximum: {})", mb(.size), mb(.limit))]
    PerFile { size: u64, limit: u64 },
    #[error("Batch too large: {} in total (maximum: {})", mb(.total), mb(.limit))]
    Aggregate { total: u64, limit: u64 },
}

/// Byte count rendered as `51.00MB`.
pub struct Megabytes(pub u64);

fn mb(bytes: &u64) -> Megabytes {
    Megabytes(*bytes)
}

impl fmt::Display for Megabytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}MB", self.0 as f64 / MIB as f64)
    }
}

/// Configured limits, stored as given and clamped on every read.
///
/// Values are megabytes as they appear in the config file; `None` means the
/// key is absent and the hard maximum applies.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SizeLimits {
    per_file_mb: Option<f64>,
    aggregate_mb: Option<f64>,
}

impl SizeLimits {
    pub fn new(per_file_mb: Option<f64>, aggregate_mb: Option<f64>) -> Self {
        Self {
            per_file_mb,
            aggregate_mb,
        }
    }

    /// Limits equal to the hard maxima.
    pub fn hard() -> Self {
        Self::default()
    }

    /// Effective per-file ceiling in bytes.
    pub fn per_file(&self) -> u64 {
        clamp_mb(self.per_file_mb, HARD_MAX_FILE_BYTES)
    }

    /// Effective aggregate ceiling in bytes.
    pub fn aggregate(&self) -> u64 {
        clamp_mb(self.aggregate_mb, HARD_MAX_TOTAL_BYTES)
    }

    pub fn check_file(&self, len: u64) -> Result<(), SizeViolation> {
        let limit = self.per_file();
        if len > limit {
            return Err(SizeViolation::PerFile { size: len, limit });
        }
        Ok(())
    }

    /// Add `len` to `running_total`, returning the new total if it still fits.
    pub fn check_aggregate(&self, running_total: u64, len: u64) -> Result<u64, SizeViolation> {
        let limit = self.aggregate();
        let total = running_total.saturating_add(len);
        if total > limit {
            return Err(SizeViolation::Aggregate { total, limit });
        }
        Ok(total)
    }
}

/// `min(configured, hard)`, where absent, non-positive, or non-finite
/// configured values fall back to `hard`.
fn clamp_mb(configured_mb: Option<f64>, hard: u64) -> u64 {
    match configured_mb {
        Some(value) if value.is_finite() && value > 0.0 => {
            let bytes = value * MIB as f64;
            if bytes >= hard as f64 {
                hard
            } else {
                // Truncation is fine: a fractional byte cannot be admitted.
                bytes as u64
            }
        }
        _ => hard,
    }
}
