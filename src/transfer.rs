//! Screening and copying candidates into the destination.
//!
//! The engine runs in two phases so a batch is never half copied because of
//! a size problem:
//!
//! 1. [`screen`] reads every candidate, validates its bytes and sums the
//!    admitted sizes. Exceeding the aggregate ceiling aborts the batch here,
//!    before anything is written.
//! 2. [`transfer`] writes each admitted candidate's validated bytes under a
//!    random name, then converts or optimizes the copy.
//!
//! The bytes written are the bytes that were validated; the source is never
//! read twice.

use crate::atomic::{OWNER_WRITE_WORLD_READ, Replace, write_atomic};
use crate::imaging::{
    ConvertParams, ConvertTarget, ImageBackend, ImageKind, OptimizeOutcome, OptimizeParams,
    Quality, RejectReason, ValidationOutcome, validate,
};
use crate::limits::{SizeLimits, SizeViolation};
use crate::paths::read_candidate;
use crate::sanitize::{redact, user_message_with};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("{0}")]
    SizeExceeded(#[from] SizeViolation),
    #[error("--optimize cannot be combined with --convert-to")]
    OptimizeWithConvert,
    #[error("--optimize cannot be combined with --no-transfer")]
    OptimizeWithNoTransfer,
}

/// A candidate that passed every check, with the bytes that were checked.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub source: PathBuf,
    pub format: ImageKind,
    pub pixel_count: u64,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub source: PathBuf,
    pub reason: RejectReason,
}

#[derive(Debug, Clone, Default)]
pub struct Screening {
    pub admitted: Vec<Candidate>,
    pub rejected: Vec<Rejection>,
}

/// Read and validate every path. Individual rejections are collected; an
/// aggregate overflow among the admitted files fails the whole batch.
pub fn screen(
    paths: &[PathBuf],
    limits: &SizeLimits,
    allow_symlinks: bool,
) -> Result<Screening, TransferError> {
    let mut screening = Screening::default();
    let mut running_total = 0;

    for path in paths {
        let reject = |reason: RejectReason| {
            warn!(path = %redact(path), %reason, "rejected");
            Rejection {
                source: path.clone(),
                reason,
            }
        };

        let bytes = match read_candidate(path, limits, allow_symlinks) {
            Ok(bytes) => bytes,
            Err(reason) => {
                screening.rejected.push(reject(reason));
                continue;
            }
        };

        match validate(&bytes, ImageKind::from_path(path)) {
            ValidationOutcome::Accepted {
                format,
                pixel_count,
            } => {
                running_total = limits.check_aggregate(running_total, bytes.len() as u64)?;
                debug!(path = %redact(path), %format, pixel_count, "admitted");
                screening.admitted.push(Candidate {
                    source: path.clone(),
                    format,
                    pixel_count,
                    bytes,
                });
            }
            ValidationOutcome::Rejected(reason) => screening.rejected.push(reject(reason)),
        }
    }
    Ok(screening)
}

/// What to do to each copy after it lands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferOptions {
    pub convert_to: Option<ConvertTarget>,
    pub optimize: bool,
    pub quality: Quality,
}

impl TransferOptions {
    /// Combine command-line flags with the configured default conversion.
    ///
    /// `--optimize` conflicts with an explicit `--convert-to` and with
    /// `--no-transfer`. Against a configured default conversion it wins and
    /// the conversion is skipped for this run.
    pub fn resolve(
        explicit: Option<ConvertTarget>,
        configured: Option<ConvertTarget>,
        optimize: bool,
        no_transfer: bool,
    ) -> Result<Self, TransferError> {
        if optimize && explicit.is_some() {
            return Err(TransferError::OptimizeWithConvert);
        }
        if optimize && no_transfer {
            return Err(TransferError::OptimizeWithNoTransfer);
        }
        let convert_to = if optimize {
            if let Some(target) = configured {
                debug!(%target, "optimize requested, skipping configured conversion");
            }
            None
        } else {
            explicit.or(configured)
        };
        Ok(Self {
            convert_to,
            optimize,
            quality: Quality::default(),
        })
    }
}

/// Result for one admitted candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferOutcome {
    pub source: PathBuf,
    /// Final location, or `None` if the copy itself failed.
    pub destination: Option<PathBuf>,
    pub conversion: Option<ConvertTarget>,
    pub optimized: Option<OptimizeOutcome>,
    pub staged: bool,
    /// Sanitized description of the step that failed, if any.
    pub failure: Option<String>,
}

impl TransferOutcome {
    fn new(source: PathBuf) -> Self {
        Self {
            source,
            destination: None,
            conversion: None,
            optimized: None,
            staged: false,
            failure: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.destination.is_some() && self.failure.is_none()
    }

    /// The copy never made it to the destination.
    pub fn copy_failed(&self) -> bool {
        self.destination.is_none()
    }
}

/// Random file name for a copy of `source`. The source extension is kept
/// (lower-cased) when it agrees with the detected format.
pub fn output_name(source: &Path, format: ImageKind) -> String {
    let extension = source
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .filter(|e| ImageKind::from_extension(e) == Some(format))
        .unwrap_or_else(|| format.canonical_extension().to_string());
    format!("{}.{extension}", Uuid::new_v4().simple())
}

/// Copy each candidate into `destination` and apply `options`.
pub fn transfer(
    candidates: &[Candidate],
    destination: &Path,
    options: &TransferOptions,
    backend: &dyn ImageBackend,
) -> Vec<TransferOutcome> {
    candidates
        .iter()
        .map(|candidate| transfer_one(candidate, destination, options, backend))
        .collect()
}

fn transfer_one(
    candidate: &Candidate,
    destination: &Path,
    options: &TransferOptions,
    backend: &dyn ImageBackend,
) -> TransferOutcome {
    let mut outcome = TransferOutcome::new(candidate.source.clone());
    let copy = destination.join(output_name(&candidate.source, candidate.format));

    if let Err(e) = write_atomic(&copy, &candidate.bytes, OWNER_WRITE_WORLD_READ, Replace::NoClobber)
    {
        warn!(path = %redact(&candidate.source), error = %e, "copy failed");
        outcome.failure = Some(format!(
            "Copy failed: {}",
            user_message_with(&e, &[&candidate.source, &copy])
        ));
        return outcome;
    }
    info!(
        source = %redact(&candidate.source),
        destination = %redact(&copy),
        bytes = candidate.bytes.len(),
        "copied"
    );
    outcome.destination = Some(copy.clone());

    if let Some(target) = options.convert_to {
        let extension = copy.extension().and_then(|e| e.to_str()).unwrap_or_default();
        if target.matches_extension(extension) {
            debug!(%target, "already in target format, skipping conversion");
        } else {
            let params = ConvertParams {
                quality: options.quality,
                ..ConvertParams::beside(copy.clone(), target)
            };
            match backend.convert(&params) {
                Ok(()) => {
                    if let Err(e) = fs::remove_file(&copy) {
                        warn!(path = %redact(&copy), error = %e, "could not remove pre-conversion copy");
                    }
                    outcome.destination = Some(params.output);
                    outcome.conversion = Some(target);
                }
                Err(e) => {
                    warn!(path = %redact(&copy), error = %e, "conversion failed");
                    outcome.failure = Some(format!(
                        "Conversion failed: {}",
                        user_message_with(&e, &[&copy, &params.output])
                    ));
                }
            }
        }
    }

    if options.optimize {
        let params = OptimizeParams {
            path: copy,
            format: candidate.format,
            quality: options.quality,
        };
        match backend.optimize(&params) {
            Ok(result) => {
                if let OptimizeOutcome::Rewritten { before, after } = result {
                    debug!(before, after, "optimized");
                }
                outcome.optimized = Some(result);
            }
            Err(e) => {
                warn!(path = %redact(&params.path), error = %e, "optimization failed");
                outcome.failure = Some(format!(
                    "Optimization failed: {}",
                    user_message_with(&e, &[&params.path])
                ));
            }
        }
    }

    outcome
}
