//! The fetch command: from a source directory (or one explicit file) to
//! rendered links in the destination.
//!
//! ```text
//! config ──► candidates ──► screen ──► transfer ──► stage ──► render
//!            (PathGuard)    (validate,   (copy,       (git)
//!                            sizes)       convert)
//! ```
//!
//! `--no-transfer` stops after screening: it loads the config read-only,
//! writes nothing and prints the admitted source paths.

use crate::config::{Config, ConfigError, ConfigStore};
use crate::git::{VersionControl, repo_image_dir, stage_all};
use crate::imaging::{ConvertTarget, ImageBackend};
use crate::output::{OutputStyle, format_paths};
use crate::paths::{AuthorizedPath, PathError, PathRole, authorize, discover_candidates};
use crate::transfer::{Rejection, TransferError, TransferOptions, TransferOutcome, screen, transfer};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum FetchError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Path(#[from] PathError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("No source directory configured. Pass --source or run `wslshot configure --source <dir>`")]
    NoSource,
    #[error("--count must be at least 1")]
    InvalidCount,
}

impl FetchError {
    /// Process exit status for this error.
    pub fn status(&self) -> FetchStatus {
        match self {
            Self::Io(_) | Self::Path(PathError::Io { .. }) => FetchStatus::IoFailure,
            Self::Config(e) if e.is_io() => FetchStatus::IoFailure,
            _ => FetchStatus::NothingTransferred,
        }
    }
}

/// How a fetch ended, as seen by the shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    /// Every candidate was transferred (or, with `--no-transfer`, admitted).
    Complete,
    /// Nothing was transferred: rejections, limits or a usage error.
    NothingTransferred,
    /// Some candidates made it, others did not.
    Partial,
    /// An I/O error stopped every copy.
    IoFailure,
}

impl FetchStatus {
    pub fn code(self) -> i32 {
        match self {
            Self::Complete => 0,
            Self::NothingTransferred => 1,
            Self::Partial => 2,
            Self::IoFailure => 3,
        }
    }
}

/// Everything the fetch command can be told on the command line.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub source: Option<PathBuf>,
    pub destination: Option<PathBuf>,
    /// Fetch this one file instead of discovering the newest ones.
    pub image_path: Option<PathBuf>,
    pub count: usize,
    pub output_style: Option<OutputStyle>,
    pub convert_to: Option<ConvertTarget>,
    pub optimize: bool,
    pub no_transfer: bool,
    pub allow_symlinks: bool,
}

impl Default for FetchRequest {
    fn default() -> Self {
        Self {
            source: None,
            destination: None,
            image_path: None,
            count: 1,
            output_style: None,
            convert_to: None,
            optimize: false,
            no_transfer: false,
            allow_symlinks: false,
        }
    }
}

/// Collaborators a fetch runs against.
pub struct FetchEnv<'a> {
    pub store: &'a ConfigStore,
    pub backend: &'a dyn ImageBackend,
    pub vcs: &'a dyn VersionControl,
    pub working_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct FetchReport {
    /// Rendered output, one line per delivered file.
    pub lines: Vec<String>,
    pub outcomes: Vec<TransferOutcome>,
    pub rejected: Vec<Rejection>,
    pub status: FetchStatus,
}

pub fn run(request: &FetchRequest, env: &FetchEnv<'_>) -> Result<FetchReport, FetchError> {
    if request.count == 0 {
        return Err(FetchError::InvalidCount);
    }
    // Flag conflicts are usage errors; report them before touching the disk.
    TransferOptions::resolve(request.convert_to, None, request.optimize, request.no_transfer)?;

    let loaded = if request.no_transfer {
        env.store.load_read_only(request.allow_symlinks)?
    } else {
        env.store.load(request.allow_symlinks)?
    };
    let config = loaded.config;
    let options = TransferOptions::resolve(
        request.convert_to,
        config.default_convert_to,
        request.optimize,
        request.no_transfer,
    )?;

    let paths = candidate_paths(request, &config)?;
    let screening = screen(&paths, &config.limits(), request.allow_symlinks)?;
    let repo_root = env.vcs.repo_root(&env.working_dir);

    if request.no_transfer {
        let style = request.output_style.unwrap_or(OutputStyle::Text);
        let sources: Vec<&Path> = screening.admitted.iter().map(|c| c.source.as_path()).collect();
        let status = status_of(sources.len(), &[], &screening.rejected);
        return Ok(FetchReport {
            lines: format_paths(style, &sources, None),
            outcomes: Vec::new(),
            rejected: screening.rejected,
            status,
        });
    }

    let mut outcomes = if screening.admitted.is_empty() {
        Vec::new()
    } else {
        let destination =
            resolve_destination(request, &config, repo_root.as_deref(), &env.working_dir)?;
        debug!(destination = %crate::sanitize::redact(destination.as_path()), "destination resolved");
        transfer(&screening.admitted, destination.as_path(), &options, env.backend)
    };

    if let Some(root) = repo_root.as_deref().filter(|_| config.auto_stage_enabled) {
        let delivered: Vec<PathBuf> = outcomes
            .iter()
            .filter_map(|o| o.destination.clone())
            .collect();
        let report = stage_all(env.vcs, root, &delivered);
        for outcome in &mut outcomes {
            outcome.staged = outcome
                .destination
                .as_deref()
                .is_some_and(|d| report.is_staged(d));
        }
    }

    let delivered: Vec<&Path> = outcomes
        .iter()
        .filter_map(|o| o.destination.as_deref())
        .collect();
    let style = request.output_style.unwrap_or(config.default_output_format);
    let lines = format_paths(style, &delivered, repo_root.as_deref());
    let successes = outcomes.iter().filter(|o| o.is_success()).count();
    let status = status_of(successes, &outcomes, &screening.rejected);
    info!(transferred = successes, rejected = screening.rejected.len(), "fetch finished");

    Ok(FetchReport {
        lines,
        outcomes,
        rejected: screening.rejected,
        status,
    })
}

fn status_of(successes: usize, outcomes: &[TransferOutcome], rejected: &[Rejection]) -> FetchStatus {
    let failures = rejected.len() + outcomes.iter().filter(|o| !o.is_success()).count();
    match (successes, failures) {
        (_, 0) if successes > 0 => FetchStatus::Complete,
        (0, _) if outcomes.iter().any(TransferOutcome::copy_failed) => FetchStatus::IoFailure,
        (0, _) => FetchStatus::NothingTransferred,
        _ => FetchStatus::Partial,
    }
}

/// The explicit image, or the `count` newest images in the source directory.
fn candidate_paths(request: &FetchRequest, config: &Config) -> Result<Vec<PathBuf>, FetchError> {
    if let Some(image) = &request.image_path {
        let image = authorize(image, PathRole::ImageFile, request.allow_symlinks)?;
        return Ok(vec![image.into_path_buf()]);
    }
    let source = match &request.source {
        Some(source) => source.clone(),
        None if !config.default_source.is_empty() => PathBuf::from(&config.default_source),
        None => return Err(FetchError::NoSource),
    };
    let source = authorize(&source, PathRole::SourceDir, request.allow_symlinks)?;
    Ok(discover_candidates(&source, request.count, request.allow_symlinks)?)
}

/// `--destination`, then the repository's image directory, then the
/// configured default, then the working directory.
fn resolve_destination(
    request: &FetchRequest,
    config: &Config,
    repo_root: Option<&Path>,
    working_dir: &Path,
) -> Result<AuthorizedPath, FetchError> {
    let allow = request.allow_symlinks;
    let chosen = if let Some(destination) = &request.destination {
        destination.clone()
    } else if let Some(root) = repo_root {
        repo_image_dir(root, allow)?
    } else if !config.default_destination.is_empty() {
        PathBuf::from(&config.default_destination)
    } else {
        working_dir.to_path_buf()
    };
    Ok(authorize(&chosen, PathRole::DestinationDir, allow)?)
}
