//! Git collaboration: repository detection, image directory choice and
//! staging of transferred files.
//!
//! Staging is best effort. All paths are first added in a single
//! `git add`; if that fails each path is retried on its own so one bad path
//! does not block the rest. A missing `git` binary skips staging entirely.

use crate::paths::{PathError, create_dir_safely};
use crate::sanitize::{redact, sanitize_message};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Image directories looked for at the repository root, in priority order.
pub const IMAGE_DIR_CANDIDATES: [&str; 4] = ["img", "images", "assets/img", "assets/images"];

#[derive(Error, Debug)]
pub enum StagingError {
    #[error("git is not available")]
    Unavailable,
    #[error("git add failed: {0}")]
    Failed(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// The version-control operations the fetch pipeline needs.
pub trait VersionControl {
    /// Top level of the work tree containing `dir`, if any.
    fn repo_root(&self, dir: &Path) -> Option<PathBuf>;

    /// Stage `paths` (relative to `repo_root`) in one call.
    fn add(&self, repo_root: &Path, paths: &[PathBuf]) -> Result<(), StagingError>;
}

/// Shells out to the `git` binary on `PATH`.
#[derive(Debug, Clone, Copy, Default)]
pub struct GitCli;

impl VersionControl for GitCli {
    fn repo_root(&self, dir: &Path) -> Option<PathBuf> {
        let output = Command::new("git")
            .arg("-C")
            .arg(dir)
            .args(["rev-parse", "--show-toplevel"])
            .output()
            .ok()
            .filter(|o| o.status.success())?;
        let root = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if root.is_empty() {
            return None;
        }
        fs::canonicalize(root).ok()
    }

    fn add(&self, repo_root: &Path, paths: &[PathBuf]) -> Result<(), StagingError> {
        let output = match Command::new("git")
            .arg("-C")
            .arg(repo_root)
            .arg("add")
            .arg("--")
            .args(paths)
            .output()
        {
            Ok(output) => output,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(StagingError::Unavailable),
            Err(e) => return Err(e.into()),
        };
        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(StagingError::Failed(sanitize_message(stderr.trim())))
        }
    }
}

/// Which paths ended up staged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StagingReport {
    pub staged: Vec<PathBuf>,
    pub unstaged: Vec<PathBuf>,
}

impl StagingReport {
    pub fn is_staged(&self, path: &Path) -> bool {
        self.staged.iter().any(|p| p == path)
    }
}

/// Stage `paths` (absolute) inside `repo_root`: one batch call, then one call
/// per path if the batch fails. Paths outside the repository are left alone.
pub fn stage_all(vcs: &dyn VersionControl, repo_root: &Path, paths: &[PathBuf]) -> StagingReport {
    let mut report = StagingReport::default();
    let mut inside = Vec::new();
    let mut relative = Vec::new();
    for path in paths {
        match path.strip_prefix(repo_root) {
            Ok(rel) => {
                inside.push(path.clone());
                relative.push(rel.to_path_buf());
            }
            Err(_) => report.unstaged.push(path.clone()),
        }
    }
    if inside.is_empty() {
        return report;
    }

    match vcs.add(repo_root, &relative) {
        Ok(()) => {
            info!(count = inside.len(), "staged in git");
            report.staged.extend(inside);
        }
        Err(StagingError::Unavailable) => {
            warn!("git not found; skipping staging");
            report.unstaged.extend(inside);
        }
        Err(e) => {
            warn!(error = %e, "batch staging failed, retrying one file at a time");
            for (path, rel) in inside.into_iter().zip(relative) {
                match vcs.add(repo_root, std::slice::from_ref(&rel)) {
                    Ok(()) => report.staged.push(path),
                    Err(e) => {
                        warn!(path = %redact(&path), error = %e, "could not stage");
                        report.unstaged.push(path);
                    }
                }
            }
        }
    }
    report
}

/// The repository's image directory: the first existing candidate, or
/// `assets/images` created race-safely.
pub fn repo_image_dir(repo_root: &Path, allow_symlinks: bool) -> Result<PathBuf, PathError> {
    for candidate in IMAGE_DIR_CANDIDATES {
        let dir = repo_root.join(candidate);
        let meta = if allow_symlinks {
            fs::metadata(&dir)
        } else {
            fs::symlink_metadata(&dir)
        };
        if meta.is_ok_and(|m| m.is_dir()) {
            debug!(dir = candidate, "using existing repository image directory");
            return Ok(dir);
        }
    }
    create_dir_safely(&repo_root.join("assets").join("images"), allow_symlinks)
}
