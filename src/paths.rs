//! Path authorization, candidate discovery and race-safe reads.
//!
//! The source directory is writable by the Windows side (and by anything else
//! that can reach the share), so every path handed in from outside is treated
//! as hostile until proven otherwise:
//!
//! - [`authorize`] expands `~`, makes the path absolute and refuses it if any
//!   component, the last one included, is a symlink.
//! - [`discover_candidates`] lists the source directory without following
//!   links and drops symlinked entries, even though the directory itself was
//!   authorized. A link can appear after the directory check.
//! - [`read_candidate`] opens the file and compares the opened handle's
//!   device and inode with the path's own metadata, so a file swapped for a
//!   symlink between listing and reading is still caught.
//! - [`create_dir_safely`] creates one component at a time and inspects
//!   whatever already exists instead of checking first and creating later.
//!
//! `allow_symlinks` (the `--allow-symlinks` flag) turns all of these checks
//! off at once.

use crate::imaging::format::has_supported_extension;
use crate::imaging::validate::RejectReason;
use crate::limits::SizeLimits;
use crate::sanitize::redact;
use std::fs::{self, DirBuilder, File, Metadata};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;

#[derive(Error, Debug)]
pub enum PathError {
    #[error("Symlinks are not allowed: {}", redact(.0))]
    SymlinkRejected(PathBuf),
    #[error("Path contains symlink: {}", redact(.0))]
    SymlinkInPath(PathBuf),
    #[error("Path does not exist: {}", redact(.0))]
    NotFound(PathBuf),
    #[error("Not a directory: {}", redact(.0))]
    NotADirectory(PathBuf),
    #[error("Not a file: {}", redact(.0))]
    NotAFile(PathBuf),
    #[error("Cannot determine home directory")]
    NoHome,
    #[error("No images found in {}", redact(.0))]
    NoImagesFound(PathBuf),
    #[error("Requested {requested} images but only {found} found")]
    NotEnoughImages { requested: usize, found: usize },
    #[error("Cannot access {}: {source}", redact(path))]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl PathError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn is_symlink(&self) -> bool {
        matches!(self, Self::SymlinkRejected(_) | Self::SymlinkInPath(_))
    }
}

/// What an authorized path will be used for. Decides what must already exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathRole {
    /// Must exist and be a directory.
    SourceDir,
    /// Must exist and be a directory.
    DestinationDir,
    /// Must exist and be a regular file.
    ImageFile,
    /// May be absent; if present it must be a regular file.
    ConfigFile,
}

/// An absolute path that passed [`authorize`] for a given role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizedPath {
    path: PathBuf,
}

impl AuthorizedPath {
    pub fn as_path(&self) -> &Path {
        &self.path
    }

    pub fn into_path_buf(self) -> PathBuf {
        self.path
    }
}

impl AsRef<Path> for AuthorizedPath {
    fn as_ref(&self) -> &Path {
        &self.path
    }
}

/// Replace a leading `~` with `$HOME`. Other paths are returned unchanged.
pub fn expand_user(path: &Path) -> Result<PathBuf, PathError> {
    match path.strip_prefix("~") {
        Ok(rest) => {
            let home = std::env::var_os("HOME")
                .filter(|h| !h.is_empty())
                .ok_or(PathError::NoHome)?;
            Ok(PathBuf::from(home).join(rest))
        }
        Err(_) => Ok(path.to_path_buf()),
    }
}

/// Expand, absolutize and check `path` for use as `role`.
pub fn authorize(
    path: &Path,
    role: PathRole,
    allow_symlinks: bool,
) -> Result<AuthorizedPath, PathError> {
    let expanded = expand_user(path)?;
    let absolute = std::path::absolute(&expanded).map_err(|e| PathError::io(&expanded, e))?;

    if !allow_symlinks {
        reject_symlinks(&absolute)?;
    }

    let resolved = match fs::canonicalize(&absolute) {
        Ok(resolved) => resolved,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            if role != PathRole::ConfigFile {
                return Err(PathError::NotFound(absolute));
            }
            normalize_lexically(&absolute)
        }
        Err(e) => return Err(PathError::io(&absolute, e)),
    };

    match role {
        PathRole::SourceDir | PathRole::DestinationDir => {
            if !resolved.is_dir() {
                return Err(PathError::NotADirectory(resolved));
            }
        }
        PathRole::ImageFile => {
            if !resolved.is_file() {
                return Err(PathError::NotAFile(resolved));
            }
        }
        PathRole::ConfigFile => {
            if resolved.exists() && !resolved.is_file() {
                return Err(PathError::NotAFile(resolved));
            }
        }
    }

    debug!(path = %redact(&resolved), ?role, "authorized");
    Ok(AuthorizedPath { path: resolved })
}

/// Check every prefix of `absolute` in order. The walk uses the path as
/// given, before `..` is collapsed, since `link/..` resolves through the
/// link's target.
fn reject_symlinks(absolute: &Path) -> Result<(), PathError> {
    let mut prefix = PathBuf::new();
    let mut components = absolute.components().peekable();
    while let Some(component) = components.next() {
        prefix.push(component);
        let is_last = components.peek().is_none();
        match fs::symlink_metadata(&prefix) {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(if is_last {
                    PathError::SymlinkRejected(prefix)
                } else {
                    PathError::SymlinkInPath(prefix)
                });
            }
            Ok(_) => {}
            // Nothing below a missing component can exist.
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(PathError::io(&prefix, e)),
        }
    }
    Ok(())
}

fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

/// A supported image found in the source directory.
#[derive(Debug, Clone)]
struct Discovered {
    path: PathBuf,
    modified: SystemTime,
}

/// The `count` most recently modified images directly inside `dir`, newest
/// first. Symlinked entries are skipped unless `allow_symlinks` is set.
pub fn discover_candidates(
    dir: &AuthorizedPath,
    count: usize,
    allow_symlinks: bool,
) -> Result<Vec<PathBuf>, PathError> {
    let mut found = Vec::new();

    for entry in WalkDir::new(dir.as_path())
        .min_depth(1)
        .max_depth(1)
        .follow_links(false)
    {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                debug!(error = %e, "skipping unreadable entry");
                continue;
            }
        };
        let path = entry.path();
        if !has_supported_extension(path) {
            continue;
        }

        let metadata = if entry.path_is_symlink() {
            if !allow_symlinks {
                warn!(path = %redact(path), "skipping symlink in source directory");
                continue;
            }
            match fs::metadata(path) {
                Ok(meta) => meta,
                Err(e) => {
                    debug!(path = %redact(path), error = %e, "skipping dangling symlink");
                    continue;
                }
            }
        } else {
            match entry.metadata() {
                Ok(meta) => meta,
                Err(e) => {
                    debug!(path = %redact(path), error = %e, "skipping entry without metadata");
                    continue;
                }
            }
        };

        if !metadata.is_file() {
            continue;
        }
        let modified = metadata.modified().map_err(|e| PathError::io(path, e))?;
        found.push(Discovered {
            path: path.to_path_buf(),
            modified,
        });
    }

    if found.is_empty() {
        return Err(PathError::NoImagesFound(dir.as_path().to_path_buf()));
    }
    if found.len() < count {
        return Err(PathError::NotEnoughImages {
            requested: count,
            found: found.len(),
        });
    }

    found.sort_by(|a, b| {
        b.modified
            .cmp(&a.modified)
            .then_with(|| a.path.file_name().cmp(&b.path.file_name()))
    });
    found.truncate(count);
    Ok(found.into_iter().map(|d| d.path).collect())
}

/// Read a candidate's bytes, refusing symlinks and anything over the
/// per-file limit. At most `limit + 1` bytes are read, so a file that grows
/// after its size was checked is still caught without reading all of it.
pub fn read_candidate(
    path: &Path,
    limits: &SizeLimits,
    allow_symlinks: bool,
) -> Result<Vec<u8>, RejectReason> {
    let io_error = |e: io::Error| RejectReason::Io(e.to_string());

    let link_meta = fs::symlink_metadata(path).map_err(io_error)?;
    if link_meta.file_type().is_symlink() && !allow_symlinks {
        return Err(RejectReason::SymlinkRejected);
    }

    let file = open_nonblocking(path).map_err(io_error)?;
    let meta = file.metadata().map_err(io_error)?;
    if !allow_symlinks && !same_file(&link_meta, &meta) {
        return Err(RejectReason::SymlinkRejected);
    }
    if !meta.is_file() {
        return Err(RejectReason::Io("not a regular file".to_string()));
    }
    limits.check_file(meta.len())?;

    let cap = limits.per_file();
    let mut bytes = Vec::with_capacity(meta.len() as usize);
    file.take(cap + 1).read_to_end(&mut bytes).map_err(io_error)?;
    limits.check_file(bytes.len() as u64)?;
    Ok(bytes)
}

/// Opening a FIFO swapped in after discovery would block until a writer
/// appears. With `O_NONBLOCK` the open returns at once and the file type
/// check on the handle rejects it.
#[cfg(unix)]
fn open_nonblocking(path: &Path) -> io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    fs::OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
}

#[cfg(not(unix))]
fn open_nonblocking(path: &Path) -> io::Result<File> {
    File::open(path)
}

#[cfg(unix)]
fn same_file(a: &Metadata, b: &Metadata) -> bool {
    use std::os::unix::fs::MetadataExt;
    a.dev() == b.dev() && a.ino() == b.ino()
}

#[cfg(not(unix))]
fn same_file(a: &Metadata, b: &Metadata) -> bool {
    a.len() == b.len() && a.file_type() == b.file_type()
}

/// Create `path` and any missing parents without ever following a symlink
/// planted along the way.
pub fn create_dir_safely(path: &Path, allow_symlinks: bool) -> Result<PathBuf, PathError> {
    if allow_symlinks {
        fs::create_dir_all(path).map_err(|e| PathError::io(path, e))?;
        return Ok(path.to_path_buf());
    }

    let mut current = PathBuf::new();
    for component in path.components() {
        current.push(component);
        match fs::symlink_metadata(&current) {
            Ok(meta) => check_existing_dir(&current, &meta)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                match DirBuilder::new().create(&current) {
                    Ok(()) => debug!(path = %redact(&current), "created directory"),
                    // Lost a race: inspect whatever won it.
                    Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                        let meta = fs::symlink_metadata(&current)
                            .map_err(|e| PathError::io(&current, e))?;
                        check_existing_dir(&current, &meta)?;
                    }
                    Err(e) => return Err(PathError::io(&current, e)),
                }
            }
            Err(e) => return Err(PathError::io(&current, e)),
        }
    }
    Ok(current)
}

fn check_existing_dir(path: &Path, meta: &Metadata) -> Result<(), PathError> {
    if meta.file_type().is_symlink() {
        Err(PathError::SymlinkRejected(path.to_path_buf()))
    } else if !meta.is_dir() {
        Err(PathError::NotADirectory(path.to_path_buf()))
    } else {
        Ok(())
    }
}
