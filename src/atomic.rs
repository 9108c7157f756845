//! Crash-safe file replacement.
//!
//! Every file this tool creates or rewrites (the config file, copied
//! screenshots, converted or optimized images) is written the same way:
//!
//! 1. create a temporary file in the target's own directory
//! 2. write the full contents, set permissions
//! 3. `fsync` the file
//! 4. rename it over the target
//! 5. `fsync` the directory so the rename itself is durable
//!
//! A crash before step 4 leaves the target untouched; the temporary file is a
//! [`tempfile::NamedTempFile`] and is deleted when dropped on any early return.
//! Readers therefore see either the old file or the new one, never a
//! truncated mix.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;
use tempfile::NamedTempFile;

/// Permission bits for the config file.
pub const OWNER_ONLY: u32 = 0o600;

/// Permission bits for images placed in the destination directory.
pub const OWNER_WRITE_WORLD_READ: u32 = 0o644;

/// What to do when the target already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Replace {
    /// Rename over an existing target.
    Overwrite,
    /// Fail with `AlreadyExists` instead of replacing anything.
    NoClobber,
}

/// Atomically write `contents` to `target` with the given Unix mode.
pub fn write_atomic(target: &Path, contents: &[u8], mode: u32, replace: Replace) -> io::Result<()> {
    let dir = parent_dir(target)?;
    let mut temp = tempfile::Builder::new()
        .prefix(".wslshot-")
        .suffix(".tmp")
        .tempfile_in(dir)?;

    temp.write_all(contents)?;
    temp.flush()?;
    set_mode(temp.as_file(), mode)?;
    temp.as_file().sync_all()?;

    persist(temp, target, replace)?;
    sync_dir(dir)
}

fn persist(temp: NamedTempFile, target: &Path, replace: Replace) -> io::Result<()> {
    let result = match replace {
        Replace::Overwrite => temp.persist(target),
        Replace::NoClobber => temp.persist_noclobber(target),
    };
    // PersistError hands the temp file back; dropping it removes it.
    result.map(|_| ()).map_err(|e| e.error)
}

fn parent_dir(target: &Path) -> io::Result<&Path> {
    match target.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => Ok(dir),
        Some(_) => Ok(Path::new(".")),
        None => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "atomic write target has no parent directory",
        )),
    }
}

#[cfg(unix)]
fn set_mode(file: &File, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_file: &File, _mode: u32) -> io::Result<()> {
    Ok(())
}

/// Flush the directory entry after a rename.
#[cfg(unix)]
pub fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
pub fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}
