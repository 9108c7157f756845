//! # wslshot
//!
//! Fetch the latest screenshots from a folder shared with Windows into the
//! project you are working on, and print a ready-to-paste link.
//!
//! The source folder is writable from the Windows side, so its contents are
//! untrusted. Nothing is copied until it has passed structural validation
//! and the size ceilings, and nothing is ever half-written.
//!
//! # Architecture: Screen, Then Copy
//!
//! ```text
//! 1. Authorize   source / destination / config paths   (no symlinks)
//! 2. Discover    newest N images in the source folder
//! 3. Screen      read once, validate bytes, per-file + batch size limits
//! 4. Transfer    write validated bytes under a random name, convert/optimize
//! 5. Stage       git add (batch, then per file), best effort
//! 6. Render      markdown / html / text, repo-relative inside a git repo
//! ```
//!
//! Screening covers the whole batch before the first byte is written, so an
//! oversized batch leaves the destination untouched.
//!
//! # Module Map
//!
//! | Module | Role |
//! |--------|------|
//! | [`paths`] | Path authorization, symlink rejection, candidate discovery, race-safe reads and directory creation |
//! | [`imaging`] | Format detection, byte-level validation, conversion and optimization backends |
//! | [`limits`] | Per-file, aggregate and pixel ceilings that configuration can lower but never raise |
//! | [`transfer`] | Screening and copying admitted candidates under random names |
//! | [`config`] | JSON config loading, repair, migration and atomic saving |
//! | [`atomic`] | Temp-file, fsync, rename, fsync-directory writes |
//! | [`git`] | Repository detection, image directory choice, staging with fallback |
//! | [`fetch`] | The fetch command end to end |
//! | [`output`] | Link rendering and output-style suggestions |
//! | [`sanitize`] | Redacting absolute paths from everything shown to the user |
//! | [`logging`] | `tracing` subscriber setup |
//!
//! # Design Decisions
//!
//! ## Validate Bytes, Not Files
//!
//! Each candidate is read exactly once. [`imaging::validate`] works on that
//! buffer and [`transfer`] writes the same buffer, so a file swapped on disk
//! between the check and the copy cannot slip through.
//!
//! ## Hard Ceilings Are Applied at Use
//!
//! The config file may say anything. [`limits::SizeLimits`] clamps every
//! configured value when it is built, so a hand-edited file cannot raise a
//! limit past 50 MB per file or 200 MB per batch.
//!
//! ## Config Repair Never Blocks
//!
//! A corrupted config is moved aside and replaced by defaults with a warning.
//! The tool is often run from editor integrations where nobody could answer a
//! prompt.

pub mod atomic;
pub mod config;
pub mod fetch;
pub mod git;
pub mod imaging;
pub mod limits;
pub mod logging;
pub mod output;
pub mod paths;
pub mod sanitize;
pub mod transfer;

#[cfg(test)]
pub(crate) mod test_helpers;
