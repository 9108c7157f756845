//! Image screening and codec work.
//!
//! | Operation | Where |
//! |---|---|
//! | **Format detection** | magic bytes, [`format`] |
//! | **Validation** | container walk + bounded decode, [`validate`](validate::validate) |
//! | **Convert** | [`ImageBackend::convert`] |
//! | **Optimize** | [`ImageBackend::optimize`] |
//!
//! The module is split into:
//! - **Format**: accepted inputs and conversion targets
//! - **Validate**: pure byte-level checks, no I/O
//! - **Parameters**: data structures describing codec operations
//! - **Backend**: [`ImageBackend`] trait + [`RustBackend`]

pub mod backend;
pub mod format;
mod params;
pub mod rust_backend;
pub mod validate;

pub use backend::{BackendError, ImageBackend, OptimizeOutcome};
pub use format::{ConvertTarget, ImageKind, UnknownTarget};
pub use params::{ConvertParams, OptimizeParams, Quality};
pub use rust_backend::RustBackend;
pub use validate::{RejectReason, ValidationOutcome, validate};
