//! Incremental updates through binary diffs.
//!
//! - `protocol`: the batched discovery request/response and [`DiffSource`]
//! - `catalog`: [`DiffCatalog`], per-package availability and sizes
//! - `patch`: the [`DiffApplier`] seam and the built-in [`PatchApplier`]

mod catalog;
mod patch;
mod protocol;

pub use catalog::{DiffCatalog, DiffInfo, DiffStatus};
pub use patch::{DiffApplier, Patch, PatchApplier, PatchOp, PATCH_MAGIC};
pub use protocol::{
    DiffRequest, DiffRequestEntry, DiffResponse, DiffResponseEntry, DiffSource, HttpDiffSource,
};
