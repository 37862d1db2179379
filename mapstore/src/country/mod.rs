//! Catalog of known map packages.
//!
//! - [`CountryId`] - opaque package/group identifier
//! - [`Country`] - a catalog node (leaf package or group)
//! - [`Catalog`] - the versioned tree loaded from the manifest

mod catalog;
mod id;

pub use catalog::{Catalog, Country};
pub use id::CountryId;

/// Numeric data version (e.g. `230101`). Version `0` marks files found in
/// the writable root itself rather than in a versioned directory.
pub type DataVersion = u64;
