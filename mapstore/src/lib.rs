//! MapStore - offline map package storage and updates
//!
//! This library manages a catalog of downloadable map packages, the
//! versioned files on disk, consumer handles to those files, and a serial
//! download queue that fetches full packages or binary diffs from a set of
//! servers.
//!
//! # Modules
//!
//! - [`country`]: the catalog tree and package ids
//! - [`local`]: the on-disk layout and the local file registry
//! - [`mwm`]: reference-counted consumer handles
//! - [`diff`]: diff manifest queries and patch application
//! - [`download`]: the downloader seam, HTTP implementation and queue
//! - [`storage`]: the orchestrator tying everything together
//!
//! # Example
//!
//! ```ignore
//! use mapstore::{Catalog, Storage, StorageConfig};
//!
//! let config = StorageConfig::load("mapstore.ini".as_ref())?;
//! let storage = Storage::builder(config)
//!     .with_catalog(Catalog::load_file("countries.txt".as_ref())?)
//!     .build()?;
//! storage.register_all_local_maps()?;
//! storage.update_node(storage.catalog().root_id().as_str())?;
//! ```

pub mod config;
pub mod country;
pub mod diff;
pub mod download;
pub mod error;
pub mod local;
pub mod logging;
pub mod mwm;
pub mod runner;
pub mod storage;

pub use config::StorageConfig;
pub use country::{Catalog, Country, CountryId, DataVersion};
pub use diff::DiffStatus;
pub use download::Progress;
pub use error::{ErrorKind, StorageError, StorageResult};
pub use local::{LocalFile, MapFileType};
pub use mwm::{MwmHandle, MwmRegistry};
pub use storage::{
    NodeAttrs, ProgressEvent, Status, StatusEvent, Storage, StorageBuilder, Subscription,
    UpdateInfo,
};
