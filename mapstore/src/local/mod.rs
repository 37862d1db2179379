//! Local package files.
//!
//! - [`naming`] - directory and file naming conventions
//! - [`LocalFile`] - one `(country, version)` on disk
//! - [`LocalFileRegistry`] - every local file found by scanning

mod file;
pub mod naming;
mod registry;

pub use file::LocalFile;
pub(crate) use file::remove_if_exists;
pub use naming::{
    file_name, file_path, parse_file_name, parse_version_dir, transient_path, version_dir,
    MapFileType, ParsedFileName, TransientSuffix,
};
pub(crate) use registry::remove_dir_if_empty;
pub use registry::{delete_stale_resumes, find_local_files, LocalFileRegistry};
