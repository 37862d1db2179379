//! A package version present on disk.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use super::naming::{file_name, transient_path, MapFileType, TransientSuffix};
use crate::country::{CountryId, DataVersion};
use crate::error::{StorageError, StorageResult};

/// One `(country, version)` pair on disk.
///
/// The present-files mask and sizes are a snapshot; call
/// [`sync_with_disk`](Self::sync_with_disk) to refresh them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFile {
    country_id: CountryId,
    directory: PathBuf,
    version: DataVersion,
    present_files_mask: u8,
    sizes: [u64; 2],
}

impl LocalFile {
    /// Create a local file description. Nothing is read from disk.
    pub fn new(directory: impl Into<PathBuf>, country_id: CountryId, version: DataVersion) -> Self {
        Self {
            country_id,
            directory: directory.into(),
            version,
            present_files_mask: 0,
            sizes: [0; 2],
        }
    }

    pub fn country_id(&self) -> &CountryId {
        &self.country_id
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn version(&self) -> DataVersion {
        self.version
    }

    /// Bitmask of [`MapFileType::mask_bit`] values found at the last sync.
    pub fn present_files_mask(&self) -> u8 {
        self.present_files_mask
    }

    /// Path of a file of the given kind.
    pub fn path(&self, kind: MapFileType) -> PathBuf {
        self.directory.join(file_name(&self.country_id, kind))
    }

    /// Check whether a file of the given kind was present at the last sync.
    pub fn on_disk(&self, kind: MapFileType) -> bool {
        self.present_files_mask & kind.mask_bit() != 0
    }

    /// Check whether any file was present at the last sync.
    pub fn has_files(&self) -> bool {
        self.present_files_mask != 0
    }

    /// Size of a file of the given kind at the last sync (0 if absent).
    pub fn size(&self, kind: MapFileType) -> u64 {
        self.sizes[kind.index()]
    }

    /// Total size of all present files.
    pub fn total_size(&self) -> u64 {
        self.sizes.iter().sum()
    }

    /// Recompute the present-files mask and sizes by stat-ing expected paths.
    ///
    /// Missing files simply leave their bit unset.
    pub fn sync_with_disk(&mut self) {
        self.present_files_mask = 0;
        self.sizes = [0; 2];

        for kind in MapFileType::ALL {
            if let Ok(meta) = fs::metadata(self.path(kind)) {
                if meta.is_file() {
                    self.present_files_mask |= kind.mask_bit();
                    self.sizes[kind.index()] = meta.len();
                }
            }
        }
    }

    /// Delete the file of the given kind together with its transient artifacts.
    ///
    /// Missing files are not an error.
    pub fn delete_from_disk(&mut self, kind: MapFileType) -> StorageResult<()> {
        let path = self.path(kind);
        remove_if_exists(&path)?;
        for suffix in TransientSuffix::ALL {
            remove_if_exists(&transient_path(&path, suffix))?;
        }

        self.present_files_mask &= !kind.mask_bit();
        self.sizes[kind.index()] = 0;
        Ok(())
    }

    /// Delete all files of this version.
    pub fn delete_all_from_disk(&mut self) -> StorageResult<()> {
        for kind in MapFileType::ALL {
            self.delete_from_disk(kind)?;
        }
        Ok(())
    }
}

impl fmt::Display for LocalFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} v{} in {} (mask {:#04b})",
            self.country_id,
            self.version,
            self.directory.display(),
            self.present_files_mask
        )
    }
}

/// Remove a file, ignoring "not found".
pub(crate) fn remove_if_exists(path: &Path) -> StorageResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StorageError::disk(path, e)),
    }
}
