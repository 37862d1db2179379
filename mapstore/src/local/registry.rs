//! Registry of package files found in the writable directory tree.
//!
//! Layout scanned:
//!
//! ```text
//! <root>/
//! ├── World.mwm                      (version 0)
//! ├── 230101/
//! │   ├── Abkhazia.mwm
//! │   └── Algeria_Coast.mwm.resume   (kept, resumable)
//! └── 230215/
//!     └── Abkhazia.mwm
//! ```
//!
//! Every version found is kept; [`LocalFileRegistry::latest`] picks the
//! highest one holding at least one non-transient file.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::file::{remove_if_exists, LocalFile};
use super::naming::{parse_file_name, parse_version_dir, MapFileType, TransientSuffix};
use crate::country::{CountryId, DataVersion};
use crate::error::{StorageError, StorageResult};

/// Map of country id to every on-disk version of it.
#[derive(Debug, Default)]
pub struct LocalFileRegistry {
    files: Mutex<HashMap<CountryId, Vec<LocalFile>>>,
}

impl LocalFileRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Scan root directories, clean up abandoned artifacts and replace the
    /// registry contents with what was found.
    ///
    /// Returns every local file found, ordered by country then descending
    /// version.
    pub fn scan(&self, roots: &[PathBuf]) -> StorageResult<Vec<LocalFile>> {
        let mut found = Vec::new();
        for root in roots {
            found.extend(find_local_files(root)?);
        }
        sort_by_country_then_version(&mut found);

        let mut map: HashMap<CountryId, Vec<LocalFile>> = HashMap::new();
        for file in &found {
            map.entry(file.country_id().clone())
                .or_default()
                .push(file.clone());
        }

        info!(files = found.len(), countries = map.len(), "Local files scanned");
        *self.files.lock() = map;
        Ok(found)
    }

    /// Refresh a file's mask and sizes from disk and store the result.
    pub fn sync_with_disk(&self, file: &LocalFile) -> LocalFile {
        let mut synced = file.clone();
        synced.sync_with_disk();

        let mut files = self.files.lock();
        if let Some(versions) = files.get_mut(synced.country_id()) {
            if let Some(entry) = versions.iter_mut().find(|f| f.version() == synced.version()) {
                *entry = synced.clone();
            }
        }
        synced
    }

    /// Insert or replace a `(country, version)` entry.
    pub fn register(&self, file: LocalFile) {
        let mut files = self.files.lock();
        let versions = files.entry(file.country_id().clone()).or_default();
        versions.retain(|f| f.version() != file.version());
        versions.push(file);
        versions.sort_by(|a, b| b.version().cmp(&a.version()));
    }

    /// Highest version with at least one non-transient file.
    pub fn latest(&self, id: &str) -> Option<LocalFile> {
        self.files
            .lock()
            .get(id)
            .and_then(|versions| versions.iter().find(|f| f.has_files()).cloned())
    }

    /// Highest version holding a full package file.
    pub fn latest_map(&self, id: &str) -> Option<LocalFile> {
        self.files.lock().get(id).and_then(|versions| {
            versions
                .iter()
                .find(|f| f.on_disk(MapFileType::Map))
                .cloned()
        })
    }

    /// A specific version.
    pub fn file(&self, id: &str, version: DataVersion) -> Option<LocalFile> {
        self.files
            .lock()
            .get(id)
            .and_then(|versions| versions.iter().find(|f| f.version() == version).cloned())
    }

    /// All versions of a country, newest first.
    pub fn versions(&self, id: &str) -> Vec<LocalFile> {
        self.files.lock().get(id).cloned().unwrap_or_default()
    }

    /// Countries with at least one registered version, sorted.
    pub fn countries(&self) -> Vec<CountryId> {
        let mut ids: Vec<CountryId> = self.files.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Check whether a country has any registered version.
    pub fn contains(&self, id: &str) -> bool {
        self.files.lock().contains_key(id)
    }

    /// Drop one version from the registry. Files on disk are untouched.
    pub fn remove(&self, id: &str, version: DataVersion) -> Option<LocalFile> {
        let mut files = self.files.lock();
        let versions = files.get_mut(id)?;
        let index = versions.iter().position(|f| f.version() == version)?;
        let removed = versions.remove(index);
        if versions.is_empty() {
            files.remove(id);
        }
        Some(removed)
    }

    /// Drop every version of a country from the registry.
    pub fn remove_all(&self, id: &str) -> Vec<LocalFile> {
        self.files.lock().remove(id).unwrap_or_default()
    }

    /// Forget everything.
    pub fn clear(&self) {
        self.files.lock().clear();
    }

    pub fn is_empty(&self) -> bool {
        self.files.lock().is_empty()
    }
}

/// Walk one writable root: the root itself (version 0) and every numeric
/// subdirectory.
///
/// Transient artifacts other than `.resume` are deleted, and version
/// directories left empty afterwards are removed. A missing root yields no
/// files.
pub fn find_local_files(root: &Path) -> StorageResult<Vec<LocalFile>> {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StorageError::disk(root, e)),
    };

    let mut found = find_in_version_dir(root, 0)?;

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let Some(version) = entry
            .file_name()
            .to_str()
            .and_then(parse_version_dir)
            .filter(|v| *v > 0)
        else {
            continue;
        };

        found.extend(find_in_version_dir(&path, version)?);
        remove_dir_if_empty(&path);
    }

    Ok(found)
}

/// Delete `.resume` partials outside the `keep` version directory.
///
/// A partial can only be resumed into the current catalog version, so
/// older ones are dead weight. Version directories left empty are removed.
/// Returns the number of files deleted.
pub fn delete_stale_resumes(root: &Path, keep: DataVersion) -> StorageResult<usize> {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(StorageError::disk(root, e)),
    };

    let mut deleted = 0;
    if keep != 0 {
        deleted += delete_resumes_in(root)?;
    }
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let stale = entry
            .file_name()
            .to_str()
            .and_then(parse_version_dir)
            .is_some_and(|v| v > 0 && v != keep);
        if stale {
            deleted += delete_resumes_in(&path)?;
            remove_dir_if_empty(&path);
        }
    }
    Ok(deleted)
}

fn delete_resumes_in(dir: &Path) -> StorageResult<usize> {
    let entries = fs::read_dir(dir).map_err(|e| StorageError::disk(dir, e))?;
    let mut deleted = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let is_resume = entry
            .file_name()
            .to_str()
            .and_then(parse_file_name)
            .is_some_and(|parsed| parsed.transient == Some(TransientSuffix::Resume));
        if is_resume && path.is_file() {
            info!(path = %path.display(), "Deleting partial download of an old version");
            remove_if_exists(&path)?;
            deleted += 1;
        }
    }
    Ok(deleted)
}

fn find_in_version_dir(dir: &Path, version: DataVersion) -> StorageResult<Vec<LocalFile>> {
    let entries = fs::read_dir(dir).map_err(|e| StorageError::disk(dir, e))?;

    let mut countries = BTreeSet::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(parsed) = entry.file_name().to_str().and_then(parse_file_name) else {
            continue;
        };

        match parsed.transient {
            None => {
                countries.insert(parsed.country_id);
            }
            Some(TransientSuffix::Resume) => {
                debug!(path = %path.display(), "Keeping resumable partial download");
            }
            Some(suffix) => {
                warn!(
                    path = %path.display(),
                    suffix = suffix.as_str(),
                    "Deleting abandoned transient file"
                );
                if let Err(e) = remove_if_exists(&path) {
                    warn!(error = %e, "Failed to delete abandoned file");
                }
            }
        }
    }

    Ok(countries
        .into_iter()
        .map(|id| {
            let mut file = LocalFile::new(dir, id, version);
            file.sync_with_disk();
            file
        })
        .filter(|f| f.has_files())
        .collect())
}

/// Remove a directory if it has no entries left. Failures are ignored.
pub(crate) fn remove_dir_if_empty(dir: &Path) {
    let is_empty = fs::read_dir(dir)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(false);
    if is_empty {
        match fs::remove_dir(dir) {
            Ok(()) => debug!(dir = %dir.display(), "Removed empty version directory"),
            Err(e) => warn!(dir = %dir.display(), error = %e, "Failed to remove empty directory"),
        }
    }
}

fn sort_by_country_then_version(files: &mut [LocalFile]) {
    files.sort_by(|a, b| {
        a.country_id()
            .cmp(b.country_id())
            .then_with(|| b.version().cmp(&a.version()))
    });
}
