//! Reference-counted handles to registered package files.
//!
//! A consumer (renderer, search, router) keeps an [`MwmHandle`] while it has
//! a file open. The storage orchestrator checks the lock count before
//! deleting or replacing a file, and [`MwmRegistry::deregister`] refuses to
//! drop a locked file.
//!
//! Handles release themselves on drop, so a lock is returned on every exit
//! path of the consumer.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::country::{CountryId, DataVersion};
use crate::error::{StorageError, StorageResult};
use crate::local::LocalFile;

/// Outcome of [`MwmRegistry::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegResult {
    Success,
    /// A newer version of the package is already registered.
    VersionTooOld,
    /// The file's data version is below the minimum this build reads.
    UnsupportedFileFormat,
}

#[derive(Debug)]
struct Entry {
    file: LocalFile,
    lock_count: usize,
}

#[derive(Debug, Default)]
struct Inner {
    /// Every registered version still alive, keyed by country.
    entries: HashMap<CountryId, Vec<Entry>>,
    /// Version new handles are given out for.
    current: HashMap<CountryId, DataVersion>,
}

impl Inner {
    fn entry_mut(&mut self, id: &str, version: DataVersion) -> Option<&mut Entry> {
        self.entries
            .get_mut(id)?
            .iter_mut()
            .find(|e| e.file.version() == version)
    }

    fn lock_count(&self, id: &str) -> usize {
        self.entries
            .get(id)
            .map(|entries| entries.iter().map(|e| e.lock_count).sum())
            .unwrap_or(0)
    }

    /// Drop unlocked entries that are no longer current.
    fn collect_stale(&mut self, id: &str) {
        let current = self.current.get(id).copied();
        if let Some(entries) = self.entries.get_mut(id) {
            entries.retain(|e| e.lock_count > 0 || Some(e.file.version()) == current);
            if entries.is_empty() {
                self.entries.remove(id);
            }
        }
    }
}

/// Registry of files handed out to consumers.
#[derive(Debug, Clone)]
pub struct MwmRegistry {
    inner: Arc<Mutex<Inner>>,
    min_supported_version: DataVersion,
}

impl Default for MwmRegistry {
    fn default() -> Self {
        Self::new(0)
    }
}

impl MwmRegistry {
    /// Create a registry refusing files older than `min_supported_version`.
    pub fn new(min_supported_version: DataVersion) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            min_supported_version,
        }
    }

    /// Register a file, replacing any older version of the same package.
    ///
    /// On success a handle to the registered file is returned; dropping it
    /// immediately leaves the file registered but unlocked.
    pub fn register(&self, file: LocalFile) -> (Option<MwmHandle>, RegResult) {
        let id = file.country_id().clone();
        let version = file.version();

        if version < self.min_supported_version {
            warn!(country = %id, version, min = self.min_supported_version, "Unsupported file format");
            return (None, RegResult::UnsupportedFileFormat);
        }

        let mut inner = self.inner.lock();
        match inner.current.get(&id).copied() {
            Some(current) if current > version => {
                debug!(country = %id, version, current, "Registration of old version refused");
                return (None, RegResult::VersionTooOld);
            }
            Some(current) if current == version => {
                if let Some(entry) = inner.entry_mut(id.as_str(), version) {
                    entry.file = file.clone();
                }
            }
            _ => {
                inner.entries.entry(id.clone()).or_default().push(Entry {
                    file: file.clone(),
                    lock_count: 0,
                });
                inner.current.insert(id.clone(), version);
                inner.collect_stale(id.as_str());
                info!(country = %id, version, "Registered package file");
            }
        }

        let handle = self.lock_entry(&mut inner, id.as_str(), version);
        (handle, RegResult::Success)
    }

    /// Acquire a handle to the current version of a package.
    pub fn get_handle(&self, id: &str) -> Option<MwmHandle> {
        let mut inner = self.inner.lock();
        let version = *inner.current.get(id)?;
        self.lock_entry(&mut inner, id, version)
    }

    fn lock_entry(&self, inner: &mut Inner, id: &str, version: DataVersion) -> Option<MwmHandle> {
        let entry = inner.entry_mut(id, version)?;
        entry.lock_count += 1;
        Some(MwmHandle {
            inner: Arc::clone(&self.inner),
            file: entry.file.clone(),
        })
    }

    /// Explicitly release a handle. Equivalent to dropping it.
    pub fn release_handle(&self, handle: MwmHandle) {
        drop(handle);
    }

    /// Locks held on any version of a package.
    pub fn lock_count(&self, id: &str) -> usize {
        self.inner.lock().lock_count(id)
    }

    /// Check whether a specific version of a package is locked.
    pub fn is_locked(&self, id: &str, version: DataVersion) -> bool {
        self.inner
            .lock()
            .entry_mut(id, version)
            .is_some_and(|e| e.lock_count > 0)
    }

    pub fn is_registered(&self, id: &str) -> bool {
        self.inner.lock().current.contains_key(id)
    }

    /// Version handed out by [`get_handle`](Self::get_handle).
    pub fn registered_version(&self, id: &str) -> Option<DataVersion> {
        self.inner.lock().current.get(id).copied()
    }

    /// Remove a package. Fails with [`StorageError::FileLocked`] while any
    /// handle to it is alive.
    pub fn deregister(&self, id: &str) -> StorageResult<()> {
        self.deregister_all(&[CountryId::from(id)])
    }

    /// Remove several packages, all or none.
    ///
    /// The lock counts are checked and the entries removed under one lock,
    /// so no handle can be taken in between. If any package is locked the
    /// registry is left untouched.
    pub fn deregister_all(&self, ids: &[CountryId]) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        for id in ids {
            let lock_count = inner.lock_count(id.as_str());
            if lock_count > 0 {
                warn!(country = %id, lock_count, "Refusing to deregister locked file");
                return Err(StorageError::FileLocked {
                    country: id.clone(),
                    lock_count,
                });
            }
        }

        for id in ids {
            inner.entries.remove(id);
            if inner.current.remove(id).is_some() {
                info!(country = %id, "Deregistered package file");
            }
        }
        Ok(())
    }

    /// Deregister every unlocked package. Returns the ids left registered.
    pub fn clear(&self) -> Vec<CountryId> {
        let ids: Vec<CountryId> = self.inner.lock().current.keys().cloned().collect();
        let mut remaining: Vec<CountryId> = ids
            .into_iter()
            .filter(|id| self.deregister(id.as_str()).is_err())
            .collect();
        remaining.sort();
        remaining
    }
}

/// A locked view of a registered file.
///
/// Cloning takes another lock; dropping releases one.
pub struct MwmHandle {
    inner: Arc<Mutex<Inner>>,
    file: LocalFile,
}

impl MwmHandle {
    pub fn file(&self) -> &LocalFile {
        &self.file
    }

    pub fn country_id(&self) -> &CountryId {
        self.file.country_id()
    }

    pub fn version(&self) -> DataVersion {
        self.file.version()
    }
}

impl Clone for MwmHandle {
    fn clone(&self) -> Self {
        if let Some(entry) = self
            .inner
            .lock()
            .entry_mut(self.file.country_id().as_str(), self.file.version())
        {
            entry.lock_count += 1;
        }
        Self {
            inner: Arc::clone(&self.inner),
            file: self.file.clone(),
        }
    }
}

impl Drop for MwmHandle {
    fn drop(&mut self) {
        let mut inner = self.inner.lock();
        let id = self.file.country_id().as_str();
        if let Some(entry) = inner.entry_mut(id, self.file.version()) {
            entry.lock_count = entry.lock_count.saturating_sub(1);
        }
        inner.collect_stale(id);
    }
}

impl fmt::Debug for MwmHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MwmHandle").field("file", &self.file).finish()
    }
}
