//! Transfer and finalization flow.
//!
//! A transfer runs on the network runner and writes `<path>.downloading`.
//! On success the file becomes `<path>.ready` and the files runner places it
//! (full package) or patches the previous version with it (diff). Results
//! are folded back into the queue under the state lock.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{Finalizing, Inner, State};
use crate::country::{Catalog, CountryId};
use crate::download::{diff_url, map_url, verify_file, FetchRequest, Progress, QueuedTask};
use crate::error::{ErrorKind, StorageError, StorageResult};
use crate::local::{
    file_path, remove_dir_if_empty, remove_if_exists, transient_path, version_dir, LocalFile,
    MapFileType, TransientSuffix,
};
use crate::mwm::RegResult;
use super::events::ProgressEvent;

impl Inner {
    /// Network runner entry point for one transfer.
    pub(super) fn run_transfer(&self, task: QueuedTask, generation: u64, cancel: CancellationToken) {
        let result = self.fetch(&task, generation, &cancel);
        self.on_transfer_finished(task, generation, result);
    }

    fn fetch(
        &self,
        task: &QueuedTask,
        generation: u64,
        cancel: &CancellationToken,
    ) -> StorageResult<u64> {
        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }

        let downloading = transient_path(&task.download_path, TransientSuffix::Downloading);
        let resume = transient_path(&task.download_path, TransientSuffix::Resume);
        if let Some(parent) = task.download_path.parent() {
            fs::create_dir_all(parent).map_err(|e| StorageError::disk(parent, e))?;
        }
        if resume.exists() {
            fs::rename(&resume, &downloading).map_err(|e| StorageError::disk(&resume, e))?;
            debug!(country = %task.country_id, "Resuming partial download");
        }

        let request = FetchRequest::new(self.urls_for(task)?, &downloading, task.expected_size)
            .with_cancel(cancel.clone());
        self.downloader.fetch(&request, &mut |progress| {
            self.handle_progress(generation, &task.country_id, progress)
        })
    }

    fn urls_for(&self, task: &QueuedTask) -> StorageResult<Vec<String>> {
        if self.config.servers.is_empty() {
            return Err(StorageError::InvalidConfig(
                "no download servers configured".to_string(),
            ));
        }
        self.config
            .servers
            .iter()
            .map(|server| match (task.file_kind, task.source_version) {
                (MapFileType::Diff, Some(local)) => {
                    diff_url(server, task.target_version, local, &task.country_id)
                }
                _ => map_url(server, task.target_version, &task.country_id),
            })
            .collect()
    }

    /// Record progress of the active transfer and notify the leaf and its
    /// ancestors. Stale generations and shrinking counts are dropped.
    fn handle_progress(&self, generation: u64, id: &CountryId, progress: Progress) {
        let mut state = self.state.lock();
        if !state.queue.update_progress(generation, progress) {
            return;
        }

        let catalog = self.catalog();
        let mut events = vec![ProgressEvent {
            country_id: id.clone(),
            progress,
        }];
        for ancestor in catalog.ancestors(id.as_str()).into_iter().rev() {
            events.push(ProgressEvent {
                progress: self.node_progress(&state, &catalog, ancestor.as_str()),
                country_id: ancestor,
            });
        }
        self.emit_progress(events);
    }

    fn on_transfer_finished(&self, task: QueuedTask, generation: u64, result: StorageResult<u64>) {
        let mut state = self.state.lock();
        let catalog = self.catalog();
        let id = task.country_id.clone();

        let Some(active) = state.queue.finish(generation) else {
            debug!(country = %id, generation, "Transfer outlived its cancellation");
            self.delete_transfer_output(&task);
            return;
        };

        match result {
            Ok(bytes) => {
                let downloading = transient_path(&task.download_path, TransientSuffix::Downloading);
                let ready = transient_path(&task.download_path, TransientSuffix::Ready);
                match fs::rename(&downloading, &ready) {
                    Ok(()) => {
                        info!(country = %id, bytes, kind = ?task.file_kind, "Download finished");
                        self.start_finalize(&mut state, task, active.cancel);
                    }
                    Err(e) => {
                        let err = StorageError::disk(&downloading, e);
                        self.record_failure(&mut state, &task, &err);
                    }
                }
            }
            Err(StorageError::Cancelled) => {
                debug!(country = %id, "Transfer cancelled");
                self.delete_transfer_output(&task);
            }
            Err(StorageError::NotFound { url }) if task.is_diff() => {
                warn!(country = %id, %url, "Diff missing on server, dropping diffs");
                self.delete_transfer_output(&task);
                self.abort_diff_scheme(&mut state, &catalog);
                state.queue.enqueue(self.full_task(&catalog, &id));
            }
            Err(e) => self.record_failure(&mut state, &task, &e),
        }

        let mut events = self.status_events(&state, &catalog, std::slice::from_ref(&id));
        self.pump(&mut state, &catalog, &mut events);
        self.emit_status(events);
    }

    fn start_finalize(&self, state: &mut State, task: QueuedTask, cancel: CancellationToken) {
        state.finalizing.insert(
            task.country_id.clone(),
            Finalizing {
                cancel: cancel.clone(),
                size: task.expected_size,
            },
        );
        let me = self.me.clone();
        self.runners.files.spawn(Box::new(move || {
            if let Some(inner) = me.upgrade() {
                inner.finalize(task, cancel);
            }
        }));
    }

    /// Network failures keep the partial package for a later resume. Diff
    /// partials are dropped: the diff path does not name its source version.
    fn record_failure(&self, state: &mut State, task: &QueuedTask, err: &StorageError) {
        error!(country = %task.country_id, error = %err, "Download failed");
        let kind = err.kind();
        let downloading = transient_path(&task.download_path, TransientSuffix::Downloading);
        let keep_partial = kind == ErrorKind::Network
            && !task.is_diff()
            && fs::metadata(&downloading).map(|m| m.len() > 0).unwrap_or(false);

        if keep_partial {
            let resume = transient_path(&task.download_path, TransientSuffix::Resume);
            if let Err(e) = fs::rename(&downloading, &resume) {
                warn!(path = %downloading.display(), error = %e, "Failed to keep partial download");
                self.delete_transfer_output(task);
            }
        } else {
            self.delete_transfer_output(task);
        }
        state.failed.insert(task.country_id.clone(), kind);
    }

    /// Files runner entry point: place or patch a fetched file.
    fn finalize(&self, task: QueuedTask, cancel: CancellationToken) {
        let catalog = self.catalog();
        let result = if cancel.is_cancelled() {
            Err(StorageError::Cancelled)
        } else if task.is_diff() {
            self.apply_diff(&task, &catalog, &cancel)
        } else {
            self.place_map(&task, &catalog)
        };

        if result.is_err() {
            if let Err(e) = remove_if_exists(&transient_path(&task.download_path, TransientSuffix::Ready)) {
                warn!(country = %task.country_id, error = %e, "Failed to remove fetched file");
            }
        }
        self.on_finalized(task, result);
    }

    fn place_map(&self, task: &QueuedTask, catalog: &Catalog) -> StorageResult<()> {
        let ready = transient_path(&task.download_path, TransientSuffix::Ready);
        self.verify(&task.country_id, &ready, catalog)?;
        fs::rename(&ready, &task.download_path)
            .map_err(|e| StorageError::disk(&task.download_path, e))
    }

    fn apply_diff(
        &self,
        task: &QueuedTask,
        catalog: &Catalog,
        cancel: &CancellationToken,
    ) -> StorageResult<()> {
        let id = &task.country_id;
        let diff = transient_path(&task.download_path, TransientSuffix::Ready);
        let output = file_path(&self.config.writable_root, task.target_version, id, MapFileType::Map);

        let source = task
            .source_version
            .and_then(|version| self.local_files.file(id.as_str(), version))
            .filter(|file| file.on_disk(MapFileType::Map))
            .ok_or_else(|| StorageError::DiffApplication {
                country: id.clone(),
                reason: "source package is gone".to_string(),
            })?;

        let applied = self
            .diff_applier
            .apply(id, &source.path(MapFileType::Map), &diff, &output, cancel)
            .and_then(|()| {
                self.verify(id, &output, catalog).map_err(|e| {
                    let _ = remove_if_exists(&output);
                    e
                })
            });
        remove_if_exists(&diff)?;
        applied
    }

    /// Size check always; hash check only when integrity checks are enabled
    /// and the catalog carries a hash.
    fn verify(&self, id: &CountryId, path: &Path, catalog: &Catalog) -> StorageResult<()> {
        let sha256 = if self.config.verify_integrity {
            catalog.lookup(id.as_str()).and_then(|c| c.sha256.as_deref())
        } else {
            None
        };
        verify_file(path, catalog.total_size(id.as_str()), sha256)
    }

    fn on_finalized(&self, task: QueuedTask, result: StorageResult<()>) {
        let mut state = self.state.lock();
        let catalog = self.catalog();
        let id = task.country_id.clone();
        let wanted = state.finalizing.remove(&id).is_some();

        match result {
            Ok(()) if wanted => self.register_download(&mut state, &task),
            Ok(()) => {
                debug!(country = %id, "Cancelled while finalizing, removing package");
                let output = file_path(&self.config.writable_root, task.target_version, &id, MapFileType::Map);
                if let Err(e) = remove_if_exists(&output) {
                    warn!(country = %id, error = %e, "Failed to remove cancelled package");
                }
                remove_dir_if_empty(&version_dir(&self.config.writable_root, task.target_version));
            }
            Err(StorageError::Cancelled) => {
                debug!(country = %id, "Finalization cancelled");
            }
            Err(e) if task.is_diff() => {
                warn!(country = %id, error = %e, "Diff failed, falling back to full download");
                self.diffs.remove(id.as_str());
                if wanted {
                    state.queue.enqueue(self.full_task(&catalog, &id));
                }
            }
            Err(e) => {
                if wanted {
                    error!(country = %id, error = %e, "Failed to place package");
                    state.failed.insert(id.clone(), e.kind());
                }
            }
        }

        let mut events = self.status_events(&state, &catalog, std::slice::from_ref(&id));
        self.pump(&mut state, &catalog, &mut events);
        self.emit_status(events);
    }

    /// Register a freshly placed package and purge the versions it
    /// replaces.
    fn register_download(&self, state: &mut State, task: &QueuedTask) {
        let id = &task.country_id;
        let version = task.target_version;

        let mut file = LocalFile::new(
            version_dir(&self.config.writable_root, version),
            id.clone(),
            version,
        );
        file.sync_with_disk();
        self.local_files.register(file.clone());
        if task.is_diff() {
            self.diffs.mark_applied(id.as_str());
        }
        state.failed.remove(id);
        state
            .just_downloaded
            .insert(id.clone(), file.size(MapFileType::Map));

        let (_handle, result) = self.mwm.register(file.clone());
        if result != RegResult::Success {
            warn!(country = %id, version, ?result, "Downloaded package not registered");
        }

        for old in self
            .local_files
            .versions(id.as_str())
            .into_iter()
            .filter(|old| old.version() < version)
        {
            self.delete_local_version(old);
        }

        info!(country = %id, version, bytes = file.size(MapFileType::Map), "Package on disk");

        if let Some(hook) = &self.on_downloaded {
            let hook = Arc::clone(hook);
            let id = id.clone();
            self.runners.events.spawn(Box::new(move || hook(&id, &file)));
        }
    }
}
