//! The storage orchestrator.
//!
//! [`Storage`] owns the catalog, the local file registry, the handle
//! registry, the diff catalog and the download queue, and exposes the
//! public command and status API.
//!
//! # Architecture
//!
//! ```text
//! Storage ── state mutex ──┬── DownloadQueue (one active transfer)
//!    │                     ├── failed / finalizing / obsolete sets
//!    │                     └── status derivation
//!    │
//!    ├── network runner ── Downloader::fetch ──▶ <id>.mwm.ready
//!    ├── files runner ──── rename / DiffApplier ──▶ <root>/<version>/<id>.mwm
//!    └── events runner ─── subscriber callbacks
//! ```
//!
//! Every mutating call takes the state mutex, updates the queue and sets,
//! computes the resulting statuses and hands them to the events runner.
//! Subscribers therefore see status changes for one package in order and
//! never on the caller's thread.
//!
//! # Example
//!
//! ```ignore
//! use mapstore::{Catalog, Storage, StorageConfig};
//!
//! let config = StorageConfig::new("/var/lib/mapstore").with_server("https://cdn.example.com/");
//! let storage = Storage::builder(config)
//!     .with_catalog(Catalog::load_file("countries.txt".as_ref())?)
//!     .build()?;
//!
//! storage.register_all_local_maps()?;
//! let _subscription = storage.subscribe(
//!     |event| println!("{} is {}", event.country_id, event.status),
//!     |event| println!("{}: {} bytes", event.country_id, event.progress.bytes_downloaded),
//! );
//! storage.download_node("Algeria")?;
//! ```

mod events;
mod info;
mod status;
mod transfer;

pub use events::{
    DownloadedCallback, ProgressCallback, ProgressEvent, StatusCallback, StatusEvent, Subscription,
};
pub use info::{NodeAttrs, UpdateInfo};
pub use status::{aggregate_status, derive_status, LeafState, Status};

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::StorageConfig;
use crate::country::{Catalog, CountryId, DataVersion};
use crate::diff::{DiffApplier, DiffCatalog, DiffSource, DiffStatus, HttpDiffSource, PatchApplier};
use crate::download::{DownloadQueue, Downloader, HttpDownloader, Progress, QueueMembership, QueuedTask};
use crate::error::{ErrorKind, StorageError, StorageResult};
use crate::local::{
    delete_stale_resumes, file_path, remove_dir_if_empty, remove_if_exists, transient_path,
    version_dir, LocalFile, LocalFileRegistry, MapFileType, TransientSuffix,
};
use crate::mwm::{MwmHandle, MwmRegistry, RegResult};
use crate::runner::{TaskRunner, ThreadRunner};
use events::{SharedSubscribers, Subscribers};
use status::error_for;

/// A fetched package being placed or patched on the files runner.
#[derive(Debug)]
struct Finalizing {
    cancel: CancellationToken,
    size: u64,
}

/// Everything guarded by the orchestrator's single lock.
#[derive(Debug, Default)]
struct State {
    queue: DownloadQueue,
    failed: HashMap<CountryId, ErrorKind>,
    finalizing: HashMap<CountryId, Finalizing>,
    obsolete: HashSet<CountryId>,
    /// Sizes of packages finished during the current queue run, kept so
    /// group progress does not fall back when the next leaf starts.
    just_downloaded: HashMap<CountryId, u64>,
}

struct Runners {
    network: Arc<dyn TaskRunner>,
    files: Arc<dyn TaskRunner>,
    events: Arc<dyn TaskRunner>,
}

struct Inner {
    me: Weak<Inner>,
    config: StorageConfig,
    catalog: RwLock<Arc<Catalog>>,
    local_files: LocalFileRegistry,
    mwm: MwmRegistry,
    diffs: DiffCatalog,
    downloader: Arc<dyn Downloader>,
    diff_source: Option<Arc<dyn DiffSource>>,
    diff_applier: Arc<dyn DiffApplier>,
    runners: Runners,
    state: Mutex<State>,
    subscribers: SharedSubscribers,
    on_downloaded: Option<DownloadedCallback>,
}

/// Builds a [`Storage`] with injected collaborators.
///
/// Anything not supplied falls back to the production implementation:
/// HTTP downloader and diff source from the config, the patch applier and
/// one worker thread per runner.
pub struct StorageBuilder {
    config: StorageConfig,
    catalog: Option<Catalog>,
    downloader: Option<Arc<dyn Downloader>>,
    diff_source: Option<Arc<dyn DiffSource>>,
    diff_applier: Option<Arc<dyn DiffApplier>>,
    network: Option<Arc<dyn TaskRunner>>,
    files: Option<Arc<dyn TaskRunner>>,
    events: Option<Arc<dyn TaskRunner>>,
    on_downloaded: Option<DownloadedCallback>,
}

impl StorageBuilder {
    pub fn new(config: StorageConfig) -> Self {
        Self {
            config,
            catalog: None,
            downloader: None,
            diff_source: None,
            diff_applier: None,
            network: None,
            files: None,
            events: None,
            on_downloaded: None,
        }
    }

    pub fn with_catalog(mut self, catalog: Catalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn with_downloader(mut self, downloader: Arc<dyn Downloader>) -> Self {
        self.downloader = Some(downloader);
        self
    }

    pub fn with_diff_source(mut self, source: Arc<dyn DiffSource>) -> Self {
        self.diff_source = Some(source);
        self
    }

    pub fn with_diff_applier(mut self, applier: Arc<dyn DiffApplier>) -> Self {
        self.diff_applier = Some(applier);
        self
    }

    pub fn with_network_runner(mut self, runner: Arc<dyn TaskRunner>) -> Self {
        self.network = Some(runner);
        self
    }

    pub fn with_files_runner(mut self, runner: Arc<dyn TaskRunner>) -> Self {
        self.files = Some(runner);
        self
    }

    pub fn with_events_runner(mut self, runner: Arc<dyn TaskRunner>) -> Self {
        self.events = Some(runner);
        self
    }

    /// Use one runner for network, files and events.
    pub fn with_runner(self, runner: Arc<dyn TaskRunner>) -> Self {
        self.with_network_runner(Arc::clone(&runner))
            .with_files_runner(Arc::clone(&runner))
            .with_events_runner(runner)
    }

    /// Hook run on the events runner after each package lands on disk.
    pub fn on_downloaded(
        mut self,
        hook: impl Fn(&CountryId, &LocalFile) + Send + Sync + 'static,
    ) -> Self {
        self.on_downloaded = Some(Arc::new(hook));
        self
    }

    pub fn build(self) -> StorageResult<Storage> {
        let config = self.config;
        config.validate()?;

        let catalog = self
            .catalog
            .ok_or_else(|| StorageError::InvalidConfig("a catalog is required".to_string()))?;

        fs::create_dir_all(&config.writable_root)
            .map_err(|e| StorageError::disk(&config.writable_root, e))?;

        let downloader: Arc<dyn Downloader> = match self.downloader {
            Some(downloader) => downloader,
            None => Arc::new(HttpDownloader::new(config.fetch_timeout)?),
        };

        let diff_source: Option<Arc<dyn DiffSource>> = match (self.diff_source, &config.diff_manifest_url) {
            (Some(source), _) => Some(source),
            (None, Some(url)) => Some(Arc::new(HttpDiffSource::new(
                url.clone(),
                config.manifest_timeout,
            )?) as Arc<dyn DiffSource>),
            (None, None) => None,
        };

        let network: Arc<dyn TaskRunner> = match self.network {
            Some(runner) => runner,
            None => Arc::new(ThreadRunner::new("mapstore-network")?),
        };
        let files: Arc<dyn TaskRunner> = match self.files {
            Some(runner) => runner,
            None => Arc::new(ThreadRunner::new("mapstore-files")?),
        };
        let events: Arc<dyn TaskRunner> = match self.events {
            Some(runner) => runner,
            None => Arc::new(ThreadRunner::new("mapstore-events")?),
        };

        info!(
            root = %config.writable_root.display(),
            version = catalog.version(),
            servers = config.servers.len(),
            diffs = diff_source.is_some(),
            "Storage created"
        );

        let mwm = MwmRegistry::new(config.min_supported_version);
        let inner = Arc::new_cyclic(|me| Inner {
            me: me.clone(),
            catalog: RwLock::new(Arc::new(catalog)),
            local_files: LocalFileRegistry::new(),
            mwm,
            diffs: DiffCatalog::new(),
            downloader,
            diff_source,
            diff_applier: self
                .diff_applier
                .unwrap_or_else(|| Arc::new(PatchApplier::new())),
            runners: Runners {
                network,
                files,
                events,
            },
            state: Mutex::new(State::default()),
            subscribers: SharedSubscribers::default(),
            on_downloaded: self.on_downloaded,
            config,
        });

        Ok(Storage { inner })
    }
}

/// The storage orchestrator. Cloning shares the same instance.
#[derive(Clone)]
pub struct Storage {
    inner: Arc<Inner>,
}

impl Storage {
    pub fn builder(config: StorageConfig) -> StorageBuilder {
        StorageBuilder::new(config)
    }

    pub fn config(&self) -> &StorageConfig {
        &self.inner.config
    }

    /// The current catalog.
    pub fn catalog(&self) -> Arc<Catalog> {
        self.inner.catalog()
    }

    pub fn current_version(&self) -> DataVersion {
        self.inner.catalog().version()
    }

    pub fn local_files(&self) -> &LocalFileRegistry {
        &self.inner.local_files
    }

    pub fn mwm_registry(&self) -> &MwmRegistry {
        &self.inner.mwm
    }

    pub fn diffs(&self) -> &DiffCatalog {
        &self.inner.diffs
    }

    /// Acquire a consumer handle to a package's registered file.
    pub fn get_handle(&self, id: &str) -> Option<MwmHandle> {
        self.inner.mwm.get_handle(id)
    }

    /// Scan the writable root and register what is found.
    ///
    /// For each package the newest version with a full file is registered
    /// with the handle registry; older versions are deleted unless a
    /// consumer holds them, and leftover diff files are removed. Returns
    /// the number of packages registered.
    pub fn register_all_local_maps(&self) -> StorageResult<usize> {
        let inner = &self.inner;
        let state = inner.state.lock();
        if !state.queue.is_empty() || !state.finalizing.is_empty() {
            return Err(StorageError::DownloadInProgress);
        }
        let catalog = inner.catalog();

        let stale = delete_stale_resumes(inner.root(), catalog.version())?;
        if stale > 0 {
            debug!(stale, "Deleted partial downloads of old versions");
        }
        inner
            .local_files
            .scan(&[inner.config.writable_root.clone()])?;
        inner.migrate_renamed_packages(&catalog);

        let mut registered = 0;
        let mut changed = Vec::new();
        for id in inner.local_files.countries() {
            let mut newest_registered = false;
            for file in inner.local_files.versions(id.as_str()) {
                let mut file = file;
                if file.on_disk(MapFileType::Diff) {
                    debug!(country = %id, version = file.version(), "Removing unapplied diff");
                    file.delete_from_disk(MapFileType::Diff)?;
                }
                let file = inner.local_files.sync_with_disk(&file);
                if !file.has_files() {
                    inner.local_files.remove(id.as_str(), file.version());
                    continue;
                }

                if !newest_registered && file.on_disk(MapFileType::Map) {
                    newest_registered = true;
                    match inner.mwm.register(file.clone()) {
                        (_, RegResult::Success) => registered += 1,
                        (_, result) => {
                            warn!(country = %id, version = file.version(), ?result, "Local file not registered")
                        }
                    }
                    continue;
                }

                inner.delete_local_version(file);
            }
            if catalog.contains(id.as_str()) {
                changed.push(id);
            }
        }

        info!(registered, "Local maps registered");
        let events = inner.status_events(&state, &catalog, &changed);
        inner.emit_status(events);
        Ok(registered)
    }

    /// Download every leaf of a node that is not already up to date.
    ///
    /// Leaves are enqueued in pre-order. Out-of-date leaves use a diff when
    /// one covers the local version. Already queued leaves are left alone.
    pub fn download_node(&self, id: &str) -> StorageResult<()> {
        self.enqueue_leaves(id, |_, _| true)
    }

    /// Update every out-of-date leaf of a node, preferring diffs.
    pub fn update_node(&self, id: &str) -> StorageResult<()> {
        self.enqueue_leaves(id, |_, status| status == Status::OnDiskOutOfDate)
    }

    /// Re-issue downloads for the failed leaves of a node.
    pub fn retry_download_node(&self, id: &str) -> StorageResult<()> {
        self.enqueue_leaves(id, |filter, _| filter == LeafFilter::Failed)
    }

    fn enqueue_leaves(
        &self,
        id: &str,
        wanted: impl Fn(LeafFilter, Status) -> bool,
    ) -> StorageResult<()> {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        let catalog = inner.catalog();
        require(&catalog, id)?;

        let mut changed = Vec::new();
        for leaf in catalog.leaves_in_subtree(id) {
            let (status, _) = inner.leaf_status(&state, &catalog, leaf.as_str());
            let filter = if state.failed.contains_key(&leaf) {
                LeafFilter::Failed
            } else {
                LeafFilter::Any
            };
            if wanted(filter, status) && inner.enqueue_leaf(&mut state, &catalog, &leaf) {
                changed.push(leaf);
            }
        }

        let mut events = inner.status_events(&state, &catalog, &changed);
        inner.pump(&mut state, &catalog, &mut events);
        inner.emit_status(events);
        Ok(())
    }

    /// Cancel queued, active or finalizing downloads in a subtree.
    ///
    /// Partial output is deleted and the next queued package starts.
    pub fn cancel_download(&self, id: &str) -> StorageResult<()> {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        let catalog = inner.catalog();
        require(&catalog, id)?;

        let changed: Vec<CountryId> = catalog
            .leaves_in_subtree(id)
            .into_iter()
            .filter(|leaf| inner.cancel_leaf(&mut state, leaf))
            .collect();

        let mut events = inner.status_events(&state, &catalog, &changed);
        inner.pump(&mut state, &catalog, &mut events);
        inner.emit_status(events);
        Ok(())
    }

    /// Delete every local file in a subtree.
    ///
    /// Fails with [`StorageError::FileLocked`] without deleting anything if
    /// a consumer holds a handle to any leaf of the subtree.
    pub fn delete_node(&self, id: &str) -> StorageResult<()> {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        let catalog = inner.catalog();
        require(&catalog, id)?;

        let leaves = catalog.leaves_in_subtree(id);
        inner.mwm.deregister_all(&leaves)?;

        for leaf in &leaves {
            inner.cancel_leaf(&mut state, leaf);
            for file in inner.local_files.remove_all(leaf.as_str()) {
                inner.delete_local_version(file);
            }
            inner.delete_partials(&catalog, leaf);
            inner.diffs.remove(leaf.as_str());
            info!(country = %leaf, "Deleted local files");
        }

        let mut events = inner.status_events(&state, &catalog, &leaves);
        inner.pump(&mut state, &catalog, &mut events);
        inner.emit_status(events);
        Ok(())
    }

    /// Mark every leaf of a subtree obsolete. Pending downloads are
    /// cancelled and the leaves are excluded from future downloads.
    pub fn mark_obsolete(&self, id: &str) -> StorageResult<()> {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        let catalog = inner.catalog();
        require(&catalog, id)?;

        let leaves = catalog.leaves_in_subtree(id);
        for leaf in &leaves {
            inner.cancel_leaf(&mut state, leaf);
            inner.diffs.remove(leaf.as_str());
            state.obsolete.insert(leaf.clone());
        }

        let mut events = inner.status_events(&state, &catalog, &leaves);
        inner.pump(&mut state, &catalog, &mut events);
        inner.emit_status(events);
        Ok(())
    }

    pub fn status(&self, id: &str) -> StorageResult<Status> {
        self.status_and_error(id).map(|(status, _)| status)
    }

    /// Status plus the error kind of the last failure (`None` unless the
    /// status is `DownloadFailed`).
    pub fn status_and_error(&self, id: &str) -> StorageResult<(Status, ErrorKind)> {
        let state = self.inner.state.lock();
        let catalog = self.inner.catalog();
        require(&catalog, id)?;
        Ok(self.inner.node_status(&state, &catalog, id))
    }

    pub fn node_attrs(&self, id: &str) -> StorageResult<NodeAttrs> {
        let inner = &self.inner;
        let state = inner.state.lock();
        let catalog = inner.catalog();
        require(&catalog, id)?;

        let (status, error) = inner.node_status(&state, &catalog, id);
        let leaves = catalog.leaves_in_subtree(id);
        let mwm_size = catalog.total_size(id);
        let mut attrs = NodeAttrs {
            status,
            error,
            mwm_counter: leaves.len(),
            mwm_size,
            local_mwm_counter: 0,
            local_mwm_size: 0,
            downloading_mwm_counter: 0,
            downloading_mwm_size: 0,
            progress: if status == Status::OnDisk {
                Progress::complete(mwm_size)
            } else {
                inner.node_progress(&state, &catalog, id)
            },
            present: inner.local_files.contains(id),
        };

        for leaf in &leaves {
            let (leaf_status, _) = inner.leaf_status(&state, &catalog, leaf.as_str());
            if leaf_status != Status::NotDownloaded {
                attrs.downloading_mwm_counter += 1;
                attrs.downloading_mwm_size += catalog.total_size(leaf.as_str());
            }
            if let Some(file) = inner.local_files.latest(leaf.as_str()) {
                attrs.local_mwm_counter += 1;
                attrs.local_mwm_size += file.size(MapFileType::Map);
            }
        }
        Ok(attrs)
    }

    /// Cost of updating the out-of-date leaves of a subtree.
    pub fn update_info(&self, id: &str) -> StorageResult<UpdateInfo> {
        let inner = &self.inner;
        let state = inner.state.lock();
        let catalog = inner.catalog();
        require(&catalog, id)?;

        let mut info = UpdateInfo::default();
        for leaf in catalog.leaves_in_subtree(id) {
            let (status, _) = inner.leaf_status(&state, &catalog, leaf.as_str());
            if status != Status::OnDiskOutOfDate {
                continue;
            }
            let remote = catalog.total_size(leaf.as_str());
            let local = inner
                .local_files
                .latest_map(leaf.as_str())
                .map(|f| f.size(MapFileType::Map))
                .unwrap_or(0);

            info.files_to_update += 1;
            info.max_file_size = info.max_file_size.max(remote);
            info.total_download_size += inner
                .diffs
                .size_to_download(leaf.as_str())
                .unwrap_or(remote);
            info.size_difference += remote as i64 - local as i64;
        }
        Ok(info)
    }

    /// Catalog size of a node.
    pub fn node_size(&self, id: &str) -> StorageResult<u64> {
        let catalog = self.inner.catalog();
        require(&catalog, id)?;
        Ok(catalog.total_size(id))
    }

    /// Aggregated progress of the queued and downloading leaves of a node.
    pub fn node_progress(&self, id: &str) -> StorageResult<Progress> {
        let state = self.inner.state.lock();
        let catalog = self.inner.catalog();
        require(&catalog, id)?;
        Ok(self.inner.node_progress(&state, &catalog, id))
    }

    /// Direct children of a node that are queued or downloading.
    pub fn queued_children(&self, id: &str) -> StorageResult<Vec<CountryId>> {
        let state = self.inner.state.lock();
        let catalog = self.inner.catalog();
        require(&catalog, id)?;
        Ok(catalog
            .children(id)
            .iter()
            .filter(|child| {
                self.inner
                    .node_status(&state, &catalog, child.as_str())
                    .0
                    .is_pending()
            })
            .cloned()
            .collect())
    }

    /// Ids in the download queue, active first.
    pub fn queue(&self) -> Vec<CountryId> {
        self.inner.state.lock().queue.ids()
    }

    /// Check whether anything is queued, transferring or being placed.
    pub fn is_downloading(&self) -> bool {
        let state = self.inner.state.lock();
        !state.queue.is_empty() || !state.finalizing.is_empty()
    }

    /// Newest local version of a package.
    pub fn local_file(&self, id: &str) -> Option<LocalFile> {
        self.inner.local_files.latest(id)
    }

    pub fn version(&self, id: &str) -> Option<DataVersion> {
        self.local_file(id).map(|f| f.version())
    }

    /// Ask the diff source which local packages can be updated with a diff.
    ///
    /// Blocks for at most the manifest timeout. Failures only mean "no
    /// diffs": queued diff downloads without a diff any more become full
    /// downloads.
    pub fn refresh_diffs(&self) -> DiffStatus {
        let inner = &self.inner;
        let Some(source) = inner.diff_source.clone() else {
            inner.diffs.abort();
            return DiffStatus::NotAvailable;
        };

        let catalog = inner.catalog();
        let obsolete = inner.state.lock().obsolete.clone();
        let versions: BTreeMap<CountryId, DataVersion> = inner
            .local_files
            .countries()
            .into_iter()
            .filter(|id| catalog.is_leaf(id.as_str()) && !obsolete.contains(id))
            .filter_map(|id| {
                let version = inner.local_files.latest_map(id.as_str())?.version();
                Some((id, version))
            })
            .collect();

        if let Err(e) = inner.diffs.refresh(source.as_ref(), &versions, catalog.version()) {
            warn!(error = %e, "Diff refresh failed, full downloads will be used");
        }

        let mut state = inner.state.lock();
        inner.convert_absent_diffs(&mut state, &catalog);
        inner.diffs.status()
    }

    /// Swap in a newer catalog.
    ///
    /// Refused while downloads are in progress. The diff scheme is aborted
    /// and every package with local files is re-announced, so packages of
    /// the previous version report `OnDiskOutOfDate`.
    pub fn apply_catalog(&self, catalog: Catalog) -> StorageResult<()> {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        if !state.queue.is_empty() || !state.finalizing.is_empty() {
            return Err(StorageError::DownloadInProgress);
        }

        let current = inner.catalog().version();
        if catalog.version() <= current {
            return Err(StorageError::InvalidConfig(format!(
                "catalog version {} is not newer than {}",
                catalog.version(),
                current
            )));
        }

        info!(from = current, to = catalog.version(), "Applying new catalog");
        *inner.catalog.write() = Arc::new(catalog);
        inner.diffs.abort();
        state.failed.clear();

        let catalog = inner.catalog();
        if let Err(e) = delete_stale_resumes(inner.root(), catalog.version()) {
            warn!(error = %e, "Failed to delete partial downloads of the old version");
        }
        let changed: Vec<CountryId> = inner
            .local_files
            .countries()
            .into_iter()
            .filter(|id| catalog.contains(id.as_str()))
            .collect();
        let events = inner.status_events(&state, &catalog, &changed);
        inner.emit_status(events);
        Ok(())
    }

    /// Cancel all downloads and delete every local package not held by a
    /// consumer. Returns the packages kept because they are locked.
    pub fn delete_all_local_maps(&self) -> StorageResult<Vec<CountryId>> {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        let catalog = inner.catalog();

        let mut changed = inner.drop_all_downloads(&mut state);
        state.failed.clear();

        let mut kept = Vec::new();
        for id in inner.local_files.countries() {
            let lock_count = inner.mwm.lock_count(id.as_str());
            if lock_count > 0 {
                warn!(country = %id, lock_count, "Keeping file in use");
                kept.push(id);
                continue;
            }
            inner.mwm.deregister(id.as_str())?;
            for file in inner.local_files.remove_all(id.as_str()) {
                inner.delete_local_version(file);
            }
            inner.diffs.remove(id.as_str());
            changed.push(id);
        }

        changed.retain(|id| catalog.contains(id.as_str()));
        let events = inner.status_events(&state, &catalog, &changed);
        inner.emit_status(events);
        Ok(kept)
    }

    /// Drop the queue, failures and registry state. Files stay on disk.
    pub fn clear(&self) {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        inner.drop_all_downloads(&mut state);
        state.failed.clear();
        state.obsolete.clear();
        inner.local_files.clear();
        let locked = inner.mwm.clear();
        if !locked.is_empty() {
            warn!(count = locked.len(), "Locked files stay registered");
        }
        inner.diffs.abort();
        info!("Storage state cleared");
    }

    /// Register status and progress callbacks. They run on the events
    /// runner until the returned subscription is dropped.
    pub fn subscribe(
        &self,
        on_status: impl Fn(&StatusEvent) + Send + Sync + 'static,
        on_progress: impl Fn(&ProgressEvent) + Send + Sync + 'static,
    ) -> Subscription {
        Subscribers::subscribe(
            &self.inner.subscribers,
            Box::new(on_status),
            Box::new(on_progress),
        )
    }

    /// Explicitly end a subscription. Equivalent to dropping it.
    pub fn unsubscribe(&self, subscription: Subscription) {
        drop(subscription);
    }
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Storage")
            .field("root", &self.inner.config.writable_root)
            .field("version", &self.current_version())
            .finish()
    }
}

/// How a leaf matched when selecting leaves to enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LeafFilter {
    Any,
    Failed,
}

fn require(catalog: &Catalog, id: &str) -> StorageResult<()> {
    if catalog.contains(id) {
        Ok(())
    } else {
        Err(StorageError::UnknownCountry(CountryId::from(id)))
    }
}

impl Inner {
    fn catalog(&self) -> Arc<Catalog> {
        Arc::clone(&self.catalog.read())
    }

    fn root(&self) -> &Path {
        &self.config.writable_root
    }

    fn leaf_status(&self, state: &State, catalog: &Catalog, id: &str) -> (Status, ErrorKind) {
        let local = self.local_files.latest_map(id);
        let failure = state.failed.get(id).copied();
        let status = derive_status(&LeafState {
            local: local.as_ref(),
            current_version: catalog.version(),
            membership: state.queue.membership(id),
            finalizing: state.finalizing.contains_key(id),
            failed: failure.is_some(),
            obsolete: state.obsolete.contains(id),
        });
        (status, error_for(status, failure))
    }

    fn node_status(&self, state: &State, catalog: &Catalog, id: &str) -> (Status, ErrorKind) {
        if catalog.is_leaf(id) {
            return self.leaf_status(state, catalog, id);
        }
        let status = aggregate_status(
            catalog
                .leaves_in_subtree(id)
                .iter()
                .map(|leaf| self.leaf_status(state, catalog, leaf.as_str()).0),
        );
        (status, ErrorKind::None)
    }

    fn node_progress(&self, state: &State, catalog: &Catalog, id: &str) -> Progress {
        let mut total = Progress::default();
        for leaf in catalog.leaves_in_subtree(id) {
            let leaf = leaf.as_str();
            match state.queue.membership(leaf) {
                QueueMembership::Active => {
                    if let Some(active) = state.queue.active() {
                        total = total.merge(active.progress);
                    }
                }
                QueueMembership::Queued => {
                    let size = state.queue.task(leaf).map(|t| t.expected_size).unwrap_or(0);
                    total = total.merge(Progress::new(0, size));
                }
                QueueMembership::None => {
                    let done = state
                        .finalizing
                        .get(leaf)
                        .map(|f| f.size)
                        .or_else(|| state.just_downloaded.get(leaf).copied());
                    if let Some(size) = done {
                        total = total.merge(Progress::complete(size));
                    }
                }
            }
        }
        total
    }

    /// Status of each changed leaf followed by its ancestors, parent first.
    fn status_events(&self, state: &State, catalog: &Catalog, changed: &[CountryId]) -> Vec<StatusEvent> {
        let mut seen = HashSet::new();
        let mut events = Vec::new();
        for leaf in changed {
            let chain = std::iter::once(leaf.clone())
                .chain(catalog.ancestors(leaf.as_str()).into_iter().rev());
            for id in chain {
                if !seen.insert(id.clone()) {
                    continue;
                }
                let (status, error) = self.node_status(state, catalog, id.as_str());
                events.push(StatusEvent {
                    country_id: id,
                    status,
                    error,
                });
            }
        }
        events
    }

    fn emit_status(&self, events: Vec<StatusEvent>) {
        if events.is_empty() {
            return;
        }
        let subscribers = Arc::clone(&self.subscribers);
        self.runners
            .events
            .spawn(Box::new(move || Subscribers::deliver_status(&subscribers, &events)));
    }

    fn emit_progress(&self, events: Vec<ProgressEvent>) {
        if events.is_empty() {
            return;
        }
        let subscribers = Arc::clone(&self.subscribers);
        self.runners
            .events
            .spawn(Box::new(move || Subscribers::deliver_progress(&subscribers, &events)));
    }

    /// Full download of a package at the catalog version.
    fn full_task(&self, catalog: &Catalog, id: &CountryId) -> QueuedTask {
        QueuedTask {
            country_id: id.clone(),
            file_kind: MapFileType::Map,
            download_path: file_path(self.root(), catalog.version(), id, MapFileType::Map),
            expected_size: catalog.total_size(id.as_str()),
            target_version: catalog.version(),
            source_version: None,
        }
    }

    /// A diff task when a diff covers the newest local package, otherwise
    /// a full download.
    fn make_task(&self, catalog: &Catalog, id: &CountryId) -> QueuedTask {
        let version = catalog.version();
        let diff = self
            .local_files
            .latest_map(id.as_str())
            .filter(|local| local.version() < version)
            .and_then(|local| {
                self.diffs.get(id.as_str()).filter(|diff| {
                    diff.source_version == local.version() && diff.target_version == version
                })
            });

        match diff {
            Some(diff) => QueuedTask {
                country_id: id.clone(),
                file_kind: MapFileType::Diff,
                download_path: file_path(self.root(), version, id, MapFileType::Diff),
                expected_size: diff.size,
                target_version: version,
                source_version: Some(diff.source_version),
            },
            None => self.full_task(catalog, id),
        }
    }

    /// Enqueue one leaf. Returns `false` if it was skipped.
    fn enqueue_leaf(&self, state: &mut State, catalog: &Catalog, id: &CountryId) -> bool {
        if state.obsolete.contains(id)
            || state.queue.contains(id.as_str())
            || state.finalizing.contains_key(id)
        {
            return false;
        }
        let (status, _) = self.leaf_status(state, catalog, id.as_str());
        if status == Status::OnDisk {
            return false;
        }
        state.failed.remove(id);
        state.queue.enqueue(self.make_task(catalog, id))
    }

    /// Promote the next queued task and start its transfer on the network
    /// runner.
    fn pump(&self, state: &mut State, catalog: &Catalog, events: &mut Vec<StatusEvent>) {
        let (task, generation, cancel) = match state.queue.start_next() {
            Some(active) => (active.task.clone(), active.generation, active.cancel.clone()),
            None => {
                if state.finalizing.is_empty() {
                    state.just_downloaded.clear();
                }
                return;
            }
        };

        info!(
            country = %task.country_id,
            kind = ?task.file_kind,
            bytes = task.expected_size,
            "Starting download"
        );
        events.extend(self.status_events(state, catalog, std::slice::from_ref(&task.country_id)));

        let me = self.me.clone();
        self.runners.network.spawn(Box::new(move || {
            if let Some(inner) = me.upgrade() {
                inner.run_transfer(task, generation, cancel);
            }
        }));
    }

    /// Cancel whatever is pending for a leaf. Returns `true` if anything
    /// changed.
    fn cancel_leaf(&self, state: &mut State, id: &CountryId) -> bool {
        let mut changed = match state.queue.cancel(id.as_str()) {
            Some(cancelled) => {
                self.delete_transfer_output(cancelled.task());
                true
            }
            None => match state.finalizing.remove(id) {
                Some(finalizing) => {
                    finalizing.cancel.cancel();
                    true
                }
                None => false,
            },
        };
        changed |= state.failed.remove(id).is_some();
        changed
    }

    /// Cancel and forget every queued, active and finalizing download.
    fn drop_all_downloads(&self, state: &mut State) -> Vec<CountryId> {
        let mut dropped = Vec::new();
        for task in state.queue.clear() {
            self.delete_transfer_output(&task);
            dropped.push(task.country_id);
        }
        for (id, finalizing) in state.finalizing.drain() {
            finalizing.cancel.cancel();
            dropped.push(id);
        }
        state.just_downloaded.clear();
        dropped
    }

    /// Remove the transient files of a transfer.
    fn delete_transfer_output(&self, task: &QueuedTask) {
        self.delete_transient_files(&task.country_id, &task.download_path);
    }

    fn delete_transient_files(&self, id: &CountryId, final_path: &Path) {
        for suffix in [
            TransientSuffix::Downloading,
            TransientSuffix::Resume,
            TransientSuffix::Ready,
        ] {
            if let Err(e) = remove_if_exists(&transient_path(final_path, suffix)) {
                warn!(country = %id, error = %e, "Failed to delete partial download");
            }
        }
    }

    /// Remove the current-version partials of both package kinds.
    fn delete_partials(&self, catalog: &Catalog, id: &CountryId) {
        for kind in MapFileType::ALL {
            let path = file_path(self.root(), catalog.version(), id, kind);
            self.delete_transient_files(id, &path);
        }
        if catalog.version() > 0 {
            remove_dir_if_empty(&version_dir(self.root(), catalog.version()));
        }
    }

    /// Rename local packages whose id the catalog lists as a deprecated
    /// alias of exactly one current package. Packages split into several
    /// new ones are left as they are.
    fn migrate_renamed_packages(&self, catalog: &Catalog) {
        for old_id in self.local_files.countries() {
            if catalog.contains(old_id.as_str()) {
                continue;
            }
            let targets = catalog.find_by_old_id(old_id.as_str());
            let [new_id] = targets.as_slice() else {
                if !targets.is_empty() {
                    debug!(country = %old_id, parts = targets.len(), "Split package not migrated");
                }
                continue;
            };
            if self.local_files.contains(new_id.as_str()) {
                continue;
            }

            for mut file in self.local_files.remove_all(old_id.as_str()) {
                if !file.on_disk(MapFileType::Map) {
                    self.local_files.register(file);
                    continue;
                }
                if let Err(e) = file.delete_from_disk(MapFileType::Diff) {
                    warn!(country = %old_id, error = %e, "Failed to delete diff of renamed package");
                }
                let mut renamed = LocalFile::new(file.directory(), new_id.clone(), file.version());
                let from = file.path(MapFileType::Map);
                let to = renamed.path(MapFileType::Map);
                match fs::rename(&from, &to) {
                    Ok(()) => {
                        renamed.sync_with_disk();
                        info!(from = %old_id, to = %new_id, version = file.version(), "Migrated renamed package");
                        self.local_files.register(renamed);
                    }
                    Err(e) => {
                        warn!(country = %old_id, error = %e, "Failed to migrate renamed package");
                        self.local_files.register(file);
                    }
                }
            }
        }
    }

    /// Delete one version's files and drop it from the registry, unless a
    /// consumer holds it.
    fn delete_local_version(&self, mut file: LocalFile) {
        let id = file.country_id().clone();
        let version = file.version();
        if self.mwm.is_locked(id.as_str(), version) {
            warn!(country = %id, version, "Version in use, keeping it on disk");
            return;
        }
        if let Err(e) = file.delete_all_from_disk() {
            warn!(country = %id, version, error = %e, "Failed to delete old version");
            return;
        }
        self.local_files.remove(id.as_str(), version);
        if version > 0 {
            remove_dir_if_empty(file.directory());
        }
        debug!(country = %id, version, "Deleted local version");
    }

    /// Turn queued diff downloads whose diff is gone into full downloads.
    fn convert_absent_diffs(&self, state: &mut State, catalog: &Catalog) {
        for task in state.queue.pending_mut() {
            if task.is_diff() && !self.diffs.has_diff_for(task.country_id.as_str()) {
                debug!(country = %task.country_id, "Diff no longer available, using full download");
                *task = self.full_task(catalog, &task.country_id);
            }
        }
    }

    /// Drop the diff scheme: every queued diff becomes a full download.
    fn abort_diff_scheme(&self, state: &mut State, catalog: &Catalog) {
        self.diffs.abort();
        self.convert_absent_diffs(state, catalog);
    }
}
