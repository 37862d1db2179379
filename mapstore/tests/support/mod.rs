//! Fixtures shared by the storage integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use mapstore::diff::{DiffRequest, DiffResponse, DiffResponseEntry, DiffSource};
use mapstore::download::{Downloader, FetchRequest};
use mapstore::runner::ManualRunner;
use mapstore::{
    Catalog, CountryId, DataVersion, Progress, ProgressEvent, Status, StatusEvent, Storage,
    StorageConfig, StorageError, StorageResult, Subscription,
};
use tempfile::TempDir;

pub const SERVER: &str = "http://maps.test/";
pub const CHUNK: usize = 1024;

pub const ABKHAZIA_SIZE: u64 = 4096;
pub const CENTRAL_SIZE: u64 = 3000;
pub const COAST_SIZE: u64 = 5000;

/// Deterministic package contents for a given id and version.
pub fn package_bytes(id: &str, version: DataVersion, size: u64) -> Vec<u8> {
    let seed = id.bytes().fold(version as u8, |acc, b| acc.wrapping_mul(31).wrapping_add(b));
    (0..size)
        .map(|i| seed.wrapping_add((i % 251) as u8))
        .collect()
}

/// `Countries` with one leaf and one two-leaf group.
pub fn catalog_json(version: DataVersion) -> String {
    format!(
        r#"{{ "id": "Countries", "v": {version}, "g": [
            {{ "id": "Abkhazia", "s": {ABKHAZIA_SIZE}, "affiliations": ["Georgia"] }},
            {{ "id": "Algeria", "g": [
                {{ "id": "Algeria_Central", "s": {CENTRAL_SIZE} }},
                {{ "id": "Algeria_Coast", "s": {COAST_SIZE}, "old": ["Algeria"] }}
            ] }}
        ] }}"#
    )
}

pub fn catalog(version: DataVersion) -> Catalog {
    Catalog::load(catalog_json(version).as_bytes()).unwrap()
}

/// Serves byte buffers keyed by the last URL segment, in fixed-size
/// chunks, appending to an existing partial file.
#[derive(Default)]
pub struct FakeDownloader {
    files: Mutex<HashMap<String, Vec<u8>>>,
    fail_at: Mutex<HashMap<String, u64>>,
    requests: Mutex<Vec<String>>,
    hook: Mutex<Option<Arc<dyn Fn(&str, u64) + Send + Sync>>>,
}

impl FakeDownloader {
    pub fn serve(&self, name: &str, bytes: Vec<u8>) {
        self.files.lock().unwrap().insert(name.to_string(), bytes);
    }

    pub fn withdraw(&self, name: &str) {
        self.files.lock().unwrap().remove(name);
    }

    /// Fail the next transfer of `name` once `offset` bytes are written.
    pub fn fail_once_at(&self, name: &str, offset: u64) {
        self.fail_at.lock().unwrap().insert(name.to_string(), offset);
    }

    /// Called after every chunk with the file name and bytes written.
    pub fn on_chunk(&self, hook: impl Fn(&str, u64) + Send + Sync + 'static) {
        *self.hook.lock().unwrap() = Some(Arc::new(hook));
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

impl Downloader for FakeDownloader {
    fn fetch(
        &self,
        request: &FetchRequest,
        on_progress: &mut dyn FnMut(Progress),
    ) -> StorageResult<u64> {
        let url = request.urls[0].clone();
        self.requests.lock().unwrap().push(url.clone());

        let name = url.rsplit('/').next().unwrap_or_default().to_string();
        let Some(content) = self.files.lock().unwrap().get(&name).cloned() else {
            return Err(StorageError::NotFound { url });
        };

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&request.dest)
            .map_err(|e| StorageError::disk(&request.dest, e))?;
        let mut offset = file.metadata().map(|m| m.len()).unwrap_or(0) as usize;
        if offset > content.len() {
            file.set_len(0).map_err(|e| StorageError::disk(&request.dest, e))?;
            offset = 0;
        }

        let total = content.len() as u64;
        on_progress(Progress::new(offset as u64, total));

        while offset < content.len() {
            if request.cancel.is_cancelled() {
                return Err(StorageError::Cancelled);
            }
            let limit = self.fail_at.lock().unwrap().get(&name).copied();
            if limit.is_some_and(|limit| offset as u64 >= limit) {
                self.fail_at.lock().unwrap().remove(&name);
                return Err(StorageError::Network {
                    url,
                    reason: "connection reset".to_string(),
                });
            }

            let end = (offset + CHUNK).min(content.len());
            file.write_all(&content[offset..end])
                .map_err(|e| StorageError::disk(&request.dest, e))?;
            offset = end;
            on_progress(Progress::new(offset as u64, total));

            let hook = self.hook.lock().unwrap().clone();
            if let Some(hook) = hook {
                hook(&name, offset as u64);
            }
        }

        if request.cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        Ok(total)
    }
}

/// Answers diff queries from a fixed size table.
#[derive(Default)]
pub struct FakeDiffSource {
    sizes: Mutex<HashMap<String, i64>>,
    failing: Mutex<bool>,
    queries: Mutex<Vec<DiffRequest>>,
}

impl FakeDiffSource {
    pub fn offer(&self, name: &str, size: i64) {
        self.sizes.lock().unwrap().insert(name.to_string(), size);
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }

    pub fn queries(&self) -> Vec<DiffRequest> {
        self.queries.lock().unwrap().clone()
    }
}

impl DiffSource for FakeDiffSource {
    fn query(&self, request: &DiffRequest) -> StorageResult<DiffResponse> {
        self.queries.lock().unwrap().push(request.clone());
        if *self.failing.lock().unwrap() {
            return Err(StorageError::Timeout {
                url: "http://diffs.test/".to_string(),
                timeout_secs: 5,
            });
        }
        let sizes = self.sizes.lock().unwrap();
        Ok(DiffResponse {
            mwms: request
                .mwms
                .iter()
                .map(|entry| DiffResponseEntry {
                    name: entry.name.clone(),
                    size: sizes.get(entry.name.as_str()).copied().unwrap_or(-1),
                })
                .collect(),
        })
    }
}

/// A storage wired to fakes and a manual runner, recording every event.
pub struct Harness {
    pub temp: TempDir,
    pub storage: Storage,
    pub runner: ManualRunner,
    pub downloader: Arc<FakeDownloader>,
    pub diff_source: Arc<FakeDiffSource>,
    pub statuses: Arc<Mutex<Vec<StatusEvent>>>,
    pub progress: Arc<Mutex<Vec<ProgressEvent>>>,
    pub downloaded: Arc<Mutex<Vec<(CountryId, DataVersion)>>>,
    _subscription: Subscription,
}

impl Harness {
    pub fn new(version: DataVersion) -> Self {
        Self::with(catalog(version), |config| config)
    }

    /// Build with a custom catalog, seeding the writable root first.
    pub fn with(catalog: Catalog, configure: impl FnOnce(StorageConfig) -> StorageConfig) -> Self {
        let temp = TempDir::new().unwrap();
        Self::in_dir(temp, catalog, configure)
    }

    pub fn in_dir(
        temp: TempDir,
        catalog: Catalog,
        configure: impl FnOnce(StorageConfig) -> StorageConfig,
    ) -> Self {
        let config = configure(
            StorageConfig::new(temp.path().join("maps"))
                .with_server(SERVER)
                .with_verify_integrity(true),
        );

        let runner = ManualRunner::new();
        let downloader = Arc::new(FakeDownloader::default());
        let diff_source = Arc::new(FakeDiffSource::default());
        let downloaded = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&downloaded);

        let storage = Storage::builder(config)
            .with_catalog(catalog)
            .with_downloader(downloader.clone())
            .with_diff_source(diff_source.clone())
            .with_runner(Arc::new(runner.clone()))
            .on_downloaded(move |id, file| sink.lock().unwrap().push((id.clone(), file.version())))
            .build()
            .unwrap();

        let statuses = Arc::new(Mutex::new(Vec::new()));
        let progress = Arc::new(Mutex::new(Vec::new()));
        let status_sink = Arc::clone(&statuses);
        let progress_sink = Arc::clone(&progress);
        let subscription = storage.subscribe(
            move |e| status_sink.lock().unwrap().push(e.clone()),
            move |e| progress_sink.lock().unwrap().push(e.clone()),
        );

        Self {
            temp,
            storage,
            runner,
            downloader,
            diff_source,
            statuses,
            progress,
            downloaded,
            _subscription: subscription,
        }
    }

    pub fn root(&self) -> PathBuf {
        self.storage.config().writable_root.clone()
    }

    /// Serve the current-version contents of every leaf.
    pub fn serve_catalog(&self) {
        let catalog = self.storage.catalog();
        for leaf in catalog.leaves() {
            self.downloader.serve(
                &format!("{}.mwm", leaf.id),
                package_bytes(leaf.id.as_str(), catalog.version(), leaf.byte_size),
            );
        }
    }

    pub fn run(&self) -> usize {
        self.runner.run_until_idle()
    }

    /// Status sequence reported for one node, with repeats collapsed.
    pub fn statuses_of(&self, id: &str) -> Vec<Status> {
        let mut statuses: Vec<Status> = self
            .statuses
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.country_id.as_str() == id)
            .map(|e| e.status)
            .collect();
        statuses.dedup();
        statuses
    }

    pub fn progress_of(&self, id: &str) -> Vec<Progress> {
        self.progress
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.country_id.as_str() == id)
            .map(|e| e.progress)
            .collect()
    }

    pub fn clear_events(&self) {
        self.statuses.lock().unwrap().clear();
        self.progress.lock().unwrap().clear();
    }
}

/// Write a package file into `<root>/<version>/`.
pub fn place_package(root: &Path, version: DataVersion, file_name: &str, bytes: &[u8]) -> PathBuf {
    let dir = if version == 0 {
        root.to_path_buf()
    } else {
        root.join(version.to_string())
    };
    fs::create_dir_all(&dir).unwrap();
    let path = dir.join(file_name);
    fs::write(&path, bytes).unwrap();
    path
}
