//! Per-package diff availability.
//!
//! The catalog is filled by one batched [`DiffSource`] query. A malformed
//! answer is never trusted partially: the whole batch is dropped and the
//! scheme becomes [`DiffStatus::NotAvailable`].

use std::collections::{BTreeMap, HashMap, HashSet};

use parking_lot::Mutex;
use tracing::{info, warn};

use super::protocol::{
    DiffRequest, DiffRequestEntry, DiffResponseEntry, DiffSource, DIFF_MANIFEST_SOURCE,
};
use crate::country::{CountryId, DataVersion};
use crate::error::{StorageError, StorageResult};

/// Global state of the diff scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiffStatus {
    /// No refresh has completed yet.
    NotReady,
    /// At least one unapplied diff is known.
    Available,
    /// Diffs cannot be used; callers download full files.
    NotAvailable,
}

/// A known diff for one package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffInfo {
    pub country_id: CountryId,
    /// Diff size in bytes.
    pub size: u64,
    /// Local version the diff applies to.
    pub source_version: DataVersion,
    /// Version produced by applying the diff.
    pub target_version: DataVersion,
    pub applied: bool,
}

#[derive(Debug)]
struct State {
    status: DiffStatus,
    diffs: HashMap<CountryId, DiffInfo>,
}

impl State {
    fn update_status(&mut self) {
        if self.diffs.values().all(|d| d.applied) {
            self.status = DiffStatus::NotAvailable;
        }
    }
}

/// Tracks which local packages can be upgraded through a diff.
#[derive(Debug)]
pub struct DiffCatalog {
    state: Mutex<State>,
}

impl Default for DiffCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl DiffCatalog {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                status: DiffStatus::NotReady,
                diffs: HashMap::new(),
            }),
        }
    }

    /// Query `source` for diffs from the given local versions to
    /// `current_version` and replace the tracked diffs with the answer.
    ///
    /// Only versions in `1..current_version` are sent; when none qualify
    /// the scheme is aborted without a query. On a network failure the
    /// previous diffs are kept (or the scheme becomes unavailable if there
    /// were none). On a malformed answer every diff is dropped.
    pub fn refresh(
        &self,
        source: &dyn DiffSource,
        local_versions: &BTreeMap<CountryId, DataVersion>,
        current_version: DataVersion,
    ) -> StorageResult<DiffStatus> {
        let request = DiffRequest {
            mwms: local_versions
                .iter()
                .filter(|(_, v)| **v > 0 && **v < current_version)
                .map(|(id, v)| DiffRequestEntry {
                    name: id.clone(),
                    version: *v,
                })
                .collect(),
            max_version: current_version,
        };

        if request.mwms.is_empty() {
            info!("No outdated local maps, diff scheme not needed");
            self.abort();
            return Ok(DiffStatus::NotAvailable);
        }

        let response = match source.query(&request) {
            Ok(response) => response,
            Err(e @ StorageError::ManifestParse { .. }) => {
                warn!(error = %e, "Malformed diff manifest, dropping all diffs");
                self.abort();
                return Err(e);
            }
            Err(e) => {
                warn!(error = %e, "Diff manifest request failed");
                let mut state = self.state.lock();
                if state.diffs.is_empty() {
                    state.status = DiffStatus::NotAvailable;
                }
                return Err(e);
            }
        };

        let diffs = match validate_response(&request, response.mwms) {
            Ok(diffs) => diffs,
            Err(e) => {
                warn!(error = %e, "Rejected diff manifest, dropping all diffs");
                self.abort();
                return Err(e);
            }
        };

        let mut state = self.state.lock();
        state.status = if diffs.is_empty() {
            DiffStatus::NotAvailable
        } else {
            DiffStatus::Available
        };
        info!(diffs = diffs.len(), status = ?state.status, "Diff manifest loaded");
        state.diffs = diffs;
        Ok(state.status)
    }

    /// Unapplied diff for a package.
    pub fn get(&self, id: &str) -> Option<DiffInfo> {
        let state = self.state.lock();
        if state.status != DiffStatus::Available {
            return None;
        }
        state.diffs.get(id).filter(|d| !d.applied).cloned()
    }

    pub fn has_diff_for(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// Bytes to download for a package's diff.
    pub fn size_to_download(&self, id: &str) -> Option<u64> {
        self.get(id).map(|d| d.size)
    }

    /// Mark a diff as applied. Once every diff is applied or removed the
    /// scheme becomes unavailable.
    pub fn mark_applied(&self, id: &str) {
        let mut state = self.state.lock();
        if let Some(diff) = state.diffs.get_mut(id) {
            diff.applied = true;
            state.update_status();
        }
    }

    /// Forget one package's diff, e.g. after a failed application.
    pub fn remove(&self, id: &str) {
        let mut state = self.state.lock();
        if state.diffs.remove(id).is_some() {
            state.update_status();
        }
    }

    /// Drop every diff. Used when the catalog version changes or a diff
    /// is missing on the server.
    pub fn abort(&self) {
        let mut state = self.state.lock();
        state.diffs.clear();
        state.status = DiffStatus::NotAvailable;
    }

    pub fn status(&self) -> DiffStatus {
        self.state.lock().status
    }

    /// All tracked diffs, sorted by country.
    pub fn diffs(&self) -> Vec<DiffInfo> {
        let mut diffs: Vec<DiffInfo> = self.state.lock().diffs.values().cloned().collect();
        diffs.sort_by(|a, b| a.country_id.cmp(&b.country_id));
        diffs
    }
}

fn validate_response(
    request: &DiffRequest,
    entries: Vec<DiffResponseEntry>,
) -> StorageResult<HashMap<CountryId, DiffInfo>> {
    if entries.len() != request.mwms.len() {
        return Err(StorageError::ManifestParse {
            source_name: DIFF_MANIFEST_SOURCE.to_string(),
            reason: format!(
                "expected {} entries, got {}",
                request.mwms.len(),
                entries.len()
            ),
        });
    }

    let requested: HashMap<&CountryId, DataVersion> =
        request.mwms.iter().map(|e| (&e.name, e.version)).collect();
    let mut seen = HashSet::new();
    let mut diffs = HashMap::new();

    for entry in entries {
        let Some(&source_version) = requested.get(&entry.name) else {
            return Err(StorageError::ManifestParse {
                source_name: DIFF_MANIFEST_SOURCE.to_string(),
                reason: format!("unexpected package {}", entry.name),
            });
        };
        if !seen.insert(entry.name.clone()) {
            return Err(StorageError::ManifestParse {
                source_name: DIFF_MANIFEST_SOURCE.to_string(),
                reason: format!("duplicate package {}", entry.name),
            });
        }
        let Ok(size) = u64::try_from(entry.size) else {
            continue;
        };
        diffs.insert(
            entry.name.clone(),
            DiffInfo {
                country_id: entry.name,
                size,
                source_version,
                target_version: request.max_version,
                applied: false,
            },
        );
    }

    Ok(diffs)
}
