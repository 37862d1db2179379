//! The network boundary: a single file fetch with progress.

use std::path::PathBuf;

use reqwest::Url;
use tokio_util::sync::CancellationToken;

use super::progress::Progress;
use crate::country::{CountryId, DataVersion};
use crate::error::{StorageError, StorageResult};
use crate::local::{file_name, MapFileType};

/// One transfer to perform.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    /// Candidate URLs, tried in order until one succeeds.
    pub urls: Vec<String>,
    /// Destination file. An existing partial file may be resumed.
    pub dest: PathBuf,
    /// Expected byte size, 0 if unknown.
    pub expected_size: u64,
    /// Cooperative cancellation, checked between chunks.
    pub cancel: CancellationToken,
}

impl FetchRequest {
    pub fn new(urls: Vec<String>, dest: impl Into<PathBuf>, expected_size: u64) -> Self {
        Self {
            urls,
            dest: dest.into(),
            expected_size,
            cancel: CancellationToken::new(),
        }
    }

    /// Use an existing cancellation token.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Performs HTTP fetches for the storage core.
///
/// Implementations must report progress through `on_progress`, check
/// `request.cancel` between chunks and stop with
/// [`StorageError::Cancelled`], and return
/// [`StorageError::NotFound`] when every server answered "not found".
pub trait Downloader: Send + Sync {
    /// Fetch into `request.dest`. Returns the final file size.
    fn fetch(
        &self,
        request: &FetchRequest,
        on_progress: &mut dyn FnMut(Progress),
    ) -> StorageResult<u64>;
}

/// URL of a full package on a download server.
///
/// # Examples
///
/// ```
/// use mapstore::country::CountryId;
/// use mapstore::download::map_url;
///
/// let url = map_url("https://cdn.example.com/", 230101, &CountryId::from("South Korea_South")).unwrap();
/// assert_eq!(url, "https://cdn.example.com/maps/230101/South%20Korea_South.mwm");
/// ```
pub fn map_url(server: &str, version: DataVersion, id: &CountryId) -> StorageResult<String> {
    build_url(
        server,
        &["maps", &version.to_string(), &file_name(id, MapFileType::Map)],
    )
}

/// URL of a diff from `local_version` to `target_version`.
pub fn diff_url(
    server: &str,
    target_version: DataVersion,
    local_version: DataVersion,
    id: &CountryId,
) -> StorageResult<String> {
    build_url(
        server,
        &[
            "diffs",
            &target_version.to_string(),
            &local_version.to_string(),
            &file_name(id, MapFileType::Diff),
        ],
    )
}

fn build_url(server: &str, segments: &[&str]) -> StorageResult<String> {
    let mut url = Url::parse(server)
        .map_err(|e| StorageError::InvalidConfig(format!("bad server url {}: {}", server, e)))?;
    url.path_segments_mut()
        .map_err(|_| StorageError::InvalidConfig(format!("server url {} cannot be a base", server)))?
        .pop_if_empty()
        .extend(segments);
    Ok(url.into())
}
