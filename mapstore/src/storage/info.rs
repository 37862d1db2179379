//! Read-only summaries of catalog nodes.

use super::status::Status;
use crate::download::Progress;
use crate::error::ErrorKind;

/// Attributes of a package or group for presentation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAttrs {
    pub status: Status,
    pub error: ErrorKind,
    /// Number of leaves in the subtree.
    pub mwm_counter: usize,
    /// Catalog size of the subtree.
    pub mwm_size: u64,
    /// Leaves with a local package file.
    pub local_mwm_counter: usize,
    /// Bytes of local package files in the subtree.
    pub local_mwm_size: u64,
    /// Leaves queued, downloading, failed or on disk.
    pub downloading_mwm_counter: usize,
    pub downloading_mwm_size: u64,
    pub progress: Progress,
    /// The node itself has local files.
    pub present: bool,
}

/// What updating a subtree would cost.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateInfo {
    /// Out-of-date leaves.
    pub files_to_update: usize,
    /// Bytes to fetch, using diff sizes where a diff is known.
    pub total_download_size: u64,
    /// Largest full package among the out-of-date leaves.
    pub max_file_size: u64,
    /// Disk usage change once every leaf is updated.
    pub size_difference: i64,
}
