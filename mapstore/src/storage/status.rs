//! Per-package status, derived on demand and never stored.
//!
//! ```text
//! NotDownloaded ──download──▶ InQueue ──head of queue──▶ Downloading
//! Downloading ──ok──▶ OnDisk ──catalog bump──▶ OnDiskOutOfDate
//! Downloading ──error──▶ DownloadFailed ──retry──▶ InQueue
//! Downloading ──cancel──▶ NotDownloaded
//! OnDisk ──mark obsolete──▶ Obsolete
//! ```

use std::fmt;

use crate::country::DataVersion;
use crate::download::QueueMembership;
use crate::error::ErrorKind;
use crate::local::{LocalFile, MapFileType};

/// Status of a package or group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    NotDownloaded,
    InQueue,
    /// Transferring, or placing / patching the fetched file.
    Downloading,
    OnDisk,
    /// A full package of an older data version is on disk.
    OnDiskOutOfDate,
    DownloadFailed,
    /// Terminal; excluded from download and diff offers.
    Obsolete,
}

impl Status {
    /// Rank used when folding leaf statuses into a group status. Lower
    /// ranks dominate.
    fn group_rank(self) -> u8 {
        match self {
            Self::Downloading => 0,
            Self::InQueue => 1,
            Self::DownloadFailed => 2,
            Self::OnDiskOutOfDate => 3,
            Self::OnDisk => 4,
            Self::Obsolete => 5,
            Self::NotDownloaded => 6,
        }
    }

    /// Check whether the package is scheduled or being fetched.
    pub fn is_pending(self) -> bool {
        matches!(self, Self::InQueue | Self::Downloading)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotDownloaded => "not downloaded",
            Self::InQueue => "in queue",
            Self::Downloading => "downloading",
            Self::OnDisk => "on disk",
            Self::OnDiskOutOfDate => "on disk (out of date)",
            Self::DownloadFailed => "download failed",
            Self::Obsolete => "obsolete",
        };
        f.write_str(name)
    }
}

/// Everything a leaf status depends on.
#[derive(Debug, Clone, Copy)]
pub struct LeafState<'a> {
    /// Newest local version holding a full package file.
    pub local: Option<&'a LocalFile>,
    pub current_version: DataVersion,
    pub membership: QueueMembership,
    /// The fetched file is being placed or patched.
    pub finalizing: bool,
    pub failed: bool,
    pub obsolete: bool,
}

/// Derive a leaf status.
pub fn derive_status(state: &LeafState<'_>) -> Status {
    if state.obsolete {
        return Status::Obsolete;
    }
    match state.membership {
        QueueMembership::Active => return Status::Downloading,
        QueueMembership::Queued => return Status::InQueue,
        QueueMembership::None => {}
    }
    if state.finalizing {
        return Status::Downloading;
    }
    if state.failed {
        return Status::DownloadFailed;
    }
    match state.local.filter(|f| f.on_disk(MapFileType::Map)) {
        None => Status::NotDownloaded,
        Some(file) if file.version() < state.current_version => Status::OnDiskOutOfDate,
        Some(_) => Status::OnDisk,
    }
}

/// Fold the statuses of a group's leaves into the group status.
///
/// `OnDisk` only if every leaf is; otherwise the most active leaf status
/// wins, and a mix of present and absent leaves reads as `NotDownloaded`.
pub fn aggregate_status(leaves: impl IntoIterator<Item = Status>) -> Status {
    let mut all_on_disk = true;
    let mut all_obsolete = true;
    let mut any = false;
    let mut result = Status::NotDownloaded;

    for status in leaves {
        any = true;
        all_on_disk &= status == Status::OnDisk;
        all_obsolete &= status == Status::Obsolete;
        if status.group_rank() < result.group_rank() {
            result = status;
        }
    }

    if !any {
        return Status::NotDownloaded;
    }
    if all_on_disk {
        return Status::OnDisk;
    }
    if all_obsolete {
        return Status::Obsolete;
    }
    match result {
        Status::OnDisk | Status::Obsolete => Status::NotDownloaded,
        other => other,
    }
}

/// Error kind reported next to a status.
pub(crate) fn error_for(status: Status, failure: Option<ErrorKind>) -> ErrorKind {
    match (status, failure) {
        (Status::DownloadFailed, Some(kind)) => kind,
        (Status::DownloadFailed, None) => ErrorKind::Other,
        _ => ErrorKind::None,
    }
}
