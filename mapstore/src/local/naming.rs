//! Centralized on-disk naming conventions.
//!
//! This module is the single source of truth for package file naming:
//! - Version directories (e.g., `<root>/230101/`, or `<root>` for version 0)
//! - Package files (e.g., `Algeria_Coast.mwm`, `Algeria_Coast.mwmdiff`)
//! - Transient artifacts (e.g., `Algeria_Coast.mwm.downloading`)
//!
//! All other modules should use these functions rather than constructing
//! paths directly.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::country::{CountryId, DataVersion};

/// Extension of a full package file.
pub const MAP_FILE_EXTENSION: &str = ".mwm";

/// Extension of a binary diff file.
pub const DIFF_FILE_EXTENSION: &str = ".mwmdiff";

/// Kind of package file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MapFileType {
    /// Full package.
    Map,
    /// Binary patch from an older version to the current one.
    Diff,
}

impl MapFileType {
    /// All kinds, in mask bit order.
    pub const ALL: [MapFileType; 2] = [MapFileType::Map, MapFileType::Diff];

    /// File extension for this kind.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Map => MAP_FILE_EXTENSION,
            Self::Diff => DIFF_FILE_EXTENSION,
        }
    }

    /// Bit used in a present-files mask.
    pub fn mask_bit(&self) -> u8 {
        match self {
            Self::Map => 0b01,
            Self::Diff => 0b10,
        }
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            Self::Map => 0,
            Self::Diff => 1,
        }
    }
}

/// Suffix marking an in-progress, not-yet-valid artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransientSuffix {
    /// Transfer in flight.
    Downloading,
    /// Resumable partial transfer.
    Resume,
    /// Fully fetched, awaiting rename into place.
    Ready,
    /// Patch application in progress.
    DiffApplying,
}

impl TransientSuffix {
    /// All suffixes.
    pub const ALL: [TransientSuffix; 4] = [
        TransientSuffix::Downloading,
        TransientSuffix::Resume,
        TransientSuffix::Ready,
        TransientSuffix::DiffApplying,
    ];

    /// The suffix string, including the leading dot.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Downloading => ".downloading",
            Self::Resume => ".resume",
            Self::Ready => ".ready",
            Self::DiffApplying => ".diffapplying",
        }
    }
}

/// A package file name split into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFileName {
    pub country_id: CountryId,
    pub kind: MapFileType,
    pub transient: Option<TransientSuffix>,
}

/// Directory holding files of the given version.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use mapstore::local::version_dir;
///
/// assert_eq!(version_dir(Path::new("/maps"), 230101), Path::new("/maps/230101"));
/// assert_eq!(version_dir(Path::new("/maps"), 0), Path::new("/maps"));
/// ```
pub fn version_dir(root: &Path, version: DataVersion) -> PathBuf {
    if version == 0 {
        root.to_path_buf()
    } else {
        root.join(version.to_string())
    }
}

/// File name of a package file.
///
/// # Examples
///
/// ```
/// use mapstore::country::CountryId;
/// use mapstore::local::{file_name, MapFileType};
///
/// let id = CountryId::from("Abkhazia");
/// assert_eq!(file_name(&id, MapFileType::Map), "Abkhazia.mwm");
/// assert_eq!(file_name(&id, MapFileType::Diff), "Abkhazia.mwmdiff");
/// ```
pub fn file_name(country_id: &CountryId, kind: MapFileType) -> String {
    format!("{}{}", country_id, kind.extension())
}

/// Full path of a package file.
pub fn file_path(
    root: &Path,
    version: DataVersion,
    country_id: &CountryId,
    kind: MapFileType,
) -> PathBuf {
    version_dir(root, version).join(file_name(country_id, kind))
}

/// Append a transient suffix to a final path.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use mapstore::local::{transient_path, TransientSuffix};
///
/// assert_eq!(
///     transient_path(Path::new("/maps/1/A.mwm"), TransientSuffix::Downloading),
///     Path::new("/maps/1/A.mwm.downloading")
/// );
/// ```
pub fn transient_path(final_path: &Path, suffix: TransientSuffix) -> PathBuf {
    let mut name = OsString::from(final_path.as_os_str());
    name.push(suffix.as_str());
    PathBuf::from(name)
}

/// Parse a file name into `(country, kind, transient suffix)`.
///
/// Returns `None` for files that are not package files.
pub fn parse_file_name(name: &str) -> Option<ParsedFileName> {
    let (base, transient) = TransientSuffix::ALL
        .iter()
        .find_map(|suffix| name.strip_suffix(suffix.as_str()).map(|b| (b, Some(*suffix))))
        .unwrap_or((name, None));

    let (stem, kind) = if let Some(stem) = base.strip_suffix(DIFF_FILE_EXTENSION) {
        (stem, MapFileType::Diff)
    } else if let Some(stem) = base.strip_suffix(MAP_FILE_EXTENSION) {
        (stem, MapFileType::Map)
    } else {
        return None;
    };

    if stem.is_empty() {
        return None;
    }

    Some(ParsedFileName {
        country_id: CountryId::from(stem),
        kind,
        transient,
    })
}

/// Parse a directory name as a data version.
pub fn parse_version_dir(name: &str) -> Option<DataVersion> {
    if name.is_empty() || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    name.parse().ok()
}
