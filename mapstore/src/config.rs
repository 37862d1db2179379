//! Configuration for the storage core.
//!
//! Settings can be built in code or read from the `[storage]` section of an
//! INI file:
//!
//! ```ini
//! [storage]
//! root = /var/lib/mapstore
//! servers = https://cdn1.example.com/, https://cdn2.example.com/
//! diff_manifest_url = https://diffs.example.com/check
//! fetch_timeout_secs = 30
//! manifest_timeout_secs = 5
//! verify_integrity = true
//! min_supported_version = 0
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use ini::Ini;

use crate::country::DataVersion;
use crate::error::{StorageError, StorageResult};

/// INI section holding storage settings.
pub const CONFIG_SECTION: &str = "storage";

/// Default timeout for package transfers.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Default timeout for diff manifest requests.
pub const DEFAULT_MANIFEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for [`Storage`](crate::storage::Storage).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    /// Root of the versioned package directory tree.
    pub writable_root: PathBuf,

    /// Download servers, tried in order.
    pub servers: Vec<String>,

    /// Diff discovery endpoint. `None` disables diffs.
    pub diff_manifest_url: Option<String>,

    /// Timeout for package transfers.
    pub fetch_timeout: Duration,

    /// Timeout for diff manifest requests.
    pub manifest_timeout: Duration,

    /// Whether to check the catalog SHA-256 after download. The size is
    /// always checked.
    pub verify_integrity: bool,

    /// Oldest data version consumers can read.
    pub min_supported_version: DataVersion,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            writable_root: default_writable_root(),
            servers: Vec::new(),
            diff_manifest_url: None,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            manifest_timeout: DEFAULT_MANIFEST_TIMEOUT,
            verify_integrity: true,
            min_supported_version: 0,
        }
    }
}

impl StorageConfig {
    /// Create a configuration rooted at `writable_root`.
    pub fn new(writable_root: impl Into<PathBuf>) -> Self {
        Self {
            writable_root: writable_root.into(),
            ..Default::default()
        }
    }

    /// Add a download server.
    pub fn with_server(mut self, url: impl Into<String>) -> Self {
        self.servers.push(url.into());
        self
    }

    /// Set the diff discovery endpoint.
    pub fn with_diff_manifest_url(mut self, url: impl Into<String>) -> Self {
        self.diff_manifest_url = Some(url.into());
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn with_manifest_timeout(mut self, timeout: Duration) -> Self {
        self.manifest_timeout = timeout;
        self
    }

    /// Enable or disable post-download verification.
    pub fn with_verify_integrity(mut self, verify: bool) -> Self {
        self.verify_integrity = verify;
        self
    }

    pub fn with_min_supported_version(mut self, version: DataVersion) -> Self {
        self.min_supported_version = version;
        self
    }

    /// Load settings from an INI file. Missing keys keep their defaults.
    pub fn load(path: &Path) -> StorageResult<Self> {
        let ini = Ini::load_from_file(path).map_err(|e| {
            StorageError::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_ini(&ini)
    }

    /// Parse settings from INI text.
    pub fn parse(text: &str) -> StorageResult<Self> {
        let ini = Ini::load_from_str(text)
            .map_err(|e| StorageError::InvalidConfig(format!("malformed INI: {}", e)))?;
        Self::from_ini(&ini)
    }

    fn from_ini(ini: &Ini) -> StorageResult<Self> {
        let mut config = Self::default();
        let Some(section) = ini.section(Some(CONFIG_SECTION)) else {
            return Ok(config);
        };

        if let Some(root) = section.get("root").filter(|v| !v.trim().is_empty()) {
            config.writable_root = PathBuf::from(root.trim());
        }
        if let Some(servers) = section.get("servers") {
            config.servers = servers
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(url) = section.get("diff_manifest_url").map(str::trim) {
            config.diff_manifest_url = (!url.is_empty()).then(|| url.to_string());
        }
        if let Some(secs) = parse_key::<u64>(section.get("fetch_timeout_secs"), "fetch_timeout_secs")? {
            config.fetch_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) =
            parse_key::<u64>(section.get("manifest_timeout_secs"), "manifest_timeout_secs")?
        {
            config.manifest_timeout = Duration::from_secs(secs);
        }
        if let Some(verify) = parse_key::<bool>(section.get("verify_integrity"), "verify_integrity")? {
            config.verify_integrity = verify;
        }
        if let Some(version) =
            parse_key::<DataVersion>(section.get("min_supported_version"), "min_supported_version")?
        {
            config.min_supported_version = version;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check that the configuration is usable.
    pub fn validate(&self) -> StorageResult<()> {
        if self.fetch_timeout.is_zero() {
            return Err(StorageError::InvalidConfig(
                "fetch_timeout must be positive".to_string(),
            ));
        }
        if self.manifest_timeout.is_zero() {
            return Err(StorageError::InvalidConfig(
                "manifest_timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_key<T: FromStr>(value: Option<&str>, key: &str) -> StorageResult<Option<T>> {
    match value.map(str::trim) {
        None | Some("") => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| StorageError::InvalidConfig(format!("invalid value for {}: {}", key, raw))),
    }
}

/// Default package directory (`<data dir>/mapstore`).
pub fn default_writable_root() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("mapstore")
}
