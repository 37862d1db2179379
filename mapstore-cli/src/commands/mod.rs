//! CLI commands.
//!
//! Every command opens the storage the same way: config file (explicit,
//! then the per-user default), command-line overrides, the catalog
//! manifest, then a scan of the package directory.

mod inspect;
mod transfer;

pub use inspect::{diffs, info, scan, status};
pub use transfer::{delete, download, update};

use std::path::{Path, PathBuf};

use mapstore::config::default_writable_root;
use mapstore::{Catalog, Storage, StorageConfig};
use tracing::debug;

use crate::error::CliError;

/// Catalog file name looked up in the package directory.
pub const CATALOG_FILE: &str = "countries.txt";

/// Options shared by every subcommand.
#[derive(Debug, Clone, Default)]
pub struct GlobalOptions {
    pub config: Option<PathBuf>,
    pub root: Option<PathBuf>,
    pub catalog: Option<PathBuf>,
    pub servers: Vec<String>,
}

/// Per-user config file location.
fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("mapstore").join("config.ini"))
}

fn load_config(options: &GlobalOptions) -> Result<StorageConfig, CliError> {
    let mut config = match &options.config {
        Some(path) => StorageConfig::load(path)?,
        None => match default_config_path().filter(|p| p.is_file()) {
            Some(path) => {
                debug!(path = %path.display(), "Using default config file");
                StorageConfig::load(&path)?
            }
            None => StorageConfig::new(default_writable_root()),
        },
    };

    if let Some(root) = &options.root {
        config.writable_root = root.clone();
    }
    if !options.servers.is_empty() {
        config.servers = options.servers.clone();
    }
    Ok(config)
}

fn load_catalog(options: &GlobalOptions, root: &Path) -> Result<Catalog, CliError> {
    let path = options
        .catalog
        .clone()
        .unwrap_or_else(|| root.join(CATALOG_FILE));
    if !path.is_file() {
        return Err(CliError::Config(format!(
            "catalog manifest not found at {}. Use --catalog to point at one.",
            path.display()
        )));
    }
    Ok(Catalog::load_file(&path)?)
}

/// Build the storage and register the packages already on disk.
pub fn open_storage(options: &GlobalOptions) -> Result<Storage, CliError> {
    let config = load_config(options)?;
    let catalog = load_catalog(options, &config.writable_root)?;
    let storage = Storage::builder(config).with_catalog(catalog).build()?;
    storage.register_all_local_maps()?;
    Ok(storage)
}
