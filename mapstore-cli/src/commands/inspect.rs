//! Read-only commands: scan, status, info, diffs.

use console::style;
use indicatif::HumanBytes;
use mapstore::{DiffStatus, Status, Storage};

use super::{open_storage, GlobalOptions};
use crate::error::CliError;

/// Status text padded to a fixed width, then coloured.
pub(super) fn styled_status(status: Status) -> String {
    let text = format!("{:<22}", status.to_string());
    match status {
        Status::OnDisk => style(text).green().to_string(),
        Status::OnDiskOutOfDate => style(text).yellow().to_string(),
        Status::DownloadFailed => style(text).red().to_string(),
        Status::InQueue | Status::Downloading => style(text).cyan().to_string(),
        Status::NotDownloaded | Status::Obsolete => style(text).dim().to_string(),
    }
}

pub fn scan(options: &GlobalOptions) -> Result<(), CliError> {
    let storage = open_storage(options)?;
    let countries = storage.local_files().countries();

    println!(
        "{} packages in {}",
        countries.len(),
        storage.config().writable_root.display()
    );
    for id in countries {
        if let Some(file) = storage.local_file(id.as_str()) {
            let status = storage
                .status(id.as_str())
                .map(styled_status)
                .unwrap_or_else(|_| style("not in catalog").dim().to_string());
            println!(
                "  {:<32} {:>10} {:>10} {}",
                id,
                file.version(),
                HumanBytes(file.total_size()),
                status
            );
        }
    }
    Ok(())
}

pub fn status(options: &GlobalOptions, id: Option<&str>) -> Result<(), CliError> {
    let storage = open_storage(options)?;
    let catalog = storage.catalog();
    let id = id.unwrap_or_else(|| catalog.root_id().as_str());

    print_node(&storage, id, 0)?;
    for child in catalog.children(id) {
        print_node(&storage, child.as_str(), 1)?;
    }
    Ok(())
}

fn print_node(storage: &Storage, id: &str, depth: usize) -> Result<(), CliError> {
    let attrs = storage.node_attrs(id)?;
    println!(
        "{:indent$}{:<32} {} {:>10}",
        "",
        id,
        styled_status(attrs.status),
        HumanBytes(attrs.mwm_size),
        indent = depth * 2
    );
    Ok(())
}

pub fn info(options: &GlobalOptions, id: &str) -> Result<(), CliError> {
    let storage = open_storage(options)?;
    let attrs = storage.node_attrs(id)?;
    let update = storage.update_info(id)?;

    println!("{}", style(id).bold());
    println!("  status:          {}", styled_status(attrs.status));
    println!(
        "  packages:        {} ({})",
        attrs.mwm_counter,
        HumanBytes(attrs.mwm_size)
    );
    println!(
        "  on disk:         {} ({})",
        attrs.local_mwm_counter,
        HumanBytes(attrs.local_mwm_size)
    );
    if let Some(version) = storage.version(id) {
        println!(
            "  version:         {} (catalog {})",
            version,
            storage.current_version()
        );
    }
    if update.files_to_update > 0 {
        println!(
            "  out of date:     {} ({} to download, {:+} bytes on disk)",
            update.files_to_update,
            HumanBytes(update.total_download_size),
            update.size_difference
        );
    }
    Ok(())
}

pub fn diffs(options: &GlobalOptions) -> Result<(), CliError> {
    let storage = open_storage(options)?;
    match storage.refresh_diffs() {
        DiffStatus::Available => {
            let diffs = storage.diffs().diffs();
            println!("{} diffs available", diffs.len());
            for diff in diffs {
                println!(
                    "  {:<32} {} -> {} {:>10}",
                    diff.country_id,
                    diff.source_version,
                    diff.target_version,
                    HumanBytes(diff.size)
                );
            }
        }
        DiffStatus::NotAvailable | DiffStatus::NotReady => {
            println!("No diffs available; updates will download full packages");
        }
    }
    Ok(())
}
