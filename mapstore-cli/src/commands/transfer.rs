//! Commands that change what is on disk: download, update, delete.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use console::style;
use indicatif::{HumanBytes, ProgressBar, ProgressStyle};
use mapstore::{DiffStatus, ErrorKind, Status, Storage};
use tracing::warn;

use super::{open_storage, GlobalOptions};
use crate::error::CliError;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub fn download(options: &GlobalOptions, id: &str) -> Result<(), CliError> {
    let storage = open_storage(options)?;
    storage.download_node(id)?;
    wait_for(&storage, id)
}

pub fn update(options: &GlobalOptions, id: Option<&str>, use_diffs: bool) -> Result<(), CliError> {
    let storage = open_storage(options)?;
    let catalog = storage.catalog();
    let id = id.unwrap_or_else(|| catalog.root_id().as_str());

    if use_diffs && storage.refresh_diffs() == DiffStatus::Available {
        println!("Diffs available for {} packages", storage.diffs().diffs().len());
    }

    let info = storage.update_info(id)?;
    if info.files_to_update == 0 {
        println!("{} is up to date", id);
        return Ok(());
    }
    println!(
        "Updating {} packages, {} to download",
        info.files_to_update,
        HumanBytes(info.total_download_size)
    );

    storage.update_node(id)?;
    wait_for(&storage, id)
}

pub fn delete(options: &GlobalOptions, id: &str) -> Result<(), CliError> {
    let storage = open_storage(options)?;
    storage.delete_node(id)?;
    println!("Deleted {}", id);
    Ok(())
}

fn error_text(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::Network => "network error",
        ErrorKind::Disk => "disk error",
        ErrorKind::Integrity => "integrity check failed",
        ErrorKind::DiffApplication => "diff could not be applied",
        ErrorKind::ManifestParse => "bad manifest",
        ErrorKind::None | ErrorKind::Other => "failed",
    }
}

fn progress_bar(id: &str) -> Result<ProgressBar, CliError> {
    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} {msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})",
        )
        .map_err(|e| CliError::Config(format!("bad progress template: {}", e)))?
        .progress_chars("=> "),
    );
    bar.set_message(id.to_string());
    Ok(bar)
}

/// Block until the queue drains, showing node progress. Ctrl+C cancels
/// the downloads of `id`.
fn wait_for(storage: &Storage, id: &str) -> Result<(), CliError> {
    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupted);
    if let Err(e) = ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst)) {
        warn!(error = %e, "Ctrl+C handler not installed");
    }

    let bar = progress_bar(id)?;
    let printer = bar.clone();
    let catalog = storage.catalog();
    let _subscription = storage.subscribe(
        move |event| {
            if !catalog.is_leaf(event.country_id.as_str()) {
                return;
            }
            match event.status {
                Status::OnDisk => {
                    printer.println(format!("{} {}", style("done").green(), event.country_id))
                }
                Status::DownloadFailed => printer.println(format!(
                    "{} {}: {}",
                    style("fail").red(),
                    event.country_id,
                    error_text(event.error)
                )),
                _ => {}
            }
        },
        |_| {},
    );

    loop {
        if interrupted.swap(false, Ordering::SeqCst) {
            bar.println("Cancelling...");
            storage.cancel_download(id)?;
        }
        let progress = storage.node_progress(id)?;
        bar.set_length(progress.bytes_total);
        bar.set_position(progress.bytes_downloaded);
        if !storage.is_downloading() {
            break;
        }
        thread::sleep(POLL_INTERVAL);
    }
    bar.finish_and_clear();

    let missing: Vec<String> = storage
        .catalog()
        .leaves_in_subtree(id)
        .into_iter()
        .filter(|leaf| {
            !matches!(
                storage.status(leaf.as_str()),
                Ok(Status::OnDisk | Status::Obsolete)
            )
        })
        .map(|leaf| leaf.to_string())
        .collect();

    if missing.is_empty() {
        println!("{} {}", style("Finished").green().bold(), id);
        Ok(())
    } else {
        Err(CliError::Incomplete(missing))
    }
}
