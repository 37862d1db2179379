//! End-to-end behaviour of the storage orchestrator against fake network
//! collaborators and a manual runner.

mod support;

use std::fs;
use std::sync::Arc;

use mapstore::diff::Patch;
use mapstore::download::calculate_file_checksum;
use mapstore::{
    Catalog, CountryId, DiffStatus, ErrorKind, MapFileType, Progress, Status, StorageError,
};
use tempfile::TempDir;

use support::*;

const V1: u64 = 230101;
const V2: u64 = 230215;

fn assert_monotonic(progress: &[Progress]) {
    for pair in progress.windows(2) {
        assert!(
            pair[1].bytes_downloaded >= pair[0].bytes_downloaded,
            "progress went backwards: {:?}",
            progress
        );
    }
}

/// A harness whose root already holds version `V1` of the given leaves,
/// registered against a `V2` catalog.
fn out_of_date(leaves: &[(&str, u64)]) -> Harness {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("maps");
    for (id, size) in leaves {
        place_package(&root, V1, &format!("{}.mwm", id), &package_bytes(id, V1, *size));
    }
    let h = Harness::in_dir(temp, catalog(V2), |config| config);
    assert_eq!(h.storage.register_all_local_maps().unwrap(), leaves.len());
    h
}

#[test]
fn test_download_single_leaf() {
    let h = Harness::new(V1);
    h.serve_catalog();

    h.storage.download_node("Abkhazia").unwrap();
    assert_eq!(h.storage.status("Abkhazia").unwrap(), Status::Downloading);

    h.run();

    assert_eq!(h.storage.status("Abkhazia").unwrap(), Status::OnDisk);
    let path = h.root().join(V1.to_string()).join("Abkhazia.mwm");
    assert_eq!(fs::read(&path).unwrap(), package_bytes("Abkhazia", V1, ABKHAZIA_SIZE));

    let leftovers: Vec<_> = fs::read_dir(h.root().join(V1.to_string()))
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    assert_eq!(leftovers, vec!["Abkhazia.mwm".to_string()]);

    assert_eq!(
        h.statuses_of("Abkhazia"),
        vec![Status::InQueue, Status::Downloading, Status::OnDisk]
    );

    let progress = h.progress_of("Abkhazia");
    assert_monotonic(&progress);
    assert_eq!(progress.last(), Some(&Progress::complete(ABKHAZIA_SIZE)));

    assert_eq!(h.storage.mwm_registry().registered_version("Abkhazia"), Some(V1));
    assert_eq!(
        h.downloaded.lock().unwrap().as_slice(),
        &[(CountryId::from("Abkhazia"), V1)]
    );
    assert!(!h.storage.is_downloading());
}

#[test]
fn test_group_download_aggregates() {
    let h = Harness::new(V1);
    h.serve_catalog();

    h.storage.download_node("Algeria").unwrap();
    assert_eq!(h.storage.status("Algeria").unwrap(), Status::Downloading);
    assert_eq!(
        h.storage.queued_children("Algeria").unwrap(),
        vec![CountryId::from("Algeria_Central"), CountryId::from("Algeria_Coast")]
    );
    assert_eq!(
        h.storage.queue(),
        vec![CountryId::from("Algeria_Central"), CountryId::from("Algeria_Coast")]
    );

    h.run();

    assert_eq!(h.storage.status("Algeria_Central").unwrap(), Status::OnDisk);
    assert_eq!(h.storage.status("Algeria_Coast").unwrap(), Status::OnDisk);
    assert_eq!(h.storage.status("Algeria").unwrap(), Status::OnDisk);
    assert_eq!(h.storage.status("Countries").unwrap(), Status::NotDownloaded);

    let group = h.statuses_of("Algeria");
    assert_eq!(group.first(), Some(&Status::InQueue));
    assert_eq!(group.last(), Some(&Status::OnDisk));
    assert!(group.contains(&Status::Downloading));

    let progress = h.progress_of("Algeria");
    assert_monotonic(&progress);
    assert_eq!(progress.last(), Some(&Progress::complete(CENTRAL_SIZE + COAST_SIZE)));

    let attrs = h.storage.node_attrs("Algeria").unwrap();
    assert_eq!(attrs.mwm_counter, 2);
    assert_eq!(attrs.local_mwm_counter, 2);
    assert_eq!(attrs.local_mwm_size, CENTRAL_SIZE + COAST_SIZE);
    assert!(h.storage.queued_children("Algeria").unwrap().is_empty());
}

#[test]
fn test_download_is_idempotent() {
    let h = Harness::new(V1);
    h.serve_catalog();

    h.storage.download_node("Algeria").unwrap();
    let pending = h.runner.pending();
    h.storage.download_node("Algeria").unwrap();
    h.storage.download_node("Algeria_Coast").unwrap();

    assert_eq!(h.runner.pending(), pending);
    assert_eq!(h.storage.queue().len(), 2);

    h.run();
    let requests = h.downloader.requests();
    assert_eq!(requests.len(), 2);

    h.storage.download_node("Algeria").unwrap();
    assert!(h.storage.queue().is_empty());
}

#[test]
fn test_cancel_active_transfer_starts_next() {
    let h = Harness::new(V1);
    h.serve_catalog();

    let storage = h.storage.clone();
    h.downloader.on_chunk(move |name, written| {
        if name == "Algeria_Central.mwm" && written == CHUNK as u64 {
            storage.cancel_download("Algeria_Central").unwrap();
        }
    });

    h.storage.download_node("Algeria").unwrap();
    h.run();

    assert_eq!(h.storage.status("Algeria_Central").unwrap(), Status::NotDownloaded);
    assert_eq!(h.storage.status("Algeria_Coast").unwrap(), Status::OnDisk);
    assert_eq!(
        h.statuses_of("Algeria_Central"),
        vec![Status::InQueue, Status::Downloading, Status::NotDownloaded]
    );

    let names: Vec<_> = fs::read_dir(h.root().join(V1.to_string()))
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    assert_eq!(names, vec!["Algeria_Coast.mwm".to_string()]);
}

#[test]
fn test_cancel_while_finalizing_discards_package() {
    let h = Harness::new(V1);
    h.serve_catalog();

    h.storage.download_node("Abkhazia").unwrap();
    // Network job plus the first status delivery; placement is still queued.
    h.runner.run_pending();
    assert_eq!(h.storage.status("Abkhazia").unwrap(), Status::Downloading);

    h.storage.cancel_download("Abkhazia").unwrap();
    h.run();

    assert_eq!(h.storage.status("Abkhazia").unwrap(), Status::NotDownloaded);
    assert!(!h.root().join(V1.to_string()).join("Abkhazia.mwm").exists());
    assert!(!h.root().join(V1.to_string()).join("Abkhazia.mwm.ready").exists());
    assert!(h.downloaded.lock().unwrap().is_empty());
}

#[test]
fn test_diff_update() {
    let h = out_of_date(&[("Abkhazia", ABKHAZIA_SIZE)]);
    assert_eq!(h.storage.status("Abkhazia").unwrap(), Status::OnDiskOutOfDate);

    let old = package_bytes("Abkhazia", V1, ABKHAZIA_SIZE);
    let new = package_bytes("Abkhazia", V2, ABKHAZIA_SIZE);
    let patch = Patch::compute(&old, &new).to_bytes().unwrap();
    h.downloader.serve("Abkhazia.mwmdiff", patch.clone());
    h.diff_source.offer("Abkhazia", patch.len() as i64);

    assert_eq!(h.storage.refresh_diffs(), DiffStatus::Available);
    let queries = h.diff_source.queries();
    let query = &queries[0];
    assert_eq!(query.max_version, V2);
    assert_eq!(query.mwms.len(), 1);
    assert_eq!(query.mwms[0].version, V1);

    let info = h.storage.update_info("Countries").unwrap();
    assert_eq!(info.files_to_update, 1);
    assert_eq!(info.total_download_size, patch.len() as u64);
    assert_eq!(info.max_file_size, ABKHAZIA_SIZE);
    assert_eq!(info.size_difference, 0);

    h.storage.update_node("Countries").unwrap();
    h.run();

    assert_eq!(h.storage.status("Abkhazia").unwrap(), Status::OnDisk);
    assert_eq!(
        fs::read(h.root().join(V2.to_string()).join("Abkhazia.mwm")).unwrap(),
        new
    );
    assert!(!h.root().join(V1.to_string()).exists());
    assert!(!h.root().join(V2.to_string()).join("Abkhazia.mwmdiff").exists());
    assert_eq!(
        h.downloader.requests(),
        vec![format!("{}diffs/{}/{}/Abkhazia.mwmdiff", SERVER, V2, V1)]
    );
    assert_eq!(h.storage.mwm_registry().registered_version("Abkhazia"), Some(V2));
    assert!(!h.storage.diffs().has_diff_for("Abkhazia"));
}

#[test]
fn test_corrupt_diff_falls_back_to_full_download() {
    let h = out_of_date(&[("Abkhazia", ABKHAZIA_SIZE)]);
    h.serve_catalog();
    h.downloader.serve("Abkhazia.mwmdiff", vec![0xAB; 64]);
    h.diff_source.offer("Abkhazia", 64);
    assert_eq!(h.storage.refresh_diffs(), DiffStatus::Available);

    h.storage.update_node("Abkhazia").unwrap();
    h.run();

    assert_eq!(h.storage.status("Abkhazia").unwrap(), Status::OnDisk);
    assert_eq!(
        fs::read(h.root().join(V2.to_string()).join("Abkhazia.mwm")).unwrap(),
        package_bytes("Abkhazia", V2, ABKHAZIA_SIZE)
    );
    let requests = h.downloader.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[0].ends_with("Abkhazia.mwmdiff"));
    assert!(requests[1].ends_with(&format!("maps/{}/Abkhazia.mwm", V2)));
    assert!(!h.statuses_of("Abkhazia").contains(&Status::DownloadFailed));
}

#[test]
fn test_missing_diff_aborts_scheme_for_queued_diffs() {
    let h = out_of_date(&[
        ("Abkhazia", ABKHAZIA_SIZE),
        ("Algeria_Central", CENTRAL_SIZE),
    ]);
    h.serve_catalog();
    h.diff_source.offer("Abkhazia", 100);
    h.diff_source.offer("Algeria_Central", 100);
    assert_eq!(h.storage.refresh_diffs(), DiffStatus::Available);

    h.storage.update_node("Countries").unwrap();
    h.run();

    assert_eq!(h.storage.status("Abkhazia").unwrap(), Status::OnDisk);
    assert_eq!(h.storage.status("Algeria_Central").unwrap(), Status::OnDisk);
    assert_eq!(h.storage.diffs().status(), DiffStatus::NotAvailable);

    let diff_requests = h
        .downloader
        .requests()
        .into_iter()
        .filter(|url| url.ends_with(".mwmdiff"))
        .count();
    assert_eq!(diff_requests, 1);
}

#[test]
fn test_failed_diff_manifest_means_full_downloads() {
    let h = out_of_date(&[("Abkhazia", ABKHAZIA_SIZE)]);
    h.serve_catalog();
    h.diff_source.set_failing(true);

    assert_eq!(h.storage.refresh_diffs(), DiffStatus::NotAvailable);

    let info = h.storage.update_info("Abkhazia").unwrap();
    assert_eq!(info.total_download_size, ABKHAZIA_SIZE);

    h.storage.update_node("Abkhazia").unwrap();
    h.run();
    assert_eq!(h.storage.status("Abkhazia").unwrap(), Status::OnDisk);
    assert!(h.downloader.requests()[0].ends_with(".mwm"));
}

#[test]
fn test_network_failure_resumes_on_retry() {
    let h = Harness::new(V1);
    h.serve_catalog();
    h.downloader.fail_once_at("Abkhazia.mwm", 2 * CHUNK as u64);

    h.storage.download_node("Abkhazia").unwrap();
    h.run();

    assert_eq!(
        h.storage.status_and_error("Abkhazia").unwrap(),
        (Status::DownloadFailed, ErrorKind::Network)
    );
    let resume = h.root().join(V1.to_string()).join("Abkhazia.mwm.resume");
    assert_eq!(fs::metadata(&resume).unwrap().len(), 2 * CHUNK as u64);

    h.clear_events();
    h.storage.retry_download_node("Countries").unwrap();
    h.run();

    assert_eq!(h.storage.status("Abkhazia").unwrap(), Status::OnDisk);
    assert!(!resume.exists());
    assert_eq!(
        fs::read(h.root().join(V1.to_string()).join("Abkhazia.mwm")).unwrap(),
        package_bytes("Abkhazia", V1, ABKHAZIA_SIZE)
    );
    let progress = h.progress_of("Abkhazia");
    assert_eq!(progress[0].bytes_downloaded, 2 * CHUNK as u64);
    assert_eq!(
        h.statuses_of("Abkhazia"),
        vec![Status::InQueue, Status::Downloading, Status::OnDisk]
    );
}

#[test]
fn test_delete_removes_partial_download() {
    let h = Harness::new(V1);
    h.serve_catalog();
    h.downloader.fail_once_at("Abkhazia.mwm", CHUNK as u64);
    h.storage.download_node("Abkhazia").unwrap();
    h.run();

    let resume = h.root().join(V1.to_string()).join("Abkhazia.mwm.resume");
    assert!(resume.exists());

    h.storage.delete_node("Abkhazia").unwrap();
    assert!(!resume.exists());
    assert_eq!(h.storage.status("Abkhazia").unwrap(), Status::NotDownloaded);
}

#[test]
fn test_wrong_size_is_integrity_failure() {
    let h = Harness::new(V1);
    h.downloader
        .serve("Abkhazia.mwm", package_bytes("Abkhazia", V1, ABKHAZIA_SIZE - 96));

    h.storage.download_node("Abkhazia").unwrap();
    h.run();

    assert_eq!(
        h.storage.status_and_error("Abkhazia").unwrap(),
        (Status::DownloadFailed, ErrorKind::Integrity)
    );
    let dir = h.root().join(V1.to_string());
    assert!(!dir.join("Abkhazia.mwm").exists());
    assert!(!dir.join("Abkhazia.mwm.ready").exists());
}

fn catalog_with_hash(temp: &TempDir) -> Catalog {
    let expected = package_bytes("Abkhazia", V1, ABKHAZIA_SIZE);
    let probe = temp.path().join("probe");
    fs::write(&probe, &expected).unwrap();
    let sha256 = calculate_file_checksum(&probe).unwrap();
    fs::remove_file(&probe).unwrap();

    let json = format!(
        r#"{{ "id": "Countries", "v": {V1}, "g": [
            {{ "id": "Abkhazia", "s": {ABKHAZIA_SIZE}, "sha256": "{sha256}" }} ] }}"#
    );
    Catalog::load(json.as_bytes()).unwrap()
}

#[test]
fn test_checksum_mismatch_is_integrity_failure() {
    let temp = TempDir::new().unwrap();
    let catalog = catalog_with_hash(&temp);
    let h = Harness::in_dir(temp, catalog, |config| config);

    let mut tampered = package_bytes("Abkhazia", V1, ABKHAZIA_SIZE);
    tampered[10] ^= 0xFF;
    h.downloader.serve("Abkhazia.mwm", tampered);

    h.storage.download_node("Abkhazia").unwrap();
    h.run();
    assert_eq!(
        h.storage.status_and_error("Abkhazia").unwrap(),
        (Status::DownloadFailed, ErrorKind::Integrity)
    );

    h.downloader
        .serve("Abkhazia.mwm", package_bytes("Abkhazia", V1, ABKHAZIA_SIZE));
    h.storage.retry_download_node("Abkhazia").unwrap();
    h.run();
    assert_eq!(h.storage.status("Abkhazia").unwrap(), Status::OnDisk);
}

#[test]
fn test_checksum_skipped_when_verification_disabled() {
    let temp = TempDir::new().unwrap();
    let catalog = catalog_with_hash(&temp);
    let h = Harness::in_dir(temp, catalog, |config| config.with_verify_integrity(false));

    let mut tampered = package_bytes("Abkhazia", V1, ABKHAZIA_SIZE);
    tampered[10] ^= 0xFF;
    h.downloader.serve("Abkhazia.mwm", tampered);

    h.storage.download_node("Abkhazia").unwrap();
    h.run();
    assert_eq!(h.storage.status("Abkhazia").unwrap(), Status::OnDisk);
}

#[test]
fn test_locked_package_survives_delete() {
    let h = Harness::new(V1);
    h.serve_catalog();
    h.storage.download_node("Abkhazia").unwrap();
    h.run();

    let handle = h.storage.get_handle("Abkhazia").unwrap();
    assert_eq!(handle.version(), V1);

    match h.storage.delete_node("Countries") {
        Err(StorageError::FileLocked { country, lock_count }) => {
            assert_eq!(country.as_str(), "Abkhazia");
            assert_eq!(lock_count, 1);
        }
        other => panic!("expected FileLocked, got {:?}", other),
    }
    assert!(handle.file().path(MapFileType::Map).exists());
    assert_eq!(h.storage.status("Abkhazia").unwrap(), Status::OnDisk);

    drop(handle);
    h.storage.delete_node("Abkhazia").unwrap();
    assert_eq!(h.storage.status("Abkhazia").unwrap(), Status::NotDownloaded);
    assert!(!h.root().join(V1.to_string()).exists());
    assert!(!h.storage.mwm_registry().is_registered("Abkhazia"));
}

#[test]
fn test_delete_all_keeps_locked_packages() {
    let h = Harness::new(V1);
    h.serve_catalog();
    h.storage.download_node("Countries").unwrap();
    h.run();

    let _handle = h.storage.get_handle("Abkhazia").unwrap();
    let kept = h.storage.delete_all_local_maps().unwrap();

    assert_eq!(kept, vec![CountryId::from("Abkhazia")]);
    assert_eq!(h.storage.status("Abkhazia").unwrap(), Status::OnDisk);
    assert_eq!(h.storage.status("Algeria").unwrap(), Status::NotDownloaded);
}

#[test]
fn test_register_all_local_maps_keeps_newest() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("maps");
    place_package(&root, V1, "Abkhazia.mwm", &package_bytes("Abkhazia", V1, ABKHAZIA_SIZE));
    place_package(&root, V2, "Abkhazia.mwm", &package_bytes("Abkhazia", V2, ABKHAZIA_SIZE));
    place_package(&root, V2, "Algeria_Coast.mwmdiff", b"stale diff");
    place_package(&root, V2, "Algeria_Central.mwm.downloading", b"partial");
    place_package(&root, V2, "Algeria_Central.mwm.resume", b"partial");

    let h = Harness::in_dir(temp, catalog(V2), |config| config);
    assert_eq!(h.storage.register_all_local_maps().unwrap(), 1);

    assert_eq!(h.storage.status("Abkhazia").unwrap(), Status::OnDisk);
    assert_eq!(h.storage.status("Algeria_Coast").unwrap(), Status::NotDownloaded);
    assert_eq!(h.storage.version("Abkhazia"), Some(V2));
    assert!(!root.join(V1.to_string()).exists());
    assert!(!root.join(V2.to_string()).join("Algeria_Coast.mwmdiff").exists());
    assert!(!root
        .join(V2.to_string())
        .join("Algeria_Central.mwm.downloading")
        .exists());
    assert!(root
        .join(V2.to_string())
        .join("Algeria_Central.mwm.resume")
        .exists());

    h.run();
    assert_eq!(h.statuses_of("Abkhazia"), vec![Status::OnDisk]);
}

#[test]
fn test_apply_catalog_marks_out_of_date() {
    let h = Harness::new(V1);
    h.serve_catalog();
    h.storage.download_node("Abkhazia").unwrap();

    assert!(matches!(
        h.storage.apply_catalog(catalog(V2)),
        Err(StorageError::DownloadInProgress)
    ));
    h.run();

    h.storage.apply_catalog(catalog(V2)).unwrap();
    h.run();
    assert_eq!(h.storage.current_version(), V2);
    assert_eq!(h.storage.status("Abkhazia").unwrap(), Status::OnDiskOutOfDate);
    assert_eq!(h.statuses_of("Abkhazia").last(), Some(&Status::OnDiskOutOfDate));

    assert!(matches!(
        h.storage.apply_catalog(catalog(V1)),
        Err(StorageError::InvalidConfig(_))
    ));
}

#[test]
fn test_obsolete_leaf_is_not_downloaded() {
    let h = Harness::new(V1);
    h.serve_catalog();

    h.storage.mark_obsolete("Abkhazia").unwrap();
    h.storage.download_node("Countries").unwrap();
    h.run();

    assert_eq!(h.storage.status("Abkhazia").unwrap(), Status::Obsolete);
    assert_eq!(h.storage.status("Algeria").unwrap(), Status::OnDisk);
    assert!(!h
        .downloader
        .requests()
        .iter()
        .any(|url| url.ends_with("Abkhazia.mwm")));
}

#[test]
fn test_unknown_country() {
    let h = Harness::new(V1);
    assert!(matches!(
        h.storage.download_node("Atlantis"),
        Err(StorageError::UnknownCountry(_))
    ));
    assert!(matches!(
        h.storage.status("Atlantis"),
        Err(StorageError::UnknownCountry(_))
    ));
}

#[test]
fn test_missing_package_on_server_fails() {
    let h = Harness::new(V1);
    h.storage.download_node("Abkhazia").unwrap();
    h.run();

    assert_eq!(
        h.storage.status_and_error("Abkhazia").unwrap(),
        (Status::DownloadFailed, ErrorKind::Network)
    );
    assert_eq!(h.storage.status("Countries").unwrap(), Status::DownloadFailed);
}

#[test]
fn test_unsubscribe_stops_delivery() {
    let h = Harness::new(V1);
    h.serve_catalog();
    let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let subscription = h.storage.subscribe(
        move |_| {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        },
        |_| {},
    );
    h.storage.unsubscribe(subscription);

    h.storage.download_node("Abkhazia").unwrap();
    h.run();
    assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    assert!(!h.statuses_of("Abkhazia").is_empty());
}

#[test]
fn test_scenario_a_node_size_matches_catalog() {
    const SIZE: u64 = 4689718;
    let catalog = Catalog::load(
        format!(r#"{{ "id": "Countries", "v": {V1}, "g": [ {{ "id": "Abkhazia", "s": {SIZE} }} ] }}"#)
            .as_bytes(),
    )
    .unwrap();
    let h = Harness::with(catalog, |config| config);
    h.serve_catalog();
    assert_eq!(h.storage.node_size("Abkhazia").unwrap(), SIZE);
    assert_eq!(h.storage.node_size("Countries").unwrap(), SIZE);

    h.storage.download_node("Abkhazia").unwrap();
    h.run();

    assert_eq!(
        h.statuses_of("Abkhazia"),
        vec![Status::InQueue, Status::Downloading, Status::OnDisk]
    );
    assert_eq!(h.storage.node_size("Abkhazia").unwrap(), SIZE);
    let file = h.storage.local_file("Abkhazia").unwrap();
    assert_eq!(file.size(MapFileType::Map), SIZE);
    assert!(matches!(
        h.storage.node_size("Atlantis"),
        Err(StorageError::UnknownCountry(_))
    ));
}

#[test]
fn test_sync_after_external_delete_reads_not_downloaded() {
    let h = Harness::new(V1);
    h.serve_catalog();
    h.storage.download_node("Algeria").unwrap();
    h.run();
    assert_eq!(h.storage.status("Algeria").unwrap(), Status::OnDisk);

    let file = h.storage.local_file("Algeria_Coast").unwrap();
    let file = h.storage.local_files().sync_with_disk(&file);
    assert!(file.on_disk(MapFileType::Map));

    fs::remove_file(file.path(MapFileType::Map)).unwrap();
    let file = h.storage.local_files().sync_with_disk(&file);

    assert_eq!(file.present_files_mask(), 0);
    assert_eq!(h.storage.status("Algeria_Coast").unwrap(), Status::NotDownloaded);
    assert_eq!(h.storage.status("Algeria_Central").unwrap(), Status::OnDisk);
    assert_eq!(h.storage.status("Algeria").unwrap(), Status::NotDownloaded);
}

#[test]
fn test_catalog_bump_deletes_old_version_partial() {
    let h = Harness::new(V1);
    h.serve_catalog();
    h.downloader.fail_once_at("Abkhazia.mwm", CHUNK as u64);
    h.storage.download_node("Abkhazia").unwrap();
    h.run();

    let old_dir = h.root().join(V1.to_string());
    assert!(old_dir.join("Abkhazia.mwm.resume").exists());

    h.storage.apply_catalog(catalog(V2)).unwrap();
    assert!(!old_dir.join("Abkhazia.mwm.resume").exists());
    assert!(!old_dir.exists());

    h.serve_catalog();
    h.storage.download_node("Abkhazia").unwrap();
    h.run();
    assert_eq!(h.storage.status("Abkhazia").unwrap(), Status::OnDisk);
    assert_eq!(
        fs::read(h.root().join(V2.to_string()).join("Abkhazia.mwm")).unwrap(),
        package_bytes("Abkhazia", V2, ABKHAZIA_SIZE)
    );
}

#[test]
fn test_register_all_local_maps_drops_old_version_partials() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("maps");
    place_package(&root, V1, "Abkhazia.mwm.resume", b"partial");
    place_package(&root, V2, "Algeria_Coast.mwm.resume", b"partial");

    let h = Harness::in_dir(temp, catalog(V2), |config| config);
    assert_eq!(h.storage.register_all_local_maps().unwrap(), 0);

    assert!(!root.join(V1.to_string()).exists());
    assert!(root
        .join(V2.to_string())
        .join("Algeria_Coast.mwm.resume")
        .exists());
}

#[test]
fn test_failed_diff_leaves_no_partial_and_delete_cleans_diff_output() {
    let h = out_of_date(&[("Abkhazia", ABKHAZIA_SIZE)]);
    let diff_size = 3 * CHUNK;
    h.downloader.serve("Abkhazia.mwmdiff", vec![0x5A; diff_size]);
    h.downloader.fail_once_at("Abkhazia.mwmdiff", CHUNK as u64);
    h.diff_source.offer("Abkhazia", diff_size as i64);
    assert_eq!(h.storage.refresh_diffs(), DiffStatus::Available);

    h.storage.update_node("Abkhazia").unwrap();
    h.run();

    assert_eq!(
        h.storage.status_and_error("Abkhazia").unwrap(),
        (Status::DownloadFailed, ErrorKind::Network)
    );
    let new_dir = h.root().join(V2.to_string());
    assert!(!new_dir.join("Abkhazia.mwmdiff.resume").exists());
    assert!(!new_dir.join("Abkhazia.mwmdiff.downloading").exists());

    place_package(&h.root(), V2, "Abkhazia.mwmdiff.resume", b"partial");
    place_package(&h.root(), V2, "Abkhazia.mwm.resume", b"partial");
    h.storage.delete_node("Abkhazia").unwrap();

    assert_eq!(h.storage.status("Abkhazia").unwrap(), Status::NotDownloaded);
    assert!(!new_dir.exists());
    assert!(!h.root().join(V1.to_string()).exists());
}

#[test]
fn test_locked_leaf_blocks_whole_group_delete() {
    let h = Harness::new(V1);
    h.serve_catalog();
    h.storage.download_node("Algeria").unwrap();
    h.run();
    h.clear_events();

    let coast = h.storage.get_handle("Algeria_Coast").unwrap();
    assert!(matches!(
        h.storage.delete_node("Algeria"),
        Err(StorageError::FileLocked { .. })
    ));

    let central = h.root().join(V1.to_string()).join("Algeria_Central.mwm");
    assert!(central.exists());
    assert!(h.storage.mwm_registry().is_registered("Algeria_Central"));
    assert_eq!(h.storage.status("Algeria").unwrap(), Status::OnDisk);
    h.run();
    assert!(h.statuses_of("Algeria_Central").is_empty());

    drop(coast);
    h.storage.delete_node("Algeria").unwrap();
    h.run();
    assert!(!central.exists());
    assert_eq!(h.statuses_of("Algeria_Central"), vec![Status::NotDownloaded]);
    assert_eq!(h.statuses_of("Algeria_Coast"), vec![Status::NotDownloaded]);
}

#[test]
fn test_renamed_package_is_migrated() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("maps");
    place_package(&root, V1, "Abkhasia.mwm", &package_bytes("Abkhazia", V1, ABKHAZIA_SIZE));
    let catalog = Catalog::load(
        format!(
            r#"{{ "id": "Countries", "v": {V2}, "g": [
                {{ "id": "Abkhazia", "s": {ABKHAZIA_SIZE}, "old": ["Abkhasia"] }} ] }}"#
        )
        .as_bytes(),
    )
    .unwrap();

    let h = Harness::in_dir(temp, catalog, |config| config);
    assert_eq!(h.storage.register_all_local_maps().unwrap(), 1);

    assert_eq!(h.storage.status("Abkhazia").unwrap(), Status::OnDiskOutOfDate);
    assert_eq!(h.storage.version("Abkhazia"), Some(V1));
    assert!(!root.join(V1.to_string()).join("Abkhasia.mwm").exists());
    assert!(root.join(V1.to_string()).join("Abkhazia.mwm").exists());
    assert!(h.storage.local_file("Abkhasia").is_none());
    assert_eq!(h.storage.mwm_registry().registered_version("Abkhazia"), Some(V1));
}
