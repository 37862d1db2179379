//! HTTP-based file downloader with resume support.
//!
//! - Servers are tried in order; the first success wins
//! - Resumable downloads via HTTP Range requests
//! - Cooperative cancellation between chunks

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::Path;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::StatusCode;
use tracing::{debug, info, warn};

use super::progress::Progress;
use super::traits::{Downloader, FetchRequest};
use crate::error::{StorageError, StorageResult};

/// Default timeout for HTTP requests in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Buffer size for reading/writing during downloads (64KB).
const BUFFER_SIZE: usize = 64 * 1024;

/// Blocking HTTP implementation of [`Downloader`].
#[derive(Debug, Clone)]
pub struct HttpDownloader {
    client: Client,
    timeout: Duration,
}

impl HttpDownloader {
    /// Create a downloader whose requests time out after `timeout`.
    pub fn new(timeout: Duration) -> StorageResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StorageError::InvalidConfig(format!("HTTP client: {}", e)))?;
        Ok(Self { client, timeout })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn map_send_error(&self, url: &str, e: reqwest::Error) -> StorageError {
        if e.is_timeout() {
            StorageError::Timeout {
                url: url.to_string(),
                timeout_secs: self.timeout.as_secs(),
            }
        } else {
            StorageError::Network {
                url: url.to_string(),
                reason: e.to_string(),
            }
        }
    }

    /// Query total size and range support via HEAD.
    fn query_file_info(&self, url: &str) -> StorageResult<(u64, bool)> {
        let response = self
            .client
            .head(url)
            .send()
            .map_err(|e| self.map_send_error(url, e))?;

        check_status(url, response.status())?;

        let total_size = response
            .headers()
            .get("content-length")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);

        let supports_range = response
            .headers()
            .get("accept-ranges")
            .map(|v| v.to_str().unwrap_or("") == "bytes")
            .unwrap_or(false);

        Ok((total_size, supports_range))
    }

    fn download_with_resume(
        &self,
        url: &str,
        request: &FetchRequest,
        on_progress: &mut dyn FnMut(Progress),
    ) -> StorageResult<u64> {
        let dest = request.dest.as_path();
        let existing_size = dest.metadata().map(|m| m.len()).unwrap_or(0);

        let (head_size, supports_range) = self.query_file_info(url)?;
        let total_size = if head_size > 0 {
            head_size
        } else {
            request.expected_size
        };

        if total_size > 0 && existing_size == total_size {
            debug!(url, bytes = total_size, "Partial file already complete");
            on_progress(Progress::complete(total_size));
            return Ok(total_size);
        }

        let (start_byte, file) =
            prepare_destination(dest, existing_size, total_size, supports_range)?;
        if start_byte > 0 {
            info!(url, from = start_byte, "Resuming download");
        }

        self.stream_download(url, file, request, start_byte, total_size, on_progress)
    }

    fn stream_download(
        &self,
        url: &str,
        file: File,
        request: &FetchRequest,
        start_byte: u64,
        total_size: u64,
        on_progress: &mut dyn FnMut(Progress),
    ) -> StorageResult<u64> {
        let dest = request.dest.as_path();

        let mut get = self.client.get(url);
        if start_byte > 0 {
            get = get.header("Range", format!("bytes={}-", start_byte));
        }

        let mut response = get.send().map_err(|e| self.map_send_error(url, e))?;
        check_status(url, response.status())?;

        let mut writer = BufWriter::new(file);
        let mut buffer = vec![0u8; BUFFER_SIZE];
        let mut downloaded = start_byte;

        loop {
            if request.cancel.is_cancelled() {
                return Err(StorageError::Cancelled);
            }

            let bytes_read = response
                .read(&mut buffer)
                .map_err(|e| StorageError::Network {
                    url: url.to_string(),
                    reason: format!("read error: {}", e),
                })?;
            if bytes_read == 0 {
                break;
            }

            writer
                .write_all(&buffer[..bytes_read])
                .map_err(|e| StorageError::disk(dest, e))?;

            downloaded += bytes_read as u64;
            on_progress(Progress::new(downloaded, total_size.max(downloaded)));
        }

        writer.flush().map_err(|e| StorageError::disk(dest, e))?;
        Ok(downloaded)
    }
}

impl Downloader for HttpDownloader {
    fn fetch(
        &self,
        request: &FetchRequest,
        on_progress: &mut dyn FnMut(Progress),
    ) -> StorageResult<u64> {
        let mut last_error = StorageError::NotFound {
            url: request.urls.first().cloned().unwrap_or_default(),
        };
        let mut all_not_found = true;

        for url in &request.urls {
            match self.download_with_resume(url, request, on_progress) {
                Ok(size) => return Ok(size),
                Err(e @ (StorageError::Cancelled | StorageError::Disk { .. })) => return Err(e),
                Err(e) => {
                    warn!(url = %url, error = %e, "Server failed, trying next");
                    all_not_found &= matches!(e, StorageError::NotFound { .. });
                    last_error = e;
                }
            }
        }

        if all_not_found {
            if let Some(url) = request.urls.last() {
                return Err(StorageError::NotFound { url: url.clone() });
            }
        }
        Err(last_error)
    }
}

fn check_status(url: &str, status: StatusCode) -> StorageResult<()> {
    if status == StatusCode::NOT_FOUND {
        return Err(StorageError::NotFound {
            url: url.to_string(),
        });
    }
    if !status.is_success() {
        return Err(StorageError::Network {
            url: url.to_string(),
            reason: format!("request failed with status {}", status),
        });
    }
    Ok(())
}

/// Open the destination for appending (resume) or truncating (fresh start).
fn prepare_destination(
    dest: &Path,
    existing_size: u64,
    total_size: u64,
    supports_range: bool,
) -> StorageResult<(u64, File)> {
    if existing_size > 0 && supports_range && existing_size < total_size {
        let file = OpenOptions::new()
            .append(true)
            .open(dest)
            .map_err(|e| StorageError::disk(dest, e))?;
        return Ok((existing_size, file));
    }

    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|e| StorageError::disk(parent, e))?;
    }
    let file = File::create(dest).map_err(|e| StorageError::disk(dest, e))?;
    Ok((0, file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_http_downloader_timeout() {
        let downloader = HttpDownloader::new(Duration::from_secs(DEFAULT_TIMEOUT_SECS)).unwrap();
        assert_eq!(downloader.timeout().as_secs(), DEFAULT_TIMEOUT_SECS);
    }

    #[test]
    fn test_prepare_destination_resumes_partial() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("A.mwm.downloading");
        fs::write(&dest, b"12345").unwrap();

        let (start, _file) = prepare_destination(&dest, 5, 10, true).unwrap();
        assert_eq!(start, 5);
        assert_eq!(fs::read(&dest).unwrap(), b"12345");
    }

    #[test]
    fn test_prepare_destination_restarts_without_range_support() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("1").join("A.mwm.downloading");
        fs::create_dir_all(dest.parent().unwrap()).unwrap();
        fs::write(&dest, b"12345").unwrap();

        let (start, _file) = prepare_destination(&dest, 5, 10, false).unwrap();
        assert_eq!(start, 0);
        assert_eq!(fs::metadata(&dest).unwrap().len(), 0);
    }

    #[test]
    fn test_check_status() {
        assert!(check_status("u", StatusCode::OK).is_ok());
        assert!(check_status("u", StatusCode::PARTIAL_CONTENT).is_ok());
        assert!(matches!(
            check_status("u", StatusCode::NOT_FOUND),
            Err(StorageError::NotFound { .. })
        ));
        assert!(matches!(
            check_status("u", StatusCode::INTERNAL_SERVER_ERROR),
            Err(StorageError::Network { .. })
        ));
    }

    #[test]
    fn test_fetch_with_no_urls_is_not_found() {
        let temp = TempDir::new().unwrap();
        let downloader = HttpDownloader::new(Duration::from_secs(1)).unwrap();
        let request = FetchRequest::new(Vec::new(), temp.path().join("a"), 0);

        let result = downloader.fetch(&request, &mut |_| {});
        assert!(matches!(result, Err(StorageError::NotFound { .. })));
    }
}
