//! SHA-256 verification of downloaded package files.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::{StorageError, StorageResult};

/// Buffer size for reading files during checksum calculation (64KB).
const BUFFER_SIZE: usize = 64 * 1024;

/// Calculate the lowercase hex SHA-256 of a file.
pub fn calculate_file_checksum(path: &Path) -> StorageResult<String> {
    let mut file = File::open(path).map_err(|e| StorageError::disk(path, e))?;

    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];

    loop {
        let bytes_read = file
            .read(&mut buffer)
            .map_err(|e| StorageError::disk(path, e))?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Check a file's size and, when given, its SHA-256.
///
/// A zero `expected_size` skips the size check.
pub fn verify_file(path: &Path, expected_size: u64, expected_sha256: Option<&str>) -> StorageResult<()> {
    let actual_size = path
        .metadata()
        .map_err(|e| StorageError::disk(path, e))?
        .len();

    if expected_size != 0 && actual_size != expected_size {
        return Err(StorageError::Integrity {
            path: path.to_path_buf(),
            reason: format!("expected {} bytes, found {}", expected_size, actual_size),
        });
    }

    if let Some(expected) = expected_sha256 {
        let actual = calculate_file_checksum(path)?;
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(StorageError::Integrity {
                path: path.to_path_buf(),
                reason: format!("sha256 mismatch: expected {}, got {}", expected, actual),
            });
        }
    }

    Ok(())
}
