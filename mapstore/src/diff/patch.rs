//! Binary patch application.
//!
//! The built-in format is a `bincode`-encoded [`Patch`]: a header with the
//! expected source and target sizes followed by a list of copy/insert
//! operations. The output is written through a `.diffapplying` file and
//! renamed into place only after the target size has been checked.

use std::fs::{self, File};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use bincode::Options;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::country::CountryId;
use crate::error::{StorageError, StorageResult};
use crate::local::{remove_if_exists, transient_path, TransientSuffix};

/// Magic number at the start of every patch ("MWDF").
pub const PATCH_MAGIC: u32 = 0x4D57_4446;

/// One patch operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatchOp {
    /// Copy `len` bytes from the source file starting at `offset`.
    Copy { offset: u64, len: u64 },
    /// Append literal bytes.
    Insert(Vec<u8>),
}

/// A patch turning one file into another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    pub magic: u32,
    pub source_size: u64,
    pub target_size: u64,
    pub ops: Vec<PatchOp>,
}

fn patch_options() -> impl Options {
    bincode::DefaultOptions::new().with_fixint_encoding()
}

impl Patch {
    /// Build a patch from `source` to `target` that reuses their common
    /// prefix and suffix.
    pub fn compute(source: &[u8], target: &[u8]) -> Self {
        let prefix = source
            .iter()
            .zip(target)
            .take_while(|(a, b)| a == b)
            .count();
        let max_suffix = source.len().min(target.len()) - prefix;
        let suffix = source
            .iter()
            .rev()
            .zip(target.iter().rev())
            .take(max_suffix)
            .take_while(|(a, b)| a == b)
            .count();

        let mut ops = Vec::new();
        if prefix > 0 {
            ops.push(PatchOp::Copy {
                offset: 0,
                len: prefix as u64,
            });
        }
        let middle = &target[prefix..target.len() - suffix];
        if !middle.is_empty() {
            ops.push(PatchOp::Insert(middle.to_vec()));
        }
        if suffix > 0 {
            ops.push(PatchOp::Copy {
                offset: (source.len() - suffix) as u64,
                len: suffix as u64,
            });
        }

        Self {
            magic: PATCH_MAGIC,
            source_size: source.len() as u64,
            target_size: target.len() as u64,
            ops,
        }
    }

    pub fn to_bytes(&self) -> StorageResult<Vec<u8>> {
        patch_options()
            .serialize(self)
            .map_err(|e| StorageError::InvalidConfig(format!("patch encoding: {}", e)))
    }

    /// Decode a patch. `country` is only used for error reporting.
    pub fn from_bytes(country: &CountryId, bytes: &[u8]) -> StorageResult<Self> {
        let patch: Patch = patch_options()
            .with_limit(bytes.len() as u64)
            .deserialize(bytes)
            .map_err(|e| diff_error(country, format!("malformed patch: {}", e)))?;
        if patch.magic != PATCH_MAGIC {
            return Err(diff_error(country, format!("bad magic {:#x}", patch.magic)));
        }
        Ok(patch)
    }
}

/// Applies a downloaded diff to an existing package file.
pub trait DiffApplier: Send + Sync {
    /// Produce `output` from `source` and `diff`.
    ///
    /// Implementations check `cancel` between steps and return
    /// [`StorageError::Cancelled`]; they must not leave `output` behind on
    /// failure.
    fn apply(
        &self,
        country: &CountryId,
        source: &Path,
        diff: &Path,
        output: &Path,
        cancel: &CancellationToken,
    ) -> StorageResult<()>;
}

/// Applies [`Patch`] files.
#[derive(Debug, Clone, Copy, Default)]
pub struct PatchApplier;

impl PatchApplier {
    pub fn new() -> Self {
        Self
    }

    fn write_target(
        &self,
        country: &CountryId,
        source_path: &Path,
        patch: &Patch,
        applying: &Path,
        cancel: &CancellationToken,
    ) -> StorageResult<()> {
        let mut source = File::open(source_path).map_err(|e| StorageError::disk(source_path, e))?;
        let source_size = source
            .metadata()
            .map_err(|e| StorageError::disk(source_path, e))?
            .len();
        if source_size != patch.source_size {
            return Err(diff_error(
                country,
                format!(
                    "source is {} bytes, patch expects {}",
                    source_size, patch.source_size
                ),
            ));
        }

        if let Some(parent) = applying.parent() {
            fs::create_dir_all(parent).map_err(|e| StorageError::disk(parent, e))?;
        }
        let file = File::create(applying).map_err(|e| StorageError::disk(applying, e))?;
        let mut writer = BufWriter::new(file);
        let mut written = 0u64;

        for op in &patch.ops {
            if cancel.is_cancelled() {
                return Err(StorageError::Cancelled);
            }
            match op {
                PatchOp::Copy { offset, len } => {
                    let end = offset.checked_add(*len).filter(|end| *end <= source_size);
                    if end.is_none() {
                        return Err(diff_error(
                            country,
                            format!("copy {}+{} past end of source", offset, len),
                        ));
                    }
                    source
                        .seek(SeekFrom::Start(*offset))
                        .map_err(|e| StorageError::disk(source_path, e))?;
                    let copied = std::io::copy(&mut (&mut source).take(*len), &mut writer)
                        .map_err(|e| StorageError::disk(applying, e))?;
                    written += copied;
                }
                PatchOp::Insert(bytes) => {
                    writer
                        .write_all(bytes)
                        .map_err(|e| StorageError::disk(applying, e))?;
                    written += bytes.len() as u64;
                }
            }
        }

        writer.flush().map_err(|e| StorageError::disk(applying, e))?;

        if written != patch.target_size {
            return Err(diff_error(
                country,
                format!("produced {} bytes, expected {}", written, patch.target_size),
            ));
        }
        Ok(())
    }
}

impl DiffApplier for PatchApplier {
    fn apply(
        &self,
        country: &CountryId,
        source: &Path,
        diff: &Path,
        output: &Path,
        cancel: &CancellationToken,
    ) -> StorageResult<()> {
        info!(country = %country, source = %source.display(), "Applying diff");

        let bytes = fs::read(diff).map_err(|e| StorageError::disk(diff, e))?;
        let patch = Patch::from_bytes(country, &bytes)?;
        debug!(country = %country, ops = patch.ops.len(), "Patch decoded");

        let applying = transient_path(output, TransientSuffix::DiffApplying);
        if let Err(e) = self.write_target(country, source, &patch, &applying, cancel) {
            remove_if_exists(&applying)?;
            return Err(e);
        }

        fs::rename(&applying, output).map_err(|e| StorageError::disk(output, e))?;
        info!(country = %country, bytes = patch.target_size, "Diff applied");
        Ok(())
    }
}

fn diff_error(country: &CountryId, reason: String) -> StorageError {
    StorageError::DiffApplication {
        country: country.clone(),
        reason,
    }
}
