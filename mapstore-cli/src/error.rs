//! CLI error type.

use std::fmt;

use mapstore::StorageError;

#[derive(Debug)]
pub enum CliError {
    /// Bad or missing configuration.
    Config(String),
    /// Error from the storage library.
    Storage(StorageError),
    /// Some packages did not end up on disk.
    Incomplete(Vec<String>),
}

impl CliError {
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) => 2,
            Self::Storage(_) => 1,
            Self::Incomplete(_) => 3,
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration error: {}", msg),
            Self::Storage(e) => write!(f, "{}", e),
            Self::Incomplete(ids) => write!(f, "not downloaded: {}", ids.join(", ")),
        }
    }
}

impl std::error::Error for CliError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Storage(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StorageError> for CliError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::InvalidConfig(msg) => Self::Config(msg),
            other => Self::Storage(other),
        }
    }
}
