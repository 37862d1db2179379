//! Diff discovery protocol.
//!
//! Request:
//!
//! ```text
//! { "mwms": [ { "name": "Abkhazia", "version": 230101 }, ... ], "max_version": 230215 }
//! ```
//!
//! Response, one entry per requested package (negative size = no diff):
//!
//! ```text
//! { "mwms": [ { "name": "Abkhazia", "size": 10240 }, ... ] }
//! ```

use std::time::Duration;

use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::country::{CountryId, DataVersion};
use crate::error::{StorageError, StorageResult};

/// Name used for [`StorageError::ManifestParse`] raised by diff responses.
pub(crate) const DIFF_MANIFEST_SOURCE: &str = "diff manifest";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffRequestEntry {
    pub name: CountryId,
    pub version: DataVersion,
}

/// Batched query for every local package older than `max_version`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffRequest {
    pub mwms: Vec<DiffRequestEntry>,
    pub max_version: DataVersion,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffResponseEntry {
    pub name: CountryId,
    /// Diff size in bytes; negative when no diff exists.
    pub size: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffResponse {
    pub mwms: Vec<DiffResponseEntry>,
}

impl DiffResponse {
    /// Parse a response body.
    pub fn from_json(body: &[u8]) -> StorageResult<Self> {
        serde_json::from_slice(body).map_err(|e| StorageError::ManifestParse {
            source_name: DIFF_MANIFEST_SOURCE.to_string(),
            reason: e.to_string(),
        })
    }
}

/// Answers diff discovery queries.
pub trait DiffSource: Send + Sync {
    fn query(&self, request: &DiffRequest) -> StorageResult<DiffResponse>;
}

/// Posts diff queries to an HTTP endpoint.
#[derive(Debug, Clone)]
pub struct HttpDiffSource {
    client: Client,
    url: String,
    timeout: Duration,
}

impl HttpDiffSource {
    /// Create a source for `url`. `timeout` should be short: a slow manifest
    /// only means "no diffs".
    pub fn new(url: impl Into<String>, timeout: Duration) -> StorageResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StorageError::InvalidConfig(format!("HTTP client: {}", e)))?;
        Ok(Self {
            client,
            url: url.into(),
            timeout,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl DiffSource for HttpDiffSource {
    fn query(&self, request: &DiffRequest) -> StorageResult<DiffResponse> {
        debug!(url = %self.url, maps = request.mwms.len(), "Querying diff manifest");

        let response = self
            .client
            .post(&self.url)
            .json(request)
            .send()
            .map_err(|e| {
                if e.is_timeout() {
                    StorageError::Timeout {
                        url: self.url.clone(),
                        timeout_secs: self.timeout.as_secs(),
                    }
                } else {
                    StorageError::Network {
                        url: self.url.clone(),
                        reason: e.to_string(),
                    }
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(StorageError::Network {
                url: self.url.clone(),
                reason: format!("diff manifest request failed with status {}", status),
            });
        }

        let body = response.bytes().map_err(|e| StorageError::Network {
            url: self.url.clone(),
            reason: e.to_string(),
        })?;
        DiffResponse::from_json(&body)
    }
}
