//! Country identifier type.

use std::borrow::Borrow;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a map package or group of packages (e.g. `"Algeria_Coast"`).
///
/// Ids are opaque strings; hierarchy comes from the catalog tree, not from
/// the id text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CountryId(String);

impl CountryId {
    /// Create a new id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check whether the id is usable (non-empty).
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty()
    }
}

impl fmt::Display for CountryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CountryId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for CountryId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl Borrow<str> for CountryId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for CountryId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
