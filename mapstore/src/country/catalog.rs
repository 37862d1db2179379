//! Versioned tree of known map packages.
//!
//! The catalog is loaded once from a JSON manifest:
//!
//! ```text
//! { "id": "Countries", "v": 230101, "g": [
//!     { "id": "Abkhazia", "s": 4689718, "affiliations": ["Georgia"] },
//!     { "id": "Algeria", "g": [
//!         { "id": "Algeria_Central", "s": 24177144 },
//!         { "id": "Algeria_Coast", "s": 66701534, "old": ["Algeria"] } ] } ] }
//! ```
//!
//! Leaves carry a byte size (`s`), groups carry children (`g`). The catalog
//! is read-only after load; a new data version means a new catalog.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use serde::Deserialize;

use super::{CountryId, DataVersion};
use crate::error::{StorageError, StorageResult};

const MANIFEST_SOURCE: &str = "catalog manifest";

/// A catalog node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Country {
    /// Node id.
    pub id: CountryId,
    /// Primary parent. `None` only for the root sentinel.
    pub parent_id: Option<CountryId>,
    /// Children in manifest order. Empty for leaves.
    pub child_ids: Vec<CountryId>,
    /// Package size for leaves, sum of leaf descendants for groups.
    pub byte_size: u64,
    /// Informational affiliations, stored verbatim.
    pub affiliations: Vec<String>,
    /// Deprecated ids this node replaces.
    pub old_ids: Vec<CountryId>,
    /// Optional SHA-256 of the full package file (lowercase hex).
    pub sha256: Option<String>,
}

impl Country {
    /// Check whether this node has a direct file representation.
    pub fn is_leaf(&self) -> bool {
        self.child_ids.is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct RawManifest {
    id: String,
    v: DataVersion,
    #[serde(default)]
    g: Vec<RawNode>,
}

#[derive(Debug, Deserialize)]
struct RawNode {
    id: String,
    s: Option<u64>,
    g: Option<Vec<RawNode>>,
    #[serde(default)]
    affiliations: Vec<String>,
    #[serde(default)]
    old: Vec<String>,
    sha256: Option<String>,
}

/// The static tree of known packages.
#[derive(Debug, Clone)]
pub struct Catalog {
    root: CountryId,
    version: DataVersion,
    nodes: HashMap<CountryId, Country>,
}

impl Catalog {
    /// Parse a catalog manifest.
    ///
    /// Any malformed node rejects the whole manifest.
    pub fn load(manifest: &[u8]) -> StorageResult<Self> {
        let raw: RawManifest =
            serde_json::from_slice(manifest).map_err(|e| parse_error(e.to_string()))?;

        if raw.id.is_empty() {
            return Err(parse_error("root id is empty".to_string()));
        }

        let root = CountryId::new(raw.id);
        let mut catalog = Self {
            root: root.clone(),
            version: raw.v,
            nodes: HashMap::new(),
        };

        let mut child_ids = Vec::with_capacity(raw.g.len());
        for node in raw.g {
            child_ids.push(catalog.insert_node(node, &root)?);
        }

        catalog.nodes.insert(
            root.clone(),
            Country {
                id: root,
                parent_id: None,
                child_ids,
                byte_size: 0,
                affiliations: Vec::new(),
                old_ids: Vec::new(),
                sha256: None,
            },
        );
        catalog.compute_group_sizes();

        Ok(catalog)
    }

    /// Load a catalog manifest from a file.
    pub fn load_file(path: &Path) -> StorageResult<Self> {
        let bytes = fs::read(path).map_err(|e| StorageError::disk(path, e))?;
        Self::load(&bytes)
    }

    /// Insert a node and its subtree. Returns the node id.
    ///
    /// A leaf listed under several groups (disputed territory) keeps the
    /// first group as its primary parent and appears in every group's
    /// children.
    fn insert_node(&mut self, raw: RawNode, parent: &CountryId) -> StorageResult<CountryId> {
        if raw.id.is_empty() {
            return Err(parse_error(format!("node under {} has empty id", parent)));
        }
        let id = CountryId::new(raw.id);

        let child_ids = match raw.g {
            Some(children) => {
                if children.is_empty() {
                    return Err(parse_error(format!("group {} has no children", id)));
                }
                let mut ids = Vec::with_capacity(children.len());
                for child in children {
                    ids.push(self.insert_node(child, &id)?);
                }
                ids
            }
            None => Vec::new(),
        };

        let byte_size = if child_ids.is_empty() {
            match raw.s {
                Some(size) if size > 0 => size,
                _ => return Err(parse_error(format!("leaf {} has no size", id))),
            }
        } else {
            0
        };

        if let Some(existing) = self.nodes.get(&id) {
            if !existing.is_leaf() || !child_ids.is_empty() || existing.byte_size != byte_size {
                return Err(parse_error(format!("conflicting duplicate node {}", id)));
            }
            return Ok(id);
        }

        self.nodes.insert(
            id.clone(),
            Country {
                id: id.clone(),
                parent_id: Some(parent.clone()),
                child_ids,
                byte_size,
                affiliations: raw.affiliations,
                old_ids: raw.old.into_iter().map(CountryId::new).collect(),
                sha256: raw.sha256,
            },
        );

        Ok(id)
    }

    fn compute_group_sizes(&mut self) {
        let groups: Vec<CountryId> = self
            .nodes
            .values()
            .filter(|c| !c.is_leaf())
            .map(|c| c.id.clone())
            .collect();

        for id in groups {
            let size = self.leaves_in_subtree(id.as_str()).iter().map(|leaf| self.leaf_size(leaf)).sum();
            if let Some(node) = self.nodes.get_mut(&id) {
                node.byte_size = size;
            }
        }
    }

    fn leaf_size(&self, id: &CountryId) -> u64 {
        self.nodes.get(id).map(|c| c.byte_size).unwrap_or(0)
    }

    /// Data version of this catalog.
    pub fn version(&self) -> DataVersion {
        self.version
    }

    /// Id of the root sentinel.
    pub fn root_id(&self) -> &CountryId {
        &self.root
    }

    /// Look up a node.
    pub fn lookup(&self, id: &str) -> Option<&Country> {
        self.nodes.get(id)
    }

    /// Check whether the id is known.
    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    /// Check whether the id is a known leaf.
    pub fn is_leaf(&self, id: &str) -> bool {
        self.lookup(id).is_some_and(|c| c.is_leaf() && c.id != self.root)
    }

    /// Children of a node, empty for leaves and unknown ids.
    pub fn children(&self, id: &str) -> &[CountryId] {
        self.lookup(id).map(|c| c.child_ids.as_slice()).unwrap_or(&[])
    }

    /// Ancestors from the topmost group down to the direct parent.
    ///
    /// The root sentinel is excluded.
    pub fn ancestors(&self, id: &str) -> Vec<CountryId> {
        let mut chain = Vec::new();
        let mut current = self.lookup(id).and_then(|c| c.parent_id.as_ref());
        while let Some(parent) = current {
            if *parent == self.root {
                break;
            }
            chain.push(parent.clone());
            current = self.lookup(parent.as_str()).and_then(|c| c.parent_id.as_ref());
        }
        chain.reverse();
        chain
    }

    /// Total download size of a node.
    pub fn total_size(&self, id: &str) -> u64 {
        self.lookup(id).map(|c| c.byte_size).unwrap_or(0)
    }

    /// Visit a node and all its descendants in pre-order.
    pub fn for_each_in_subtree<'a>(&'a self, id: &str, mut visit: impl FnMut(&'a Country)) {
        let Some(start) = self.lookup(id) else {
            return;
        };

        let mut stack = vec![start];
        while let Some(node) = stack.pop() {
            visit(node);
            for child in node.child_ids.iter().rev() {
                if let Some(child_node) = self.lookup(child.as_str()) {
                    stack.push(child_node);
                }
            }
        }
    }

    /// Leaves of a subtree in pre-order, without duplicates.
    ///
    /// For a leaf this is the leaf itself.
    pub fn leaves_in_subtree(&self, id: &str) -> Vec<CountryId> {
        let mut leaves: Vec<CountryId> = Vec::new();
        let mut seen: HashSet<&CountryId> = HashSet::new();
        self.for_each_in_subtree(id, |node| {
            if node.is_leaf() && node.id != self.root && seen.insert(&node.id) {
                leaves.push(node.id.clone());
            }
        });
        leaves
    }

    /// All leaves of the catalog.
    pub fn leaves(&self) -> impl Iterator<Item = &Country> {
        self.nodes.values().filter(move |c| c.is_leaf() && c.id != self.root)
    }

    /// Nodes that list `old_id` as a deprecated alias.
    pub fn find_by_old_id(&self, old_id: &str) -> Vec<CountryId> {
        let mut ids: Vec<CountryId> = self
            .nodes
            .values()
            .filter(|c| c.old_ids.iter().any(|old| old.as_str() == old_id))
            .map(|c| c.id.clone())
            .collect();
        ids.sort();
        ids
    }
}

fn parse_error(reason: String) -> StorageError {
    StorageError::ManifestParse {
        source_name: MANIFEST_SOURCE.to_string(),
        reason,
    }
}
