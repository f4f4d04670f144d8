//! Canonical cache-key inputs.
//!
//! A cache entry's identity is `SHA-256(canonical JSON of CacheKeyInputs)`.
//! Canonicalization fixes the field order (struct declaration order under
//! serde) and sorts the input and dependency lists, so reordering either
//! list never changes the key.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::hash_str;

/// One hashed input file, repo-relative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputHash {
    pub path: String,
    pub hash: String,
}

/// The output fingerprint of a dependency task, as exposed by its done-file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyHash {
    pub task: String,
    pub hash: String,
}

/// Key components that apply to every task in a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalKeyComponents {
    pub tool_version: String,
    pub platform: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub env_markers: BTreeMap<String, String>,
}

/// The record hashed to form a cache entry's identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheKeyInputs {
    pub package: String,
    pub task: String,
    pub executable: String,
    pub command: String,
    pub input_hashes: Vec<InputHash>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dependency_hashes: Option<Vec<DependencyHash>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub global: Option<GlobalKeyComponents>,
}

impl CacheKeyInputs {
    /// Whether this key has anything worth caching against. Tasks with no
    /// declared inputs are not cacheable.
    pub fn has_inputs(&self) -> bool {
        !self.input_hashes.is_empty()
            || self
                .dependency_hashes
                .as_ref()
                .is_some_and(|deps| !deps.is_empty())
    }

    /// Canonical JSON: sorted input and dependency lists, fixed field order.
    pub fn canonical_json(&self) -> String {
        let mut canonical = self.clone();
        canonical.input_hashes.sort_by(|a, b| a.path.cmp(&b.path));
        if let Some(deps) = canonical.dependency_hashes.as_mut() {
            deps.sort_by(|a, b| a.task.cmp(&b.task));
        }
        serde_json::to_string(&canonical).expect("cache key inputs serialize to JSON")
    }

    /// Hex SHA-256 of the canonical JSON. Stable across runs and operating
    /// systems.
    pub fn key_hash(&self) -> String {
        hash_str(&self.canonical_json())
    }
}

/// First 8 hex characters of the SHA-256 of a command string. Used in
/// done-file names so two commands sharing an executable never collide.
pub fn command_digest(command: &str) -> String {
    hash_str(command)[..8].to_string()
}
