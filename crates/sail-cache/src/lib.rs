//! The shared content-addressed output cache.
//!
//! Task outputs are stored under a hash of their canonical
//! [`CacheKeyInputs`](sail_hash::CacheKeyInputs). Each entry is a manifest
//! plus content-addressed payload files; writes are temp-then-rename and
//! guarded by a per-entry advisory lock, restores verify every payload's
//! hash.

mod fs;
mod stats;

use camino::Utf8PathBuf;
pub use fs::{CacheOptions, ExecMetadata, RestoreOutcome, SharedCache, StoreOutcome};
use sail_errors::{Classify, ErrorContext, ErrorKind};
use sail_hash::InputHash;
use serde::{Deserialize, Serialize};
pub use stats::CacheStats;
use thiserror::Error;

/// On-disk format version; incompatible roots are refused and the build
/// proceeds without a cache.
pub const CACHE_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache IO error at {path}: {source}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid cache manifest at {path}: {source}")]
    InvalidManifest {
        path: Utf8PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("cache directory uses on-disk version {found}, expected {CACHE_VERSION}")]
    VersionMismatch { found: String },
    #[error("timed out waiting for the entry lock of {key}")]
    LockTimeout { key: String },
}

impl Classify for CacheError {
    fn classify(&self) -> ErrorKind {
        ErrorKind::Cache
    }

    fn remediation(&self) -> Option<&'static str> {
        match self {
            CacheError::VersionMismatch { .. } => {
                Some("delete the cache directory or point SAIL_CACHE_DIR somewhere else")
            }
            _ => None,
        }
    }

    fn context(&self) -> ErrorContext {
        match self {
            CacheError::Io { path, .. } | CacheError::InvalidManifest { path, .. } => {
                ErrorContext::paths([path.as_str()])
            }
            _ => ErrorContext::default(),
        }
    }
}

/// One output file recorded in a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputFile {
    /// Path relative to the working directory the task ran in.
    pub path: String,
    pub hash: String,
    pub size: u64,
    pub mode: u32,
}

/// A cache entry's manifest. Written once after a successful execution,
/// never mutated (except the access timestamp).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub version: u32,
    pub task_id: String,
    pub key: String,
    pub inputs: Vec<InputHash>,
    pub outputs: Vec<OutputFile>,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub execution_time_ms: u64,
    pub created_at: u64,
    pub last_accessed_at: u64,
}

pub(crate) fn unix_time_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
