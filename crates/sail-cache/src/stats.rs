//! Rolling cache statistics, persisted to a sidecar JSON.

use camino::Utf8Path;
use serde::{Deserialize, Serialize};

use crate::CacheError;

pub const STATS_FILE: &str = "stats.json";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub entries: u64,
    pub total_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub restored_count: u64,
    pub restore_ms_total: u64,
    /// Execution time of restored entries: what the cache saved.
    pub time_saved_ms: u64,
}

impl CacheStats {
    pub fn average_restore_ms(&self) -> u64 {
        if self.restored_count == 0 {
            0
        } else {
            self.restore_ms_total / self.restored_count
        }
    }

    pub(crate) fn load(cache_root: &Utf8Path) -> CacheStats {
        let path = cache_root.join(STATS_FILE);
        std::fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    /// Persists atomically: temp in the same directory, then rename.
    pub(crate) fn persist(&self, cache_root: &Utf8Path) -> Result<(), CacheError> {
        let path = cache_root.join(STATS_FILE);
        let temp = cache_root.join(format!(".{STATS_FILE}.{}.tmp", std::process::id()));
        let contents =
            serde_json::to_string_pretty(self).expect("cache stats serialize to JSON");
        std::fs::write(&temp, contents).map_err(|source| CacheError::Io {
            path: temp.clone(),
            source,
        })?;
        std::fs::rename(&temp, &path).map_err(|source| CacheError::Io { path, source })?;
        Ok(())
    }
}
