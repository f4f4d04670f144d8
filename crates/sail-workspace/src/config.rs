//! The build configuration file contract.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const CONFIG_FILE_NAME: &str = "sail.config.json";

/// One entry in the `tasks` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskConfig {
    /// Dependency declarations: `name` (same package), `^name` (each
    /// workspace dependency), `pkg#name` (explicit cross-package).
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// `true`: the task is a leaf whose command comes from the package's
    /// script table. `false`: a purely structural group task.
    #[serde(default = "default_true")]
    pub script: bool,
    /// Whether results may be served from and written to the shared cache.
    #[serde(default = "default_true")]
    pub cache: bool,
    /// Route execution to the worker pool. Results are identical either way.
    #[serde(default)]
    pub use_worker: bool,
    /// Input globs, relative to each package directory. Empty means the
    /// package's `src` tree.
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Output globs, relative to each package directory.
    #[serde(default)]
    pub outputs: Vec<String>,
    /// How input and output files are fingerprinted in the done-file.
    #[serde(default)]
    pub fingerprint: FingerprintMode,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            depends_on: Vec::new(),
            script: true,
            cache: true,
            use_worker: false,
            inputs: Vec::new(),
            outputs: Vec::new(),
            fingerprint: FingerprintMode::default(),
        }
    }
}

/// Fingerprinting strategy for done-files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FingerprintMode {
    /// Content hash of each file.
    #[default]
    Hash,
    /// `(mtime_ms, size)` tuple per file.
    Stat,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_size_bytes: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SailConfig {
    #[serde(default)]
    pub tasks: BTreeMap<String, TaskConfig>,
    /// Globs excluded from the package scan, relative to the build root.
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    /// Prefixes treated as a single executable when parsing commands, e.g.
    /// `flub generate` so `flub generate entrypoints` keys on the pair.
    #[serde(default)]
    pub multi_command_executables: Vec<String>,
    #[serde(default)]
    pub cache: CacheConfig,
    /// Intrinsic scheduling weight overrides by task name. Unlisted tasks
    /// weigh 1.
    #[serde(default)]
    pub task_weights: BTreeMap<String, u32>,
}

impl SailConfig {
    pub fn task(&self, name: &str) -> Option<&TaskConfig> {
        self.tasks.get(name)
    }

    pub fn task_weight(&self, name: &str) -> u32 {
        self.task_weights.get(name).copied().unwrap_or(1)
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_parses_task_table() {
        let config: SailConfig = serde_json::from_str(
            r#"{
                "tasks": {
                    "build": { "dependsOn": ["compile"], "script": false },
                    "compile": { "dependsOn": ["^compile"] }
                },
                "excludeGlobs": ["docs/**"],
                "multiCommandExecutables": ["flub generate"],
                "taskWeights": { "compile": 10 }
            }"#,
        )
        .unwrap();

        let build = config.task("build").unwrap();
        assert_eq!(build.depends_on, vec!["compile"]);
        assert!(!build.script);
        assert!(build.cache);
        assert!(!build.use_worker);

        // `script` defaults to true for plain entries.
        let compile = config.task("compile").unwrap();
        assert_eq!(compile.depends_on, vec!["^compile"]);
        assert!(compile.script);

        assert_eq!(config.exclude_globs, vec!["docs/**"]);
        assert_eq!(config.task_weight("compile"), 10);
        assert_eq!(config.task_weight("build"), 1);
    }

    #[test]
    fn test_empty_config_is_valid() {
        let config: SailConfig = serde_json::from_str("{}").unwrap();
        assert!(config.tasks.is_empty());
        assert!(config.cache.dir.is_none());
    }
}
