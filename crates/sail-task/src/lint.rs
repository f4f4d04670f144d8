//! Lint-style leaves (eslint, api-extractor).
//!
//! These tasks depend on a TypeScript compile: their done-file embeds the
//! dependency's stable incremental state, the tool's own config file digest,
//! and the tool version. Cache inputs are the source tree plus the config
//! files, which [`crate::LeafRuntime`] already collects.

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use sail_hash::FileHashCache;

use crate::{
    tsc::{BuildInfo, TscTask},
    Error,
};

/// Builds the `config` section of a lint leaf's done-file payload.
pub struct LintTask {
    package_dir: Utf8PathBuf,
    config_files: Vec<Utf8PathBuf>,
    tool_version: String,
}

impl LintTask {
    pub fn new(
        package_dir: Utf8PathBuf,
        config_files: Vec<Utf8PathBuf>,
        tool_version: impl Into<String>,
    ) -> Self {
        Self {
            package_dir,
            config_files,
            tool_version: tool_version.into(),
        }
    }

    /// The extra done-file configuration: tool version, each existing config
    /// file's digest, and the compile dependency's stable state digest.
    pub async fn done_config(
        &self,
        tsc_state: Option<&BuildInfo>,
        hash_cache: &FileHashCache,
    ) -> Result<BTreeMap<String, String>, Error> {
        let mut config = BTreeMap::new();
        config.insert("toolVersion".to_owned(), self.tool_version.clone());
        for file in &self.config_files {
            let path = absolute_in(&self.package_dir, file);
            match hash_cache.file_hash(&path).await {
                Ok(digest) => {
                    config.insert(format!("config:{file}"), digest);
                }
                Err(sail_hash::Error::FileNotFound(_)) => {}
                Err(err) => return Err(err.into()),
            }
        }
        if let Some(info) = tsc_state {
            config.insert(
                "tscState".to_owned(),
                sail_hash::hash_str(&TscTask::stable_state_summary(info)),
            );
        }
        Ok(config)
    }
}

fn absolute_in(package_dir: &Utf8Path, file: &Utf8Path) -> Utf8PathBuf {
    if file.is_absolute() {
        file.to_owned()
    } else {
        package_dir.join(file)
    }
}
