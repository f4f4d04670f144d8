//! Done-file sentinels.
//!
//! A done-file is written after a task succeeds; its content is a canonical
//! string derived from the task's input fingerprints and relevant
//! configuration. Presence plus byte-equality with the recomputed content
//! means the task is up to date. Done-files are task *outputs*: they belong
//! in the cache manifest so a restore rebuilds them, and they are never part
//! of the task's own input hash list.

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use sail_hash::command_digest;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{command::executable_basename, fingerprint::FileFingerprint, Error};

pub const DONE_FILE_SUFFIX: &str = ".done.build.log";

/// The canonical content of a done-file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DoneFilePayload {
    pub version: u32,
    pub task: String,
    pub command: String,
    pub inputs: BTreeMap<String, FileFingerprint>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub outputs: BTreeMap<String, FileFingerprint>,
    /// Output fingerprints of the leaves this task requires. A dependency's
    /// new outputs change this content, which changes this task's own
    /// fingerprint, which invalidates its dependents in turn.
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub dependencies: BTreeMap<String, String>,
    /// Tool versions, config file digests, incremental-state summaries.
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub config: BTreeMap<String, String>,
}

pub const DONE_FILE_VERSION: u32 = 1;

impl DoneFilePayload {
    /// The canonical string written to disk and compared byte-for-byte.
    pub fn render(&self) -> String {
        serde_json::to_string(self).expect("done-file payload serializes")
    }
}

/// A task's done-file on disk, named
/// `<executable-basename>-<8-hex-sha>.done.build.log` where the hex is a
/// SHA-256 prefix of the command string.
#[derive(Debug, Clone)]
pub struct DoneFile {
    path: Utf8PathBuf,
}

impl DoneFile {
    pub fn new(artifact_dir: &Utf8Path, executable: &str, command: &str) -> Self {
        let name = format!(
            "{}-{}{}",
            executable_basename(executable),
            command_digest(command),
            DONE_FILE_SUFFIX
        );
        Self {
            path: artifact_dir.join(name),
        }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// The recorded content, or `None` when missing or unreadable. A read
    /// failure is treated as stale, never as an error.
    pub async fn read(&self) -> Option<String> {
        tokio::fs::read_to_string(&self.path).await.ok()
    }

    /// Whether the recorded content equals `expected` byte-for-byte.
    pub async fn is_current(&self, expected: &str) -> bool {
        match self.read().await {
            Some(actual) => actual == expected,
            None => false,
        }
    }

    /// Writes the content via temp-then-rename, creating parent directories.
    pub async fn write(&self, content: &str) -> Result<(), Error> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| Error::Io {
                    path: parent.to_owned(),
                    source,
                })?;
        }
        let temp = self.path.with_extension(format!("tmp.{}", std::process::id()));
        tokio::fs::write(&temp, content)
            .await
            .map_err(|source| Error::Io {
                path: temp.clone(),
                source,
            })?;
        tokio::fs::rename(&temp, &self.path)
            .await
            .map_err(|source| Error::Io {
                path: self.path.clone(),
                source,
            })?;
        Ok(())
    }

    /// Deletes the sentinel so an interrupted task re-executes.
    pub async fn remove(&self) {
        if tokio::fs::remove_file(&self.path).await.is_ok() {
            debug!(target: "sail::task::uptodate", path = %self.path, "stale done-file removed");
        }
    }
}
