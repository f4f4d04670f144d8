//! Leaf task runtime.
//!
//! Everything a single leaf needs at execution time: command parsing,
//! process spawning with the package-local bin dir on `PATH`, done-file
//! fingerprints for local incremental checks, the TypeScript incremental
//! state reader, and the optional worker pool.

pub mod command;
mod donefile;
mod exec;
mod fingerprint;
mod leaf;
pub mod lint;
pub mod tsc;
mod worker;

use camino::Utf8PathBuf;
pub use donefile::{DoneFile, DoneFilePayload, DONE_FILE_SUFFIX};
pub use exec::{run_command, ExecOutcome};
pub use fingerprint::{fingerprint_files, FileFingerprint};
pub use leaf::LeafRuntime;
use sail_errors::{Classify, ErrorContext, ErrorKind};
use thiserror::Error;
pub use worker::WorkerPool;

/// Directory under each package holding sail's build artifacts.
pub const ARTIFACT_DIR: &str = ".sail";

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read {path}: {source}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid glob `{pattern}`: {source}")]
    BadGlob {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },
    #[error(transparent)]
    Hash(#[from] sail_hash::Error),
}

impl Classify for Error {
    fn classify(&self) -> ErrorKind {
        match self {
            Error::Spawn { .. } => ErrorKind::Execution,
            Error::BadGlob { .. } => ErrorKind::Config,
            Error::Io { .. } | Error::Parse { .. } | Error::Hash(_) => ErrorKind::Io,
        }
    }

    fn context(&self) -> ErrorContext {
        match self {
            Error::Io { path, .. } | Error::Parse { path, .. } => {
                ErrorContext::paths([path.as_str()])
            }
            _ => ErrorContext::default(),
        }
    }
}

/// Terminal status of a leaf task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    /// Executed and exited zero; no cache write happened.
    Success,
    /// Executed, exited zero, and the outputs were stored in the shared
    /// cache.
    SuccessWithCacheWrite,
    /// Served from the shared cache; outputs restored, nothing executed.
    CachedSuccess,
    /// The done-file matched byte-for-byte; nothing executed.
    LocalCacheHit,
    /// A state-based incremental check (file stats, tsc build info) passed;
    /// nothing executed.
    UpToDate,
    Failed,
    /// Never started: a dependency failed or the run was cancelled.
    Skipped,
}

impl TaskStatus {
    pub fn is_success(&self) -> bool {
        !matches!(self, TaskStatus::Failed | TaskStatus::Skipped)
    }

    /// Whether the task's outputs exist without it having executed this run.
    pub fn is_from_cache(&self) -> bool {
        matches!(
            self,
            TaskStatus::CachedSuccess | TaskStatus::LocalCacheHit | TaskStatus::UpToDate
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            TaskStatus::Success => "success",
            TaskStatus::SuccessWithCacheWrite => "success (cached for later)",
            TaskStatus::CachedSuccess => "cached",
            TaskStatus::LocalCacheHit => "local cache hit",
            TaskStatus::UpToDate => "up to date",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}
