//! Sail: the incremental build orchestrator.
//!
//! Discovers packages in a workspace, assembles a task graph across
//! packages, and drives it to completion with bounded parallelism,
//! per-task done-files and a shared content-addressed cache.

pub mod cli;
pub mod commands;
pub mod run;

use camino::Utf8PathBuf;
use sail_errors::{Classify, ErrorContext, ErrorKind};
use thiserror::Error;

/// Overrides the default cache directory (`~/.cache/sail`).
pub const CACHE_DIR_ENV: &str = "SAIL_CACHE_DIR";

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Workspace(#[from] sail_workspace::Error),
    #[error(transparent)]
    Engine(#[from] sail_engine::Error),
    #[error(transparent)]
    Execute(#[from] sail_engine::ExecuteError),
    #[error(transparent)]
    Task(#[from] sail_task::Error),
    #[error(transparent)]
    Cache(#[from] sail_cache::CacheError),
    #[error(transparent)]
    Hash(#[from] sail_hash::Error),
    #[error(transparent)]
    Policy(#[from] repopo::PolicyError),
    #[error("failed to write {path}: {source}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("internal error: {0}")]
    Internal(String),
}

impl Classify for Error {
    fn classify(&self) -> ErrorKind {
        match self {
            Error::Workspace(err) => err.classify(),
            Error::Engine(err) => err.classify(),
            Error::Task(err) => err.classify(),
            Error::Cache(err) => err.classify(),
            Error::Policy(err) => err.classify(),
            Error::Execute(_) | Error::Internal(_) => ErrorKind::Internal,
            Error::Hash(_) | Error::Io { .. } => ErrorKind::Io,
        }
    }

    fn remediation(&self) -> Option<&'static str> {
        match self {
            Error::Workspace(err) => err.remediation(),
            Error::Engine(err) => err.remediation(),
            Error::Cache(err) => err.remediation(),
            _ => None,
        }
    }

    fn context(&self) -> ErrorContext {
        match self {
            Error::Workspace(err) => err.context(),
            Error::Engine(err) => err.context(),
            Error::Task(err) => err.context(),
            Error::Cache(err) => err.context(),
            Error::Policy(err) => err.context(),
            Error::Io { path, .. } => ErrorContext::paths([path.as_str()]),
            _ => ErrorContext::default(),
        }
    }
}
