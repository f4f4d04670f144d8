//! Workspace and package discovery.
//!
//! Locates the build root, enumerates package manifests, resolves
//! inter-package dependencies and attributes packages to release groups.
//! Everything produced here is immutable for the rest of the build.

mod config;
mod discovery;
mod manifest;
mod package;

use camino::Utf8PathBuf;
use sail_errors::{Classify, ErrorContext, ErrorKind};
use thiserror::Error;

pub use config::{CacheConfig, FingerprintMode, SailConfig, TaskConfig, CONFIG_FILE_NAME};
pub use discovery::{BuildProject, ConfigurationSource};
pub use manifest::{InterdependencyRange, PackageManifest};
pub use package::Package;

/// Comma-separated globs excluded from discovery, in addition to the
/// configured `excludeGlobs`.
pub const IGNORE_FILES_ENV: &str = "SAIL_IGNORE_FILES";

#[derive(Debug, Error)]
pub enum Error {
    #[error("no build root found above {0}: expected {CONFIG_FILE_NAME} or a workspace manifest")]
    NoBuildRoot(Utf8PathBuf),
    #[error(
        "duplicate package name `{name}`: declared by both {first} and {second}"
    )]
    DuplicatePackageName {
        name: String,
        first: Utf8PathBuf,
        second: Utf8PathBuf,
    },
    #[error("invalid exclude glob `{pattern}`: {source}")]
    BadGlob {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("path is not valid UTF-8: {0}")]
    NonUtf8Path(std::path::PathBuf),
    #[error("error when walking fs: {0}")]
    WalkDir(#[from] walkdir::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Classify for Error {
    fn classify(&self) -> ErrorKind {
        match self {
            Error::NoBuildRoot(_)
            | Error::DuplicatePackageName { .. }
            | Error::BadGlob { .. }
            | Error::Parse { .. } => ErrorKind::Config,
            Error::NonUtf8Path(_) | Error::WalkDir(_) | Error::Io(_) => ErrorKind::Io,
        }
    }

    fn remediation(&self) -> Option<&'static str> {
        match self {
            Error::NoBuildRoot(_) => {
                Some("run inside a workspace, or add a sail.config.json at the repository root")
            }
            Error::DuplicatePackageName { .. } => {
                Some("rename one of the packages, or exclude its directory via excludeGlobs")
            }
            _ => None,
        }
    }

    fn context(&self) -> ErrorContext {
        match self {
            Error::DuplicatePackageName { name, first, second } => ErrorContext {
                package: Some(name.clone()),
                paths: vec![first.to_string(), second.to_string()],
                ..Default::default()
            },
            Error::Parse { path, .. } => ErrorContext::paths([path.as_str()]),
            _ => ErrorContext::default(),
        }
    }
}
