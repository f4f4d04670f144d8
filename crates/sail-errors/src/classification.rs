//! Error classification for consistent error handling across sail.
//!
//! Classification decides the process exit code, whether an operation is
//! worth retrying, and what guidance the user sees alongside the failure.

use std::fmt;

use serde::Serialize;

/// Classification of errors by their nature.
///
/// Each variant represents a broad category of error that requires a
/// different handling strategy at the CLI surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad configuration: invalid config files, duplicate package names,
    /// missing required fields.
    Config,

    /// Task graph problems: cyclic dependencies, references to packages or
    /// tasks that do not exist.
    Dependency,

    /// A spawned command exited non-zero or could not be spawned.
    Execution,

    /// Shared cache problems: corrupt entries, on-disk version mismatch.
    Cache,

    /// Filesystem failures outside the cache.
    Io,

    /// File content violates a repository policy.
    Policy,

    /// Internal logic errors or bugs.
    Internal,
}

impl ErrorKind {
    /// Returns the process exit code for this kind.
    ///
    /// `0` success, `1` policy/build failures, `2` configuration error,
    /// `3` internal error.
    pub fn exit_code(&self) -> i32 {
        match self {
            ErrorKind::Config => 2,
            ErrorKind::Dependency => 2,
            ErrorKind::Execution => 1,
            ErrorKind::Cache => 1,
            ErrorKind::Io => 1,
            ErrorKind::Policy => 1,
            ErrorKind::Internal => 3,
        }
    }

    /// Whether the failed operation may succeed on retry without user
    /// intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Cache | ErrorKind::Io)
    }

    /// Whether this kind indicates a user mistake rather than a tool bug.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            ErrorKind::Config | ErrorKind::Dependency | ErrorKind::Policy
        )
    }

    pub fn category_name(&self) -> &'static str {
        match self {
            ErrorKind::Config => "Configuration",
            ErrorKind::Dependency => "Dependency",
            ErrorKind::Execution => "Execution",
            ErrorKind::Cache => "Cache",
            ErrorKind::Io => "IO",
            ErrorKind::Policy => "Policy",
            ErrorKind::Internal => "Internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.category_name())
    }
}

/// Structured context attached to a classified error for machine
/// consumption: paths, package names, task identifiers.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ErrorContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub paths: Vec<String>,
}

impl ErrorContext {
    pub fn package(name: impl Into<String>) -> Self {
        Self {
            package: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn task(package: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            package: Some(package.into()),
            task: Some(task.into()),
            ..Default::default()
        }
    }

    pub fn paths<I: IntoIterator<Item = S>, S: Into<String>>(paths: I) -> Self {
        Self {
            paths: paths.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }
}

/// Trait for error types that can be classified.
pub trait Classify {
    /// Returns the classification for this error.
    fn classify(&self) -> ErrorKind;

    /// An optional one-line hint telling the user how to fix the problem.
    fn remediation(&self) -> Option<&'static str> {
        None
    }

    /// Structured payload for machine consumption.
    fn context(&self) -> ErrorContext {
        ErrorContext::default()
    }
}
