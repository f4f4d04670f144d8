//! Repopo: policy enforcement over a repository's tracked files.
//!
//! A policy is a named rule with a path regex, a handler, and optionally a
//! resolver that can fix violations in place. Handlers come in two flavors:
//! direct functions that return their result eagerly, and cooperative
//! futures the engine drives under a cancellation scope.

mod engine;
pub mod policies;
mod telemetry;

use std::sync::Arc;

use camino::Utf8PathBuf;
pub use engine::{git_ls_files, FileSource, Mode, PolicyEngine, PolicyRunReport};
use futures::future::BoxFuture;
use regex::Regex;
use sail_errors::{Classify, ErrorContext, ErrorKind};
pub use telemetry::{PolicyAction, PolicyTimings};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("failed to list repository files: {0}")]
    FileListing(String),
    #[error("failed to read {path}: {source}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("policy `{policy}` failed internally: {message}")]
    Handler { policy: String, message: String },
    #[error("policy run was cancelled")]
    Cancelled,
}

impl Classify for PolicyError {
    fn classify(&self) -> ErrorKind {
        match self {
            PolicyError::Io { .. } => ErrorKind::Io,
            PolicyError::FileListing(_) => ErrorKind::Io,
            PolicyError::Handler { .. } | PolicyError::Cancelled => ErrorKind::Internal,
        }
    }

    fn context(&self) -> ErrorContext {
        match self {
            PolicyError::Io { path, .. } => ErrorContext::paths([path.as_str()]),
            _ => ErrorContext::default(),
        }
    }
}

/// Everything a handler sees for one file.
#[derive(Debug, Clone)]
pub struct PolicyContext {
    /// Absolute path of the file under evaluation.
    pub file: Utf8PathBuf,
    /// Path relative to the repository root, as matched by policy regexes.
    pub repo_relative: String,
    pub root: Utf8PathBuf,
    /// Whether the engine is running in fix mode.
    pub resolve: bool,
    pub config: serde_json::Value,
}

/// A policy violation for one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyFailure {
    pub policy_name: String,
    pub file: String,
    pub messages: Vec<String>,
    pub auto_fixable: bool,
    pub manual_fix: Option<String>,
}

impl PolicyFailure {
    pub fn new(policy_name: impl Into<String>, file: impl Into<String>) -> Self {
        Self {
            policy_name: policy_name.into(),
            file: file.into(),
            messages: Vec::new(),
            auto_fixable: false,
            manual_fix: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.messages.push(message.into());
        self
    }

    pub fn auto_fixable(mut self) -> Self {
        self.auto_fixable = true;
        self
    }

    pub fn with_manual_fix(mut self, hint: impl Into<String>) -> Self {
        self.manual_fix = Some(hint.into());
        self
    }
}

/// The outcome of one fix attempt: the original failure plus whether the
/// re-check passed afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixResult {
    pub failure: PolicyFailure,
    pub resolved: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyOutcome {
    Passed,
    Failure(PolicyFailure),
}

pub type DirectHandler =
    Arc<dyn Fn(&PolicyContext) -> Result<PolicyOutcome, PolicyError> + Send + Sync>;
pub type CooperativeHandler = Arc<
    dyn Fn(PolicyContext, CancellationToken) -> BoxFuture<'static, Result<PolicyOutcome, PolicyError>>
        + Send
        + Sync,
>;
pub type DirectResolver = Arc<dyn Fn(&PolicyContext) -> Result<bool, PolicyError> + Send + Sync>;
pub type CooperativeResolver = Arc<
    dyn Fn(PolicyContext, CancellationToken) -> BoxFuture<'static, Result<bool, PolicyError>>
        + Send
        + Sync,
>;

/// The two handler shapes. The dispatcher selects per call; cooperative
/// handlers run under the engine's cancellation scope so cleanup and
/// cancellation propagate.
#[derive(Clone)]
pub enum Handler {
    Direct(DirectHandler),
    Cooperative(CooperativeHandler),
}

/// The auto-fix branch, in the same two shapes. Returns `true` when the
/// violation was repaired.
#[derive(Clone)]
pub enum Resolver {
    Direct(DirectResolver),
    Cooperative(CooperativeResolver),
}

/// A named rule evaluated per file.
pub struct Policy {
    pub name: String,
    pub description: String,
    pub match_pattern: Regex,
    pub handler: Handler,
    pub resolver: Option<Resolver>,
    pub default_config: Option<serde_json::Value>,
}

/// A policy bound to a concrete config and exclusion list, ready for
/// registration.
#[derive(Clone)]
pub struct PolicyInstance {
    policy: Arc<Policy>,
    config: Option<serde_json::Value>,
    exclude_files: Vec<Regex>,
}

impl PolicyInstance {
    pub fn new(policy: Policy) -> Self {
        Self {
            policy: Arc::new(policy),
            config: None,
            exclude_files: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_exclude_files(mut self, patterns: Vec<Regex>) -> Self {
        self.exclude_files = patterns;
        self
    }

    pub fn name(&self) -> &str {
        &self.policy.name
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Whether the policy's match regex accepts the path and no exclusion
    /// rejects it.
    pub fn applies_to(&self, repo_relative: &str) -> bool {
        self.policy.match_pattern.is_match(repo_relative)
            && !self.is_excluded(repo_relative)
    }

    pub fn is_excluded(&self, repo_relative: &str) -> bool {
        self.policy.match_pattern.is_match(repo_relative)
            && self
                .exclude_files
                .iter()
                .any(|pattern| pattern.is_match(repo_relative))
    }

    /// The per-instance config, falling back to the policy default.
    pub fn effective_config(&self) -> serde_json::Value {
        self.config
            .clone()
            .or_else(|| self.policy.default_config.clone())
            .unwrap_or(serde_json::Value::Null)
    }
}
