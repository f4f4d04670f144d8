//! Error classification shared across the sail workspace.
//!
//! Every crate keeps its own `thiserror` enum; this crate provides the
//! common vocabulary used to turn those errors into exit codes, user
//! remediation hints and machine-readable context payloads.

mod classification;

pub use classification::{Classify, ErrorContext, ErrorKind};
