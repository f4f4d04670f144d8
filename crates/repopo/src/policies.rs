//! The built-in policy set.
//!
//! Exercises both handler flavors: `newline-at-eof` and
//! `json-well-formed` are direct, `package-name-matches-dir` is
//! cooperative.

use std::sync::Arc;

use regex::Regex;

use crate::{
    Handler, Policy, PolicyError, PolicyFailure, PolicyInstance, PolicyOutcome, Resolver,
};

/// Text files must end with a newline. Auto-fixable.
pub fn newline_at_eof() -> Policy {
    Policy {
        name: "newline-at-eof".into(),
        description: "text files end with a single trailing newline".into(),
        match_pattern: Regex::new(r"\.(md|ts|tsx|js|jsx|json|rs)$").expect("static regex"),
        handler: Handler::Direct(Arc::new(|ctx| {
            let contents = std::fs::read(&ctx.file).map_err(|source| PolicyError::Io {
                path: ctx.file.clone(),
                source,
            })?;
            if contents.is_empty() || contents.ends_with(b"\n") {
                Ok(PolicyOutcome::Passed)
            } else {
                Ok(PolicyOutcome::Failure(
                    PolicyFailure::new("newline-at-eof", &ctx.repo_relative)
                        .with_message("file does not end with a newline")
                        .auto_fixable(),
                ))
            }
        })),
        resolver: Some(Resolver::Direct(Arc::new(|ctx| {
            let mut contents = std::fs::read(&ctx.file).map_err(|source| PolicyError::Io {
                path: ctx.file.clone(),
                source,
            })?;
            if !contents.ends_with(b"\n") {
                contents.push(b'\n');
                std::fs::write(&ctx.file, contents).map_err(|source| PolicyError::Io {
                    path: ctx.file.clone(),
                    source,
                })?;
            }
            Ok(true)
        }))),
        default_config: None,
    }
}

/// JSON files must parse. Not auto-fixable; points at the parse error.
pub fn json_well_formed() -> Policy {
    Policy {
        name: "json-well-formed".into(),
        description: "JSON files parse".into(),
        match_pattern: Regex::new(r"\.json$").expect("static regex"),
        handler: Handler::Direct(Arc::new(|ctx| {
            let contents =
                std::fs::read_to_string(&ctx.file).map_err(|source| PolicyError::Io {
                    path: ctx.file.clone(),
                    source,
                })?;
            match serde_json::from_str::<serde_json::Value>(&contents) {
                Ok(_) => Ok(PolicyOutcome::Passed),
                Err(err) => Ok(PolicyOutcome::Failure(
                    PolicyFailure::new("json-well-formed", &ctx.repo_relative)
                        .with_message(format!("invalid JSON: {err}"))
                        .with_manual_fix("fix the syntax error reported by the parser"),
                )),
            }
        })),
        resolver: None,
        default_config: None,
    }
}

/// A package manifest's `name` must match its directory (scoped names
/// compare their last segment). The root manifest is exempt.
pub fn package_name_matches_dir() -> Policy {
    Policy {
        name: "package-name-matches-dir".into(),
        description: "package.json name matches the directory holding it".into(),
        match_pattern: Regex::new(r"(^|/)package\.json$").expect("static regex"),
        handler: Handler::Cooperative(Arc::new(|ctx, token| {
            Box::pin(async move {
                if token.is_cancelled() {
                    return Err(PolicyError::Cancelled);
                }
                if ctx.repo_relative == "package.json" {
                    return Ok(PolicyOutcome::Passed);
                }
                let contents =
                    tokio::fs::read_to_string(&ctx.file)
                        .await
                        .map_err(|source| PolicyError::Io {
                            path: ctx.file.clone(),
                            source,
                        })?;
                let manifest: serde_json::Value =
                    serde_json::from_str(&contents).unwrap_or(serde_json::Value::Null);
                let Some(name) = manifest.get("name").and_then(|n| n.as_str()) else {
                    return Ok(PolicyOutcome::Failure(
                        PolicyFailure::new("package-name-matches-dir", &ctx.repo_relative)
                            .with_message("manifest has no name field"),
                    ));
                };
                let dir_name = ctx
                    .file
                    .parent()
                    .and_then(|p| p.file_name())
                    .unwrap_or_default();
                let unscoped = name.rsplit('/').next().unwrap_or(name);
                if unscoped == dir_name {
                    Ok(PolicyOutcome::Passed)
                } else {
                    Ok(PolicyOutcome::Failure(
                        PolicyFailure::new("package-name-matches-dir", &ctx.repo_relative)
                            .with_message(format!(
                                "package name `{name}` does not match directory `{dir_name}`"
                            ))
                            .with_manual_fix("rename the package or move it"),
                    ))
                }
            })
        })),
        resolver: None,
        default_config: None,
    }
}

/// The instances registered by default, in evaluation order.
pub fn default_instances() -> Vec<PolicyInstance> {
    vec![
        PolicyInstance::new(newline_at_eof()),
        PolicyInstance::new(json_well_formed()),
        PolicyInstance::new(package_name_matches_dir()),
    ]
}
