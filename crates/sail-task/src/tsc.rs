//! TypeScript compile leaves.
//!
//! A tsc leaf can prove itself up to date from the compiler's own
//! incremental state file instead of re-running. The state is trusted only
//! when the tool version matches, the canonicalized compiler options equal
//! those recorded, every recorded source version matches a freshly computed
//! one, the current source set equals the recorded set, and no pending emit
//! or semantic errors are recorded.

use std::collections::{BTreeMap, BTreeSet};

use camino::{Utf8Path, Utf8PathBuf};
use sail_hash::{ContentHasher, FileHashCache};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::{leaf::expand_globs, Error};

pub const DEFAULT_CONFIG: &str = "tsconfig.json";

/// Option keys holding paths; normalized before comparison.
const PATH_OPTIONS: &[&str] = &[
    "outDir",
    "rootDir",
    "declarationDir",
    "baseUrl",
    "tsBuildInfoFile",
];

/// Source globs making up the current file set.
const SOURCE_GLOBS: &[&str] = &["src/**/*.ts", "src/**/*.tsx"];

/// Stable per-file source version: content hash behind the
/// [`ContentHasher`] seam so the strategy can evolve without touching
/// callers.
pub struct SourceVersionHasher;

impl ContentHasher for SourceVersionHasher {
    fn name(&self) -> &'static str {
        "tsc-source-version"
    }

    fn hash(&self, content: &str) -> String {
        sail_hash::hash_str(content)
    }
}

/// The package's current TypeScript source files.
pub fn source_files(package_dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>, Error> {
    expand_globs(
        package_dir,
        &SOURCE_GLOBS
            .iter()
            .map(|glob| glob.to_string())
            .collect::<Vec<_>>(),
    )
}

/// The effective config file of a tsc command line: the `-p`/`--project`
/// argument (a directory implies its `tsconfig.json`), defaulting to
/// `tsconfig.json`.
pub fn config_path_from_command(command: &str) -> Utf8PathBuf {
    let tokens: Vec<&str> = command.split_whitespace().collect();
    let project = tokens
        .iter()
        .position(|token| *token == "-p" || *token == "--project")
        .and_then(|i| tokens.get(i + 1))
        .copied();
    match project {
        None | Some(".") => Utf8PathBuf::from(DEFAULT_CONFIG),
        Some(arg) if arg.ends_with(".json") => Utf8PathBuf::from(arg),
        Some(dir) => Utf8PathBuf::from(dir).join(DEFAULT_CONFIG),
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TsConfig {
    #[serde(default)]
    pub compiler_options: BTreeMap<String, Value>,
}

/// A recorded source file version; newer compilers record an object.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FileInfo {
    Version(String),
    Detailed {
        version: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
}

impl FileInfo {
    pub fn version(&self) -> &str {
        match self {
            FileInfo::Version(version) => version,
            FileInfo::Detailed { version, .. } => version,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgramState {
    #[serde(default)]
    pub file_names: Vec<String>,
    #[serde(default)]
    pub file_infos: Vec<FileInfo>,
    #[serde(default)]
    pub options: BTreeMap<String, Value>,
    /// Clean files appear as bare ids; entries carrying diagnostics are
    /// arrays.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semantic_diagnostics_per_file: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affected_files_pending_emit: Option<Vec<Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildInfo {
    pub version: String,
    pub program: ProgramState,
}

impl BuildInfo {
    pub fn has_semantic_errors(&self) -> bool {
        self.program
            .semantic_diagnostics_per_file
            .as_ref()
            .is_some_and(|entries| entries.iter().any(Value::is_array))
    }

    pub fn has_pending_emit(&self) -> bool {
        self.program
            .affected_files_pending_emit
            .as_ref()
            .is_some_and(|entries| !entries.is_empty())
    }
}

/// One tsc invocation bound to its package.
#[derive(Debug, Clone)]
pub struct TscTask {
    package_dir: Utf8PathBuf,
    command: String,
}

impl TscTask {
    pub fn new(package_dir: Utf8PathBuf, command: impl Into<String>) -> Self {
        Self {
            package_dir,
            command: command.into(),
        }
    }

    pub fn config_path(&self) -> Utf8PathBuf {
        self.package_dir
            .join(config_path_from_command(&self.command))
    }

    pub async fn load_config(&self) -> Result<Option<TsConfig>, Error> {
        read_optional_json(&self.config_path()).await
    }

    /// Where the incremental state lives: the `tsBuildInfoFile` option, or
    /// `<config stem>.tsbuildinfo` beside the config.
    pub fn build_info_path(&self, options: &BTreeMap<String, Value>) -> Utf8PathBuf {
        if let Some(Value::String(path)) = options.get("tsBuildInfoFile") {
            return self.package_dir.join(path.trim_start_matches("./"));
        }
        let config = self.config_path();
        let stem = config.file_stem().unwrap_or("tsconfig");
        config.with_file_name(format!("{stem}.tsbuildinfo"))
    }

    pub async fn load_build_info(&self) -> Result<Option<BuildInfo>, Error> {
        let Some(config) = self.load_config().await? else {
            return Ok(None);
        };
        read_optional_json(&self.build_info_path(&config.compiler_options)).await
    }

    /// Whether the incremental state proves the compile is current.
    pub async fn is_up_to_date(
        &self,
        hash_cache: &FileHashCache,
        tool_version: &str,
    ) -> Result<bool, Error> {
        let Some(config) = self.load_config().await? else {
            return Ok(false);
        };
        let Some(info) =
            read_optional_json::<BuildInfo>(&self.build_info_path(&config.compiler_options))
                .await?
        else {
            return Ok(false);
        };

        if info.version != tool_version {
            debug!(target: "sail::task::uptodate", recorded = %info.version, current = %tool_version, "tsc version changed");
            return Ok(false);
        }
        if info.has_semantic_errors() || info.has_pending_emit() {
            return Ok(false);
        }

        let recorded_options = canonicalize_options(&info.program.options, &self.package_dir);
        let current_options = canonicalize_options(&config.compiler_options, &self.package_dir);
        if recorded_options != current_options {
            debug!(target: "sail::task::uptodate", "tsc compiler options changed");
            return Ok(false);
        }

        // The recorded source set must equal the current one exactly.
        let recorded: BTreeSet<String> = self.recorded_sources(&info).collect();
        let current: BTreeSet<String> = source_files(&self.package_dir)?
            .into_iter()
            .filter_map(|path| {
                path.strip_prefix(&self.package_dir)
                    .ok()
                    .map(|rel| rel.to_string())
            })
            .collect();
        if recorded != current {
            debug!(target: "sail::task::uptodate", "tsc source set changed");
            return Ok(false);
        }

        // Every recorded version must match a freshly computed one.
        for (name, file_info) in info.program.file_names.iter().zip(&info.program.file_infos) {
            let Some(relative) = in_package_source(name) else {
                continue;
            };
            let fresh = hash_cache
                .file_hash_with(&self.package_dir.join(relative), &SourceVersionHasher)
                .await;
            match fresh {
                Ok(version) if version == file_info.version() => {}
                _ => {
                    debug!(target: "sail::task::uptodate", file = %name, "tsc source version changed");
                    return Ok(false);
                }
            }
        }

        Ok(true)
    }

    /// The summary exposed to dependents: tool version, source names,
    /// per-file versions and options only. Ephemeral diagnostics never leak
    /// into dependents' cache keys.
    pub fn stable_state_summary(info: &BuildInfo) -> String {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct StableState<'a> {
            version: &'a str,
            file_versions: BTreeMap<&'a str, &'a str>,
            options: &'a BTreeMap<String, Value>,
        }

        let file_versions = info
            .program
            .file_names
            .iter()
            .zip(&info.program.file_infos)
            .map(|(name, file_info)| (name.as_str(), file_info.version()))
            .collect();
        serde_json::to_string(&StableState {
            version: &info.version,
            file_versions,
            options: &info.program.options,
        })
        .expect("stable state serializes")
    }

    /// The output set implied by the compiler options: `.js`/`.jsx` per the
    /// `jsx` mode, `.d.ts` under `declaration`, `.d.ts.map` under
    /// `declarationMap`, `.js.map` under `sourceMap`, plus the incremental
    /// state file under `incremental`.
    pub fn output_files(
        &self,
        options: &BTreeMap<String, Value>,
        file_names: &[String],
    ) -> Vec<Utf8PathBuf> {
        let out_dir = match options.get("outDir") {
            Some(Value::String(dir)) => dir.trim_start_matches("./").to_owned(),
            _ => String::new(),
        };
        let flag = |key: &str| matches!(options.get(key), Some(Value::Bool(true)));
        let preserve_jsx =
            matches!(options.get("jsx"), Some(Value::String(mode)) if mode == "preserve");

        let mut outputs = Vec::new();
        for name in file_names {
            let Some(relative) = in_package_source(name) else {
                continue;
            };
            let stem = relative
                .strip_prefix("src/")
                .unwrap_or(relative)
                .trim_end_matches(".tsx")
                .trim_end_matches(".ts");
            let is_tsx = relative.ends_with(".tsx");
            let base = if out_dir.is_empty() {
                self.package_dir.join(stem)
            } else {
                self.package_dir.join(&out_dir).join(stem)
            };

            // Extensions are appended, never substituted: `a.test.ts` maps
            // to `a.test.js`.
            let js_ext = if is_tsx && preserve_jsx { "jsx" } else { "js" };
            outputs.push(Utf8PathBuf::from(format!("{base}.{js_ext}")));
            if flag("sourceMap") {
                outputs.push(Utf8PathBuf::from(format!("{base}.{js_ext}.map")));
            }
            if flag("declaration") {
                outputs.push(Utf8PathBuf::from(format!("{base}.d.ts")));
                if flag("declarationMap") {
                    outputs.push(Utf8PathBuf::from(format!("{base}.d.ts.map")));
                }
            }
        }
        if flag("incremental") {
            outputs.push(self.build_info_path(options));
        }
        outputs.sort();
        outputs
    }

    fn recorded_sources<'a>(&self, info: &'a BuildInfo) -> impl Iterator<Item = String> + 'a {
        info.program
            .file_names
            .iter()
            .filter_map(|name| in_package_source(name).map(str::to_owned))
    }
}

/// Queries the installed compiler's version (`tsc --version` prints
/// `Version X.Y.Z`). `None` when the tool is unavailable.
pub async fn query_tool_version(package_dir: &Utf8Path) -> Option<String> {
    let outcome = crate::exec::run_command("tsc --version", package_dir)
        .await
        .ok()?;
    if !outcome.success() {
        return None;
    }
    outcome
        .stdout
        .split_whitespace()
        .last()
        .map(str::to_owned)
}

/// Project sources are recorded package-relative; library files from
/// elsewhere are ignored for versioning.
fn in_package_source(name: &str) -> Option<&str> {
    let trimmed = name.trim_start_matches("./");
    (trimmed.starts_with("src/") && !trimmed.contains("node_modules"))
        .then_some(trimmed)
}

fn canonicalize_options(
    options: &BTreeMap<String, Value>,
    package_dir: &Utf8Path,
) -> BTreeMap<String, Value> {
    options
        .iter()
        .map(|(key, value)| {
            let value = if PATH_OPTIONS.contains(&key.as_str()) {
                match value {
                    Value::String(path) => {
                        let trimmed = path
                            .strip_prefix(package_dir.as_str())
                            .map(|rest| rest.trim_start_matches('/'))
                            .unwrap_or(path)
                            .trim_start_matches("./");
                        Value::String(trimmed.to_owned())
                    }
                    other => other.clone(),
                }
            } else {
                value.clone()
            };
            (key.clone(), value)
        })
        .collect()
}

async fn read_optional_json<T: serde::de::DeserializeOwned>(
    path: &Utf8Path,
) -> Result<Option<T>, Error> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(Error::Io {
                path: path.to_owned(),
                source,
            })
        }
    };
    serde_json::from_str(&contents)
        .map(Some)
        .map_err(|source| Error::Parse {
            path: path.to_owned(),
            source,
        })
}

#[cfg(test)]
mod test {
    use anyhow::Result;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    use super::*;

    const TOOL_VERSION: &str = "5.4.5";

    fn utf8(path: &std::path::Path) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(path.to_owned()).unwrap()
    }

    fn write(dir: &Utf8Path, rel: &str, contents: &str) {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    #[test_case("tsc", "tsconfig.json" ; "default_config")]
    #[test_case("tsc -p .", "tsconfig.json" ; "dot_project")]
    #[test_case("tsc --project tsconfig.esm.json", "tsconfig.esm.json" ; "explicit_file")]
    #[test_case("tsc -p config", "config/tsconfig.json" ; "project_directory")]
    fn test_config_path_from_command(command: &str, expected: &str) {
        assert_eq!(config_path_from_command(command), Utf8PathBuf::from(expected));
    }

    /// Writes a package whose build info agrees with the on-disk sources.
    async fn fresh_state(base: &Utf8Path) -> Result<TscTask> {
        write(base, "src/index.ts", "export const x = 1;");
        write(
            base,
            "tsconfig.json",
            r#"{ "compilerOptions": { "outDir": "./dist", "declaration": true, "incremental": true } }"#,
        );

        let version = sail_hash::hash_str("export const x = 1;");
        let build_info = serde_json::json!({
            "version": TOOL_VERSION,
            "program": {
                "fileNames": ["./src/index.ts"],
                "fileInfos": [version],
                "options": { "outDir": "dist", "declaration": true, "incremental": true },
                "semanticDiagnosticsPerFile": [1]
            }
        });
        write(base, "tsconfig.tsbuildinfo", &build_info.to_string());
        Ok(TscTask::new(base.to_owned(), "tsc -p ."))
    }

    #[tokio::test]
    async fn test_trusted_state_is_up_to_date() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let base = utf8(dir.path());
        let task = fresh_state(&base).await?;
        assert!(task.is_up_to_date(&FileHashCache::new(), TOOL_VERSION).await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_source_edit_invalidates_state() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let base = utf8(dir.path());
        let task = fresh_state(&base).await?;
        write(&base, "src/index.ts", "export const x = 2;");
        assert!(!task.is_up_to_date(&FileHashCache::new(), TOOL_VERSION).await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_new_source_file_invalidates_state() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let base = utf8(dir.path());
        let task = fresh_state(&base).await?;
        write(&base, "src/extra.ts", "export {};");
        assert!(!task.is_up_to_date(&FileHashCache::new(), TOOL_VERSION).await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_tool_version_mismatch_invalidates_state() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let base = utf8(dir.path());
        let task = fresh_state(&base).await?;
        assert!(!task.is_up_to_date(&FileHashCache::new(), "5.5.0").await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_option_change_invalidates_state() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let base = utf8(dir.path());
        let task = fresh_state(&base).await?;
        write(
            &base,
            "tsconfig.json",
            r#"{ "compilerOptions": { "outDir": "./dist", "declaration": false, "incremental": true } }"#,
        );
        assert!(!task.is_up_to_date(&FileHashCache::new(), TOOL_VERSION).await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_semantic_errors_are_not_trusted() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let base = utf8(dir.path());
        let task = fresh_state(&base).await?;

        let mut info = task.load_build_info().await?.unwrap();
        info.program.semantic_diagnostics_per_file =
            Some(vec![serde_json::json!([1, [{ "messageText": "boom" }]])]);
        write(
            &base,
            "tsconfig.tsbuildinfo",
            &serde_json::to_string(&info)?,
        );
        assert!(!task.is_up_to_date(&FileHashCache::new(), TOOL_VERSION).await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_stable_summary_excludes_diagnostics() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let base = utf8(dir.path());
        let task = fresh_state(&base).await?;

        let mut info = task.load_build_info().await?.unwrap();
        let clean = TscTask::stable_state_summary(&info);
        info.program.semantic_diagnostics_per_file =
            Some(vec![serde_json::json!([1, [{ "messageText": "boom" }]])]);
        assert_eq!(clean, TscTask::stable_state_summary(&info));
        Ok(())
    }

    #[test]
    fn test_output_files_follow_options() {
        let task = TscTask::new(Utf8PathBuf::from("/repo/alpha"), "tsc -p .");
        let options: BTreeMap<String, Value> = serde_json::from_value(serde_json::json!({
            "outDir": "./dist",
            "declaration": true,
            "declarationMap": true,
            "sourceMap": true,
            "incremental": true
        }))
        .unwrap();
        let outputs = task.output_files(&options, &["./src/index.ts".to_owned()]);
        let expected: Vec<Utf8PathBuf> = [
            "/repo/alpha/dist/index.d.ts",
            "/repo/alpha/dist/index.d.ts.map",
            "/repo/alpha/dist/index.js",
            "/repo/alpha/dist/index.js.map",
            "/repo/alpha/tsconfig.tsbuildinfo",
        ]
        .iter()
        .map(Utf8PathBuf::from)
        .collect();
        assert_eq!(outputs, expected);
    }

    #[test]
    fn test_jsx_preserve_emits_jsx() {
        let task = TscTask::new(Utf8PathBuf::from("/repo/alpha"), "tsc -p .");
        let options: BTreeMap<String, Value> =
            serde_json::from_value(serde_json::json!({ "jsx": "preserve" })).unwrap();
        let outputs = task.output_files(&options, &["./src/view.tsx".to_owned()]);
        assert_eq!(outputs, vec![Utf8PathBuf::from("/repo/alpha/src/view.jsx")]);
    }
}
