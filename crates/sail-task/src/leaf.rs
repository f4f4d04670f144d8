//! The per-leaf runtime driven by the task visitor.

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use glob::Pattern;
use sail_hash::FileHashCache;
use sail_workspace::{FingerprintMode, TaskConfig};
use tracing::debug;
use walkdir::WalkDir;

use crate::{
    donefile::{DoneFile, DoneFilePayload, DONE_FILE_VERSION},
    fingerprint::fingerprint_files,
    tsc, Error, ARTIFACT_DIR,
};

/// Glob applied when a task declares no inputs.
const DEFAULT_INPUT_GLOB: &str = "src/**/*";

/// One leaf task bound to its package directory, ready to be checked and
/// executed.
#[derive(Debug, Clone)]
pub struct LeafRuntime {
    package: String,
    task: String,
    package_dir: Utf8PathBuf,
    command: String,
    executable: String,
    input_globs: Vec<String>,
    output_globs: Vec<String>,
    fingerprint_mode: FingerprintMode,
    can_use_cache: bool,
    use_worker: bool,
}

impl LeafRuntime {
    pub fn new(
        package: impl Into<String>,
        task: impl Into<String>,
        package_dir: Utf8PathBuf,
        command: impl Into<String>,
        executable: impl Into<String>,
        config: &TaskConfig,
    ) -> Self {
        Self {
            package: package.into(),
            task: task.into(),
            package_dir,
            command: command.into(),
            executable: executable.into(),
            input_globs: config.inputs.clone(),
            output_globs: config.outputs.clone(),
            fingerprint_mode: config.fingerprint,
            can_use_cache: config.cache,
            use_worker: config.use_worker,
        }
    }

    pub fn package(&self) -> &str {
        &self.package
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn task_id_string(&self) -> String {
        format!("{}#{}", self.package, self.task)
    }

    pub fn package_dir(&self) -> &Utf8Path {
        &self.package_dir
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn executable(&self) -> &str {
        &self.executable
    }

    pub fn can_use_cache(&self) -> bool {
        self.can_use_cache
    }

    pub fn use_worker(&self) -> bool {
        self.use_worker
    }

    pub fn done_file(&self) -> DoneFile {
        DoneFile::new(
            &self.package_dir.join(ARTIFACT_DIR),
            &self.executable,
            &self.command,
        )
    }

    /// The files hashed into the cache key: declared input globs plus the
    /// well-known config files that exist. The done-file itself is never an
    /// input.
    pub fn cache_input_files(&self) -> Result<Vec<Utf8PathBuf>, Error> {
        let globs = if self.input_globs.is_empty() {
            vec![DEFAULT_INPUT_GLOB.to_owned()]
        } else {
            self.input_globs.clone()
        };
        let mut files = expand_globs(&self.package_dir, &globs)?;
        for candidate in self.config_file_candidates() {
            let path = self.package_dir.join(candidate);
            if path.is_file() {
                files.push(path);
            }
        }
        files.sort();
        files.dedup();
        Ok(files)
    }

    /// Declared output files currently on disk, plus the done-file. The
    /// done-file is an output so a cache restore rebuilds it.
    pub fn output_files(&self) -> Result<Vec<Utf8PathBuf>, Error> {
        let mut files = expand_globs(&self.package_dir, &self.output_globs)?;
        let done_path = self.done_file().path().to_owned();
        if done_path.is_file() {
            files.push(done_path);
        }
        files.sort();
        files.dedup();
        Ok(files)
    }

    /// Config files folded into the input set when present.
    fn config_file_candidates(&self) -> Vec<Utf8PathBuf> {
        let mut candidates = vec![Utf8PathBuf::from("package.json")];
        if self.executable.contains("tsc") {
            candidates.push(tsc::config_path_from_command(&self.command));
        }
        if self.executable.contains("eslint") {
            candidates.push(Utf8PathBuf::from(".eslintrc.json"));
            candidates.push(Utf8PathBuf::from(".eslintrc.cjs"));
            candidates.push(Utf8PathBuf::from("eslint.config.mjs"));
        }
        candidates
    }

    /// The done-file content for the current state of the inputs.
    /// `extra_config` carries tool versions and config digests;
    /// `dependencies` carries the done-file hashes of required leaves so a
    /// dependency's new outputs invalidate this task locally too.
    pub async fn donefile_content(
        &self,
        hash_cache: &FileHashCache,
        extra_config: BTreeMap<String, String>,
        dependencies: BTreeMap<String, String>,
    ) -> Result<String, Error> {
        let inputs = fingerprint_files(
            &self.package_dir,
            &self.cache_input_files()?,
            self.fingerprint_mode,
            hash_cache,
        )
        .await?;
        // Stat mode fingerprints declared outputs as well, so a deleted or
        // regenerated output invalidates the sentinel.
        let outputs = match self.fingerprint_mode {
            FingerprintMode::Stat => {
                let declared = expand_globs(&self.package_dir, &self.output_globs)?;
                fingerprint_files(
                    &self.package_dir,
                    &declared,
                    FingerprintMode::Stat,
                    hash_cache,
                )
                .await?
            }
            FingerprintMode::Hash => BTreeMap::new(),
        };
        Ok(DoneFilePayload {
            version: DONE_FILE_VERSION,
            task: self.task_id_string(),
            command: self.command.clone(),
            inputs,
            outputs,
            dependencies,
            config: extra_config,
        }
        .render())
    }

    /// The hash dependents embed in their cache keys. Changing outputs change
    /// the done-file content, which changes this hash, which invalidates
    /// every dependent's key.
    pub fn donefile_hash(content: &str) -> String {
        sail_hash::hash_str(content)
    }

    /// Local incremental check: recompute the expected done-file content and
    /// byte-compare. A failed check deletes the sentinel so an interrupted
    /// task always re-executes.
    pub async fn check_up_to_date(
        &self,
        hash_cache: &FileHashCache,
        extra_config: BTreeMap<String, String>,
        dependencies: BTreeMap<String, String>,
    ) -> Result<(bool, String), Error> {
        let expected = self
            .donefile_content(hash_cache, extra_config, dependencies)
            .await?;
        let done = self.done_file();
        if done.is_current(&expected).await {
            debug!(target: "sail::task::uptodate", task = %self.task_id_string(), "done-file matches");
            Ok((true, expected))
        } else {
            done.remove().await;
            Ok((false, expected))
        }
    }

    /// Writes the done-file after a successful execution.
    pub async fn mark_exec_done(&self, content: &str) -> Result<(), Error> {
        self.done_file().write(content).await
    }
}

/// Expands package-relative globs to absolute paths, always skipping
/// `node_modules`, `.git` and the artifact directory.
pub fn expand_globs(base: &Utf8Path, globs: &[String]) -> Result<Vec<Utf8PathBuf>, Error> {
    if globs.is_empty() {
        return Ok(Vec::new());
    }
    let patterns = globs
        .iter()
        .map(|raw| {
            Pattern::new(raw).map_err(|source| Error::BadGlob {
                pattern: raw.clone(),
                source,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut files = Vec::new();
    let walker = WalkDir::new(base).into_iter().filter_entry(|entry| {
        let name = entry.file_name().to_string_lossy();
        name != "node_modules" && name != ".git" && name != ARTIFACT_DIR
    });
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            // The base may not exist yet for tasks that have never run.
            Err(_) => continue,
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(path) = Utf8PathBuf::from_path_buf(entry.path().to_owned()) else {
            continue;
        };
        let relative = path.strip_prefix(base).unwrap_or(&path);
        if patterns
            .iter()
            .any(|pattern| pattern.matches_path(relative.as_std_path()))
        {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod test {
    use anyhow::Result;
    use pretty_assertions::assert_eq;

    use super::*;

    fn utf8(path: &std::path::Path) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(path.to_owned()).unwrap()
    }

    fn runtime(dir: &Utf8Path, config: &TaskConfig) -> LeafRuntime {
        LeafRuntime::new(
            "alpha",
            "compile",
            dir.to_owned(),
            "tsc -p .",
            "tsc",
            config,
        )
    }

    fn write(dir: &Utf8Path, rel: &str, contents: &str) {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    #[tokio::test]
    async fn test_inputs_default_to_src_plus_config_files() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let base = utf8(dir.path());
        write(&base, "src/index.ts", "export {};");
        write(&base, "package.json", r#"{ "name": "alpha" }"#);
        write(&base, "tsconfig.json", "{}");
        write(&base, "README.md", "not an input");

        let leaf = runtime(&base, &TaskConfig::default());
        let inputs = leaf.cache_input_files()?;
        let relative: Vec<String> = inputs
            .iter()
            .map(|p| p.strip_prefix(&base).unwrap().to_string())
            .collect();
        assert_eq!(relative, vec!["package.json", "src/index.ts", "tsconfig.json"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_up_to_date_after_mark_exec_done() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let base = utf8(dir.path());
        write(&base, "src/index.ts", "export {};");

        let leaf = runtime(&base, &TaskConfig::default());
        let hash_cache = FileHashCache::new();

        let (fresh, content) = leaf
            .check_up_to_date(&hash_cache, BTreeMap::new(), BTreeMap::new())
            .await?;
        assert!(!fresh);

        leaf.mark_exec_done(&content).await?;
        let (current, _) = leaf
            .check_up_to_date(&hash_cache, BTreeMap::new(), BTreeMap::new())
            .await?;
        assert!(current);
        Ok(())
    }

    #[tokio::test]
    async fn test_input_change_invalidates_and_deletes_sentinel() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let base = utf8(dir.path());
        write(&base, "src/index.ts", "export {};");

        let leaf = runtime(&base, &TaskConfig::default());
        let content = leaf
            .donefile_content(&FileHashCache::new(), BTreeMap::new(), BTreeMap::new())
            .await?;
        leaf.mark_exec_done(&content).await?;

        write(&base, "src/index.ts", "export const changed = 1;");
        // A fresh hash cache: the build that observes the change is a new run.
        let (current, _) = leaf
            .check_up_to_date(&FileHashCache::new(), BTreeMap::new(), BTreeMap::new())
            .await?;
        assert!(!current);
        assert_eq!(leaf.done_file().read().await, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_dependency_fingerprints_change_content() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let base = utf8(dir.path());
        write(&base, "src/index.ts", "export {};");

        let leaf = runtime(&base, &TaskConfig::default());
        let hash_cache = FileHashCache::new();
        let before = leaf
            .donefile_content(
                &hash_cache,
                BTreeMap::new(),
                BTreeMap::from([("lib#compile".to_owned(), "aa".to_owned())]),
            )
            .await?;
        let after = leaf
            .donefile_content(
                &hash_cache,
                BTreeMap::new(),
                BTreeMap::from([("lib#compile".to_owned(), "bb".to_owned())]),
            )
            .await?;
        assert_ne!(
            LeafRuntime::donefile_hash(&before),
            LeafRuntime::donefile_hash(&after)
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_donefile_hash_tracks_outputs_in_stat_mode() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let base = utf8(dir.path());
        write(&base, "src/index.ts", "export {};");
        write(&base, "dist/index.js", "module.exports = {};");

        let config = TaskConfig {
            outputs: vec!["dist/**/*".to_owned()],
            fingerprint: FingerprintMode::Stat,
            ..Default::default()
        };
        let leaf = runtime(&base, &config);

        let before = leaf
            .donefile_content(&FileHashCache::new(), BTreeMap::new(), BTreeMap::new())
            .await?;
        write(&base, "dist/index.js", "module.exports = { changed: true };");
        let after = leaf
            .donefile_content(&FileHashCache::new(), BTreeMap::new(), BTreeMap::new())
            .await?;
        assert_ne!(
            LeafRuntime::donefile_hash(&before),
            LeafRuntime::donefile_hash(&after)
        );
        Ok(())
    }

    #[test]
    fn test_output_files_include_done_file_once_written() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let base = utf8(dir.path());
        write(&base, "dist/index.js", "x");

        let config = TaskConfig {
            outputs: vec!["dist/**/*".to_owned()],
            ..Default::default()
        };
        let leaf = runtime(&base, &config);
        let outputs = leaf.output_files()?;
        assert_eq!(outputs.len(), 1);

        std::fs::create_dir_all(base.join(ARTIFACT_DIR))?;
        std::fs::write(leaf.done_file().path(), "{}")?;
        let outputs = leaf.output_files()?;
        assert_eq!(outputs.len(), 2);
        assert!(outputs.iter().any(|p| p == leaf.done_file().path()));
        Ok(())
    }
}
