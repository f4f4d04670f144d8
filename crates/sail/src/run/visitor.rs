//! Drives each scheduled task through its lifecycle: dependency-failure
//! short-circuit, shared-cache lookup, local incremental check, execution,
//! done-file write and cache store.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
};

use camino::{Utf8Path, Utf8PathBuf};
use futures::{stream::FuturesUnordered, StreamExt};
use sail_cache::{ExecMetadata, SharedCache};
use sail_engine::{Built, Engine, LeafSpec, Message, StopExecution, TaskId, TaskSpec};
use sail_hash::{CacheKeyInputs, DependencyHash, FileHashCache, GlobalKeyComponents, InputHash};
use sail_task::{
    lint::LintTask,
    run_command,
    tsc::{self, TscTask},
    LeafRuntime, TaskStatus, WorkerPool,
};
use sail_workspace::BuildProject;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::Error;

/// The recorded outcome of one task.
#[derive(Debug, Clone)]
pub struct TaskReport {
    pub status: TaskStatus,
    /// Hash of the task's done-file content; what dependents embed in their
    /// cache keys (cascading invalidation).
    pub donefile_hash: Option<String>,
    pub stdout: String,
    pub stderr: String,
    pub execution_time_ms: u64,
}

impl TaskReport {
    fn terminal(status: TaskStatus) -> Self {
        Self {
            status,
            donefile_hash: None,
            stdout: String::new(),
            stderr: String::new(),
            execution_time_ms: 0,
        }
    }
}

pub struct Visitor {
    state: Arc<VisitorState>,
}

struct VisitorState {
    project: Arc<BuildProject>,
    engine: Arc<Engine<Built>>,
    cache: Option<Arc<SharedCache>>,
    hash_cache: FileHashCache,
    worker_pool: WorkerPool,
    results: Mutex<HashMap<TaskId, TaskReport>>,
    tool_versions: tokio::sync::Mutex<HashMap<(Utf8PathBuf, String), Option<String>>>,
    verbose: bool,
    bail: bool,
}

impl Visitor {
    pub fn new(
        project: Arc<BuildProject>,
        engine: Arc<Engine<Built>>,
        cache: Option<Arc<SharedCache>>,
        worker_count: usize,
        verbose: bool,
        bail: bool,
    ) -> Self {
        Self {
            state: Arc::new(VisitorState {
                project,
                engine,
                cache,
                hash_cache: FileHashCache::new(),
                worker_pool: WorkerPool::new(worker_count),
                results: Mutex::new(HashMap::new()),
                tool_versions: tokio::sync::Mutex::new(HashMap::new()),
                verbose,
                bail,
            }),
        }
    }

    /// Consumes scheduler messages until the engine closes the channel,
    /// processing tasks concurrently (the engine bounds how many are in
    /// flight).
    pub async fn visit(&self, mut messages: mpsc::Receiver<Message>) {
        let mut inflight = FuturesUnordered::new();
        loop {
            tokio::select! {
                message = messages.recv() => match message {
                    Some(Message { task_id, callback }) => {
                        let state = self.state.clone();
                        inflight.push(tokio::spawn(state.handle(task_id, callback)));
                    }
                    None => break,
                },
                Some(joined) = inflight.next() => {
                    if let Err(err) = joined {
                        error!("task handler panicked: {err}");
                    }
                }
            }
        }
        while let Some(joined) = inflight.next().await {
            if let Err(err) = joined {
                error!("task handler panicked: {err}");
            }
        }
    }

    /// The recorded statuses, keyed by task id string.
    pub fn into_reports(self) -> BTreeMap<String, TaskReport> {
        let state = Arc::try_unwrap(self.state)
            .unwrap_or_else(|state| panic!("visitor still shared by {} tasks", Arc::strong_count(&state)));
        state
            .results
            .into_inner()
            .expect("results mutex is never poisoned")
            .into_iter()
            .map(|(task_id, report)| (task_id.to_string(), report))
            .collect()
    }
}

impl VisitorState {
    async fn handle(
        self: Arc<Self>,
        task_id: TaskId,
        callback: oneshot::Sender<Result<(), StopExecution>>,
    ) {
        let report = match self.process(&task_id).await {
            Ok(report) => report,
            Err(err) => {
                error!(task = %task_id, %err, "task errored");
                let mut report = TaskReport::terminal(TaskStatus::Failed);
                report.stderr = err.to_string();
                report
            }
        };
        let stop = self.bail && report.status == TaskStatus::Failed;

        self.emit_status(&task_id, &report);
        // Record before answering: the callback unblocks dependents, and
        // they read this result.
        self.results
            .lock()
            .expect("results mutex is never poisoned")
            .insert(task_id, report);
        callback
            .send(if stop { Err(StopExecution) } else { Ok(()) })
            .ok();
    }

    async fn process(&self, task_id: &TaskId) -> Result<TaskReport, Error> {
        let spec = self
            .engine
            .task_spec(task_id)
            .cloned()
            .ok_or_else(|| Error::Internal(format!("no spec for scheduled task {task_id}")))?;

        if let Some(failed) = self.failed_dependency(task_id) {
            let mut report = TaskReport::terminal(TaskStatus::Failed);
            report.stderr = format!("dependency {failed} failed");
            return Ok(report);
        }

        match spec {
            TaskSpec::Group => Ok(TaskReport::terminal(TaskStatus::Success)),
            TaskSpec::Leaf(leaf) => self.process_leaf(task_id, &leaf).await,
        }
    }

    /// A direct dependency that did not succeed, if any. Dependencies are
    /// guaranteed to have terminal results before this task is dispatched;
    /// a missing result means the dependency was skipped.
    fn failed_dependency(&self, task_id: &TaskId) -> Option<TaskId> {
        let results = self
            .results
            .lock()
            .expect("results mutex is never poisoned");
        for dependency in self.engine.dependencies(task_id) {
            match results.get(dependency) {
                Some(report) if report.status.is_success() => {}
                _ => return Some(dependency.clone()),
            }
        }
        None
    }

    async fn process_leaf(
        &self,
        task_id: &TaskId,
        spec: &LeafSpec,
    ) -> Result<TaskReport, Error> {
        let package = self
            .project
            .package(task_id.package())
            .ok_or_else(|| Error::Internal(format!("unknown package {}", task_id.package())))?;
        let entry_config = self
            .project
            .config()
            .task(task_id.task())
            .cloned()
            .unwrap_or_default();
        let runtime = LeafRuntime::new(
            task_id.package(),
            task_id.task(),
            package.directory().to_owned(),
            &spec.command,
            &spec.executable,
            &entry_config,
        );

        let extra = self.donefile_extra(&runtime).await?;
        // The output fingerprints of finished dependencies feed both the
        // cache key and the done-file content; collecting them is only
        // possible here, after the dependents completed.
        let dependency_hashes = self.dependency_hashes(task_id);
        let dep_map: BTreeMap<String, String> = dependency_hashes
            .iter()
            .map(|dep| (dep.task.clone(), dep.hash.clone()))
            .collect();
        let key_inputs = if runtime.can_use_cache() && self.cache.is_some() {
            Some(
                self.cache_key_inputs(&runtime, spec, task_id, dependency_hashes)
                    .await?,
            )
        } else {
            None
        };

        // Shared cache first.
        if let (Some(cache), Some(key_inputs)) = (self.cache.as_deref(), key_inputs.as_ref()) {
            if let Some(report) = self
                .try_cache_restore(cache, key_inputs, &runtime, &extra, &dep_map)
                .await?
            {
                return Ok(report);
            }
        }

        // Local incremental checks.
        let (donefile_current, expected_content) = runtime
            .check_up_to_date(&self.hash_cache, extra.clone(), dep_map.clone())
            .await?;
        if donefile_current {
            return Ok(TaskReport {
                status: TaskStatus::LocalCacheHit,
                donefile_hash: Some(LeafRuntime::donefile_hash(&expected_content)),
                stdout: String::new(),
                stderr: String::new(),
                execution_time_ms: 0,
            });
        }
        if runtime.executable().contains("tsc") {
            if let Some(version) = self.tool_version(&runtime).await {
                let task = TscTask::new(runtime.package_dir().to_owned(), runtime.command());
                if task
                    .is_up_to_date(&self.hash_cache, &version)
                    .await
                    .unwrap_or(false)
                {
                    // Rewrite the sentinel so the next run takes the cheap
                    // byte-compare path.
                    runtime.mark_exec_done(&expected_content).await?;
                    return Ok(TaskReport {
                        status: TaskStatus::UpToDate,
                        donefile_hash: Some(LeafRuntime::donefile_hash(&expected_content)),
                        stdout: String::new(),
                        stderr: String::new(),
                        execution_time_ms: 0,
                    });
                }
            }
        }

        // Execute.
        debug!(target: "sail::task", task = %task_id, command = %runtime.command(), "executing");
        if !sail_task::command::executable_resolves(runtime.executable(), runtime.package_dir()) {
            debug!(
                target: "sail::task",
                task = %task_id,
                executable = %runtime.executable(),
                "executable not found on PATH, spawn may fail"
            );
        }
        let outcome = if runtime.use_worker() {
            self.worker_pool
                .run(runtime.command(), runtime.package_dir())
                .await?
        } else {
            run_command(runtime.command(), runtime.package_dir()).await?
        };
        if !outcome.success() {
            return Ok(TaskReport {
                status: TaskStatus::Failed,
                donefile_hash: None,
                stdout: outcome.stdout,
                stderr: outcome.stderr,
                execution_time_ms: outcome.duration_ms,
            });
        }

        // Post-execute: write the done-file, then try to store the outputs.
        let content = runtime
            .donefile_content(&self.hash_cache, extra, dep_map)
            .await?;
        runtime.mark_exec_done(&content).await?;

        let mut status = TaskStatus::Success;
        if let (Some(cache), Some(key_inputs)) = (self.cache.as_deref(), key_inputs.as_ref()) {
            let outputs = self.collect_outputs(&runtime).await?;
            let stored = cache.store(
                key_inputs,
                &outputs,
                runtime.package_dir(),
                ExecMetadata {
                    stdout: outcome.stdout.clone(),
                    stderr: outcome.stderr.clone(),
                    exit_code: outcome.exit_code,
                    execution_time_ms: outcome.duration_ms,
                },
            );
            match stored {
                Ok(store) if store.success => status = TaskStatus::SuccessWithCacheWrite,
                Ok(store) => {
                    debug!(target: "sail::cache", task = %task_id, reason = ?store.reason, "store skipped")
                }
                Err(err) => warn!(target: "sail::cache", task = %task_id, %err, "cache store failed"),
            }
        }

        Ok(TaskReport {
            status,
            donefile_hash: Some(LeafRuntime::donefile_hash(&content)),
            stdout: outcome.stdout,
            stderr: outcome.stderr,
            execution_time_ms: outcome.duration_ms,
        })
    }

    /// Returns the restored report on a usable hit. Corrupt entries and
    /// failed restores degrade to a miss.
    async fn try_cache_restore(
        &self,
        cache: &SharedCache,
        key_inputs: &CacheKeyInputs,
        runtime: &LeafRuntime,
        extra: &BTreeMap<String, String>,
        dep_map: &BTreeMap<String, String>,
    ) -> Result<Option<TaskReport>, Error> {
        let entry = match cache.lookup(key_inputs) {
            Ok(Some(entry)) => entry,
            Ok(None) => return Ok(None),
            Err(err) => {
                warn!(target: "sail::cache", %err, "lookup failed, treating as a miss");
                return Ok(None);
            }
        };
        match cache.restore(&entry, runtime.package_dir()) {
            Ok(restore) if restore.success => {
                let content = runtime
                    .donefile_content(&self.hash_cache, extra.clone(), dep_map.clone())
                    .await?;
                Ok(Some(TaskReport {
                    status: TaskStatus::CachedSuccess,
                    donefile_hash: Some(LeafRuntime::donefile_hash(&content)),
                    stdout: restore.stdout,
                    stderr: restore.stderr,
                    execution_time_ms: 0,
                }))
            }
            Ok(_) => {
                warn!(target: "sail::cache", task = %runtime.task_id_string(), "restore failed, continuing as a miss");
                Ok(None)
            }
            Err(err) => {
                warn!(target: "sail::cache", %err, "restore errored, continuing as a miss");
                Ok(None)
            }
        }
    }

    async fn cache_key_inputs(
        &self,
        runtime: &LeafRuntime,
        spec: &LeafSpec,
        task_id: &TaskId,
        dependency_hashes: Vec<DependencyHash>,
    ) -> Result<CacheKeyInputs, Error> {
        let mut input_hashes = Vec::new();
        for file in runtime.cache_input_files()? {
            match self.hash_cache.file_hash(&file).await {
                Ok(hash) => {
                    let path = file
                        .strip_prefix(runtime.package_dir())
                        .map(|p| p.to_string())
                        .unwrap_or_else(|_| file.to_string());
                    input_hashes.push(InputHash { path, hash });
                }
                // Listed but already gone: absence simply leaves the key.
                Err(sail_hash::Error::FileNotFound(_)) => continue,
                Err(err) => return Err(err.into()),
            }
        }

        Ok(CacheKeyInputs {
            package: task_id.package().to_owned(),
            task: task_id.task().to_owned(),
            executable: spec.executable.clone(),
            command: spec.command.clone(),
            input_hashes,
            dependency_hashes: (!dependency_hashes.is_empty()).then_some(dependency_hashes),
            global: Some(GlobalKeyComponents {
                tool_version: crate::VERSION.to_owned(),
                platform: std::env::consts::OS.to_owned(),
                env_markers: BTreeMap::new(),
            }),
        })
    }

    /// The output fingerprints of every leaf this task transitively
    /// requires, read from their freshly recorded done-file hashes.
    fn dependency_hashes(&self, task_id: &TaskId) -> Vec<DependencyHash> {
        let Some(relations) = self.engine.relations(task_id) else {
            return Vec::new();
        };
        let results = self
            .results
            .lock()
            .expect("results mutex is never poisoned");
        relations
            .dependent_leaves
            .iter()
            .filter_map(|dependency| {
                let hash = results.get(dependency)?.donefile_hash.clone()?;
                Some(DependencyHash {
                    task: dependency.to_string(),
                    hash,
                })
            })
            .collect()
    }

    /// Tool-specific done-file configuration: compiler versions, lint
    /// config digests and dependency state summaries.
    async fn donefile_extra(
        &self,
        runtime: &LeafRuntime,
    ) -> Result<BTreeMap<String, String>, Error> {
        let mut extra = BTreeMap::new();
        if runtime.executable().contains("tsc") {
            if let Some(version) = self.tool_version(runtime).await {
                extra.insert("toolVersion".to_owned(), version);
            }
        } else if runtime.executable().contains("eslint") {
            let version = self
                .tool_version(runtime)
                .await
                .unwrap_or_else(|| "unknown".to_owned());
            let lint = LintTask::new(
                runtime.package_dir().to_owned(),
                vec![
                    Utf8PathBuf::from(".eslintrc.json"),
                    Utf8PathBuf::from(".eslintrc.cjs"),
                    Utf8PathBuf::from("eslint.config.mjs"),
                ],
                version,
            );
            let tsc_state = TscTask::new(runtime.package_dir().to_owned(), "tsc -p .")
                .load_build_info()
                .await
                .unwrap_or(None);
            extra.extend(lint.done_config(tsc_state.as_ref(), &self.hash_cache).await?);
        }
        Ok(extra)
    }

    /// `<executable> --version`, memoized per (package, executable) so a
    /// package-local install wins.
    async fn tool_version(&self, runtime: &LeafRuntime) -> Option<String> {
        let first_token = runtime
            .executable()
            .split(' ')
            .next()
            .unwrap_or_default()
            .to_owned();
        let key = (runtime.package_dir().to_owned(), first_token.clone());
        let mut versions = self.tool_versions.lock().await;
        if let Some(version) = versions.get(&key) {
            return version.clone();
        }
        let version = if first_token == "tsc" {
            tsc::query_tool_version(runtime.package_dir()).await
        } else {
            query_generic_version(&first_token, runtime.package_dir()).await
        };
        versions.insert(key, version.clone());
        version
    }

    async fn collect_outputs(&self, runtime: &LeafRuntime) -> Result<Vec<Utf8PathBuf>, Error> {
        let mut outputs = runtime.output_files()?;
        if runtime.executable().contains("tsc") {
            let task = TscTask::new(runtime.package_dir().to_owned(), runtime.command());
            if let Some(config) = task.load_config().await? {
                let sources: Vec<String> = sources_for(runtime.package_dir())?;
                outputs.extend(
                    task.output_files(&config.compiler_options, &sources)
                        .into_iter()
                        .filter(|path| path.is_file()),
                );
            }
        }
        outputs.sort();
        outputs.dedup();
        Ok(outputs)
    }

    fn emit_status(&self, task_id: &TaskId, report: &TaskReport) {
        // One complete line per leaf; output is buffered until the task has
        // a terminal status, so lines never interleave.
        println!("{task_id}: {}", report.status);
        match report.status {
            TaskStatus::Failed => {
                if !report.stderr.is_empty() {
                    eprint!("{}", ensure_trailing_newline(&report.stderr));
                }
            }
            _ if self.verbose => {
                if !report.stdout.is_empty() {
                    print!("{}", ensure_trailing_newline(&report.stdout));
                }
            }
            _ => {}
        }
    }
}

async fn query_generic_version(executable: &str, package_dir: &Utf8Path) -> Option<String> {
    let outcome = run_command(&format!("{executable} --version"), package_dir)
        .await
        .ok()?;
    if !outcome.success() {
        return None;
    }
    outcome
        .stdout
        .split_whitespace()
        .last()
        .map(|v| v.trim_start_matches('v').to_owned())
}

fn sources_for(package_dir: &Utf8Path) -> Result<Vec<String>, Error> {
    Ok(tsc::source_files(package_dir)?
        .into_iter()
        .filter_map(|path| {
            path.strip_prefix(package_dir)
                .ok()
                .map(|rel| rel.to_string())
        })
        .collect())
}

fn ensure_trailing_newline(text: &str) -> String {
    if text.ends_with('\n') {
        text.to_owned()
    } else {
        format!("{text}\n")
    }
}
