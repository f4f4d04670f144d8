//! Run orchestration: discovery, graph construction, scheduling and the
//! final summary.

mod visitor;

use std::{collections::BTreeMap, sync::Arc, time::Instant};

use camino::{Utf8Path, Utf8PathBuf};
use sail_cache::{CacheOptions, SharedCache};
use sail_engine::{render_dot, ExecutionOptions, GraphBuilder, TaskName};
use sail_task::TaskStatus;
use sail_workspace::BuildProject;
use tokio::sync::mpsc;
use tracing::{debug, warn};
pub use visitor::{TaskReport, Visitor};

use crate::Error;

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub tasks: Vec<String>,
    pub packages: Vec<String>,
    pub cache_dir: Option<Utf8PathBuf>,
    pub skip_cache_write: bool,
    pub no_cache: bool,
    /// 0 means one slot per available core.
    pub concurrency: usize,
    pub verbose: bool,
    pub bail: bool,
    pub graph_file: Option<Utf8PathBuf>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            tasks: Vec::new(),
            packages: Vec::new(),
            cache_dir: None,
            skip_cache_write: false,
            no_cache: false,
            concurrency: 0,
            verbose: false,
            bail: false,
            graph_file: None,
        }
    }
}

/// The terminal statuses of one run, keyed by task id.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub statuses: BTreeMap<String, TaskStatus>,
    pub wall_time_ms: u64,
    pub time_saved_ms: u64,
}

impl RunSummary {
    pub fn count(&self, status: TaskStatus) -> usize {
        self.statuses.values().filter(|s| **s == status).count()
    }

    pub fn failed(&self) -> usize {
        self.count(TaskStatus::Failed)
    }

    pub fn is_success(&self) -> bool {
        self.failed() == 0
    }

    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            0
        } else {
            1
        }
    }

    pub fn status(&self, task_id: &str) -> Option<TaskStatus> {
        self.statuses.get(task_id).copied()
    }

    /// `"3 succeeded, 1 cached, 1 failed (5 total)"`.
    pub fn describe(&self) -> String {
        let executed = self.count(TaskStatus::Success) + self.count(TaskStatus::SuccessWithCacheWrite);
        let cached = self.count(TaskStatus::CachedSuccess)
            + self.count(TaskStatus::LocalCacheHit)
            + self.count(TaskStatus::UpToDate);
        let mut parts = vec![format!("{executed} succeeded"), format!("{cached} cached")];
        if self.failed() > 0 {
            parts.push(format!("{} failed", self.failed()));
        }
        if self.count(TaskStatus::Skipped) > 0 {
            parts.push(format!("{} skipped", self.count(TaskStatus::Skipped)));
        }
        format!("{} ({} total)", parts.join(", "), self.statuses.len())
    }
}

pub struct Run {
    project: Arc<BuildProject>,
    options: RunOptions,
}

impl Run {
    pub fn new(search_path: &Utf8Path, options: RunOptions) -> Result<Self, Error> {
        let project = BuildProject::discover(search_path)?;
        Ok(Self {
            project: Arc::new(project),
            options,
        })
    }

    pub fn project(&self) -> &BuildProject {
        &self.project
    }

    pub async fn run(&self) -> Result<RunSummary, Error> {
        let started = Instant::now();
        let engine = Arc::new(
            GraphBuilder::new(&self.project)
                .with_tasks(self.options.tasks.iter().map(|t| TaskName::from(t.as_str())))
                .with_packages(self.options.packages.clone())
                .build()?,
        );

        if let Some(graph_file) = &self.options.graph_file {
            let mut out = Vec::new();
            render_dot(&engine, &mut out).map_err(|source| Error::Io {
                path: graph_file.clone(),
                source,
            })?;
            std::fs::write(graph_file, out).map_err(|source| Error::Io {
                path: graph_file.clone(),
                source,
            })?;
        }

        let cache = self.open_cache();
        let concurrency = if self.options.concurrency == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        } else {
            self.options.concurrency
        };
        // CPU-bound worker slots are a separate, smaller pool.
        let worker_count = concurrency.div_ceil(2);

        let visitor = Visitor::new(
            self.project.clone(),
            engine.clone(),
            cache.clone(),
            worker_count,
            self.options.verbose,
            self.options.bail,
        );

        let (message_tx, message_rx) = mpsc::channel(concurrency);
        let engine_handle = tokio::spawn(
            engine
                .clone()
                .execute(ExecutionOptions::new(concurrency), message_tx),
        );
        visitor.visit(message_rx).await;
        engine_handle
            .await
            .map_err(|err| Error::Internal(format!("scheduler panicked: {err}")))??;

        let reports = visitor.into_reports();
        let mut statuses: BTreeMap<String, TaskStatus> = reports
            .iter()
            .map(|(task_id, report)| (task_id.clone(), report.status))
            .collect();
        // Anything the scheduler never handed to the visitor was skipped by
        // cancellation.
        for task_id in engine.task_ids() {
            statuses
                .entry(task_id.to_string())
                .or_insert(TaskStatus::Skipped);
        }

        let time_saved_ms = cache
            .as_ref()
            .map(|cache| cache.stats().time_saved_ms)
            .unwrap_or(0);
        Ok(RunSummary {
            statuses,
            wall_time_ms: started.elapsed().as_millis() as u64,
            time_saved_ms,
        })
    }

    /// Opens the shared cache, or disables caching when the root is
    /// unusable (e.g. an incompatible on-disk version).
    fn open_cache(&self) -> Option<Arc<SharedCache>> {
        if self.options.no_cache {
            return None;
        }
        let dir = self.resolve_cache_dir();
        debug!(target: "sail::cache", %dir, "using cache directory");
        let mut cache_options =
            CacheOptions::new(dir).with_skip_cache_write(self.options.skip_cache_write);
        if let Some(max) = self.project.config().cache.max_size_bytes {
            cache_options = cache_options.with_max_size(max);
        }
        match SharedCache::new(cache_options) {
            Ok(cache) => Some(Arc::new(cache)),
            Err(err) => {
                warn!(target: "sail::cache", %err, "cache disabled for this run");
                None
            }
        }
    }

    fn resolve_cache_dir(&self) -> Utf8PathBuf {
        if let Some(dir) = &self.options.cache_dir {
            return dir.clone();
        }
        if let Ok(dir) = std::env::var(crate::CACHE_DIR_ENV) {
            if !dir.is_empty() {
                return Utf8PathBuf::from(dir);
            }
        }
        if let Some(dir) = &self.project.config().cache.dir {
            let dir = Utf8PathBuf::from(dir);
            return if dir.is_absolute() {
                dir
            } else {
                self.project.root().join(dir)
            };
        }
        dirs::cache_dir()
            .and_then(|dir| Utf8PathBuf::from_path_buf(dir).ok())
            .map(|dir| dir.join("sail"))
            .unwrap_or_else(|| self.project.root().join(".sail-cache"))
    }
}
