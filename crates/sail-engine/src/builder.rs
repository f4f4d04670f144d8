//! Graph construction from discovered packages and the config tasks table.
//!
//! For each selected package × task the builder creates a node and resolves
//! its `dependsOn` entries: `name` is a same-package dependency, `^name`
//! fans out across the package's workspace dependencies, and `pkg#name`
//! names a task in another package. Tasks missing from both the config and
//! the package's script table are absent; dependents skip them silently.

use std::collections::{HashSet, VecDeque};

use sail_task::command;
use sail_workspace::{BuildProject, Package, TaskConfig};
use tracing::debug;

use crate::{Built, Engine, Error, LeafSpec, TaskId, TaskName, TaskSpec};

pub struct GraphBuilder<'a> {
    project: &'a BuildProject,
    tasks: Vec<TaskName>,
    packages: Vec<String>,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(project: &'a BuildProject) -> Self {
        Self {
            project,
            tasks: Vec::new(),
            packages: Vec::new(),
        }
    }

    pub fn with_tasks<I: IntoIterator<Item = TaskName>>(mut self, tasks: I) -> Self {
        self.tasks = tasks.into_iter().collect();
        self
    }

    /// Restricts the graph to the named packages. Empty means every
    /// discovered package.
    pub fn with_packages(mut self, packages: Vec<String>) -> Self {
        self.packages = packages;
        self
    }

    pub fn build(self) -> Result<Engine<Built>, Error> {
        let scope: Vec<&Package> = if self.packages.is_empty() {
            self.project.packages().collect()
        } else {
            self.packages
                .iter()
                .map(|name| {
                    self.project
                        .package(name)
                        .ok_or_else(|| Error::PackageNotFound(name.clone()))
                })
                .collect::<Result<_, _>>()?
        };

        let mut traversal_queue = VecDeque::new();
        let mut missing_tasks: Vec<String> = Vec::new();
        for task in &self.tasks {
            let mut found = false;
            if let Some(explicit) = task.task_id() {
                let package = self
                    .project
                    .package(explicit.package())
                    .ok_or_else(|| Error::PackageNotFound(explicit.package().to_owned()))?;
                if self.resolve_spec(package, explicit.task()).is_some() {
                    traversal_queue.push_back(explicit);
                    found = true;
                }
            } else {
                for package in &scope {
                    if self.resolve_spec(package, task.task()).is_some() {
                        traversal_queue.push_back(TaskId::new(package.name(), task.task()));
                        found = true;
                    }
                }
            }
            if !found {
                missing_tasks.push(task.to_string());
            }
        }
        if !missing_tasks.is_empty() {
            missing_tasks.sort();
            return Err(Error::MissingTasks(missing_tasks));
        }

        let mut engine = Engine::new();
        let mut visited: HashSet<TaskId> = HashSet::new();

        while let Some(task_id) = traversal_queue.pop_front() {
            if !visited.insert(task_id.clone()) {
                continue;
            }
            let package = self
                .project
                .package(task_id.package())
                .ok_or_else(|| Error::PackageNotFound(task_id.package().to_owned()))?;
            let spec = self
                .resolve_spec(package, task_id.task())
                .expect("only resolvable tasks are enqueued");

            let to_index = engine.get_index(&task_id);
            let mut has_deps = false;

            let depends_on = self
                .project
                .config()
                .task(task_id.task())
                .map(|entry| entry.depends_on.clone())
                .unwrap_or_default();
            for dep in depends_on {
                let dep_name = TaskName::from(dep);
                if dep_name.is_topological() {
                    let plain = dep_name.strip_topological();
                    for dep_pkg_name in package.workspace_dependencies() {
                        let dep_pkg = self
                            .project
                            .package(dep_pkg_name)
                            .expect("workspace dependencies resolve to discovered packages");
                        if self.resolve_spec(dep_pkg, plain.task()).is_some() {
                            let from = TaskId::new(dep_pkg_name.as_str(), plain.task());
                            let from_index = engine.get_index(&from);
                            engine.add_dependency(to_index, from_index);
                            traversal_queue.push_back(from);
                            has_deps = true;
                        }
                    }
                } else if let Some(explicit) = dep_name.task_id() {
                    let dep_pkg = self
                        .project
                        .package(explicit.package())
                        .ok_or_else(|| Error::PackageNotFound(explicit.package().to_owned()))?;
                    if self.resolve_spec(dep_pkg, explicit.task()).is_some() {
                        let from_index = engine.get_index(&explicit);
                        engine.add_dependency(to_index, from_index);
                        traversal_queue.push_back(explicit);
                        has_deps = true;
                    }
                } else if self.resolve_spec(package, dep_name.task()).is_some() {
                    let from = TaskId::new(task_id.package(), dep_name.task());
                    let from_index = engine.get_index(&from);
                    engine.add_dependency(to_index, from_index);
                    traversal_queue.push_back(from);
                    has_deps = true;
                } else {
                    debug!(target: "sail::task", task = %task_id, dep = %dep_name, "dependency is absent, skipping");
                }
            }

            engine.add_spec(task_id.clone(), spec);
            if !has_deps {
                engine.connect_to_root(&task_id);
            }
        }

        engine.seal()
    }

    /// Resolves (package, task name) to a node payload, or `None` when the
    /// task does not exist for that package.
    fn resolve_spec(&self, package: &Package, task: &str) -> Option<TaskSpec> {
        let config = self.project.config();
        match config.task(task) {
            Some(entry) if !entry.script => Some(TaskSpec::Group),
            Some(entry) => package
                .script(task)
                .map(|cmd| TaskSpec::Leaf(self.leaf_spec(cmd, task, entry))),
            None => package
                .script(task)
                .map(|cmd| TaskSpec::Leaf(self.leaf_spec(cmd, task, &TaskConfig::default()))),
        }
    }

    fn leaf_spec(&self, cmd: &str, task: &str, entry: &TaskConfig) -> LeafSpec {
        let config = self.project.config();
        LeafSpec {
            command: cmd.to_owned(),
            executable: command::executable(cmd, &config.multi_command_executables),
            weight: config.task_weight(task),
            use_worker: entry.use_worker,
            can_use_cache: entry.cache,
        }
    }
}
