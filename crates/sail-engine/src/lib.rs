//! The sail build graph.
//!
//! Composes packages and their tasks into a DAG, computes the leaf relations
//! that drive scheduling weights and cascading invalidation, and executes the
//! graph with bounded concurrency.

mod builder;
mod execute;
mod graph_visualizer;
mod task_id;

use std::{
    collections::{BTreeSet, HashMap},
    fmt,
};

pub use builder::GraphBuilder;
pub use execute::{ExecuteError, ExecutionOptions, Message, StopExecution};
pub use graph_visualizer::render_dot;
use petgraph::graph::{Graph, NodeIndex};
use sail_errors::{Classify, ErrorContext, ErrorKind};
pub use task_id::{TaskId, TaskName, TASK_DELIMITER, TOPOLOGICAL_PREFIX};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(
        "circular task dependency in package {package}: {}",
        .chain.join(" -> ")
    )]
    CircularTaskDependency { package: String, chain: Vec<String> },
    #[error("package not found: {0}")]
    PackageNotFound(String),
    #[error("no package defines the requested task(s): {}", .0.join(", "))]
    MissingTasks(Vec<String>),
    #[error(transparent)]
    Graph(#[from] sail_graph_utils::Error),
}

impl Classify for Error {
    fn classify(&self) -> ErrorKind {
        match self {
            Error::CircularTaskDependency { .. } | Error::Graph(_) => ErrorKind::Dependency,
            Error::PackageNotFound(_) | Error::MissingTasks(_) => ErrorKind::Config,
        }
    }

    fn remediation(&self) -> Option<&'static str> {
        match self {
            Error::CircularTaskDependency { .. } => {
                Some("break the cycle by removing one of the dependsOn entries")
            }
            Error::MissingTasks(_) => {
                Some("declare the task in the config tasks table or add a matching package script")
            }
            _ => None,
        }
    }

    fn context(&self) -> ErrorContext {
        match self {
            Error::CircularTaskDependency { package, chain } => ErrorContext {
                package: Some(package.clone()),
                paths: chain.clone(),
                ..Default::default()
            },
            Error::PackageNotFound(package) => ErrorContext::package(package.clone()),
            _ => ErrorContext::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskNode {
    Root,
    Task(TaskId),
}

impl fmt::Display for TaskNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskNode::Root => f.write_str("___ROOT___"),
            TaskNode::Task(task) => task.fmt(f),
        }
    }
}

/// A leaf task: one executable command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafSpec {
    pub command: String,
    /// First token of the command, or a declared multi-command executable.
    pub executable: String,
    /// Intrinsic scheduling weight; expensive compilers are configured
    /// heavier.
    pub weight: u32,
    pub use_worker: bool,
    pub can_use_cache: bool,
}

/// A node's payload: a concrete command, or a purely structural aggregator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskSpec {
    Leaf(LeafSpec),
    Group,
}

impl TaskSpec {
    pub fn is_leaf(&self) -> bool {
        matches!(self, TaskSpec::Leaf(_))
    }

    pub fn leaf(&self) -> Option<&LeafSpec> {
        match self {
            TaskSpec::Leaf(leaf) => Some(leaf),
            TaskSpec::Group => None,
        }
    }
}

/// Relations computed for each leaf once the graph is sealed.
#[derive(Debug, Clone, Default)]
pub struct LeafRelations {
    /// Transitive set of leaves this task requires.
    pub dependent_leaves: BTreeSet<TaskId>,
    /// Leaves that transitively require this leaf.
    pub parent_leaves: BTreeSet<TaskId>,
    /// Scheduling weight: intrinsic weight plus the intrinsic weights of all
    /// parent leaves, so long critical paths schedule earlier.
    pub weight: u64,
}

#[derive(Debug, Default)]
pub struct Building;
#[derive(Debug, Default)]
pub struct Built;

/// The task DAG. Edges point from a task to the tasks it depends on.
#[derive(Debug)]
pub struct Engine<S = Built> {
    marker: std::marker::PhantomData<S>,
    task_graph: Graph<TaskNode, ()>,
    root_index: NodeIndex,
    task_lookup: HashMap<TaskId, NodeIndex>,
    task_specs: HashMap<TaskId, TaskSpec>,
    leaf_relations: HashMap<TaskId, LeafRelations>,
}

impl Engine<Building> {
    pub fn new() -> Self {
        let mut task_graph = Graph::default();
        let root_index = task_graph.add_node(TaskNode::Root);
        Self {
            marker: std::marker::PhantomData,
            task_graph,
            root_index,
            task_lookup: HashMap::default(),
            task_specs: HashMap::default(),
            leaf_relations: HashMap::default(),
        }
    }

    pub fn get_index(&mut self, task_id: &TaskId) -> NodeIndex {
        self.task_lookup.get(task_id).copied().unwrap_or_else(|| {
            let index = self.task_graph.add_node(TaskNode::Task(task_id.clone()));
            self.task_lookup.insert(task_id.clone(), index);
            index
        })
    }

    pub fn add_dependency(&mut self, from: NodeIndex, to: NodeIndex) {
        self.task_graph.update_edge(from, to, ());
    }

    pub fn connect_to_root(&mut self, task_id: &TaskId) {
        let source = self.get_index(task_id);
        self.task_graph.add_edge(source, self.root_index, ());
    }

    pub fn add_spec(&mut self, task_id: TaskId, spec: TaskSpec) -> Option<TaskSpec> {
        self.task_specs.insert(task_id, spec)
    }

    /// Seals the graph: rejects cycles and computes the per-leaf relations
    /// used for weights and cascading invalidation.
    pub fn seal(mut self) -> Result<Engine<Built>, Error> {
        self.compute_leaf_relations()?;
        sail_graph_utils::validate_graph(&self.task_graph)?;
        let Engine {
            task_graph,
            root_index,
            task_lookup,
            task_specs,
            leaf_relations,
            ..
        } = self;
        Ok(Engine {
            marker: std::marker::PhantomData,
            task_graph,
            root_index,
            task_lookup,
            task_specs,
            leaf_relations,
        })
    }

    /// Walks each node's dependencies collecting the transitive leaf set. An
    /// in-progress sentinel detects re-entry and reports the offending chain.
    fn compute_leaf_relations(&mut self) -> Result<(), Error> {
        #[derive(Clone, Copy, PartialEq)]
        enum VisitState {
            InProgress,
            Done,
        }

        fn collect(
            engine: &Engine<Building>,
            index: NodeIndex,
            states: &mut HashMap<NodeIndex, VisitState>,
            memo: &mut HashMap<NodeIndex, BTreeSet<TaskId>>,
            chain: &mut Vec<TaskId>,
        ) -> Result<BTreeSet<TaskId>, Error> {
            if let Some(cached) = memo.get(&index) {
                return Ok(cached.clone());
            }
            let task_id = match &engine.task_graph[index] {
                TaskNode::Root => return Ok(BTreeSet::new()),
                TaskNode::Task(id) => id.clone(),
            };
            if states.get(&index) == Some(&VisitState::InProgress) {
                let mut cycle: Vec<String> =
                    chain.iter().map(ToString::to_string).collect();
                cycle.push(task_id.to_string());
                return Err(Error::CircularTaskDependency {
                    package: chain
                        .first()
                        .map(|id| id.package().to_owned())
                        .unwrap_or_else(|| task_id.package().to_owned()),
                    chain: cycle,
                });
            }
            states.insert(index, VisitState::InProgress);
            chain.push(task_id.clone());

            let mut leaves = BTreeSet::new();
            let dependencies: Vec<NodeIndex> = engine
                .task_graph
                .neighbors_directed(index, petgraph::Direction::Outgoing)
                .collect();
            for dep in dependencies {
                leaves.extend(collect(engine, dep, states, memo, chain)?);
                if let TaskNode::Task(dep_id) = &engine.task_graph[dep] {
                    if engine
                        .task_specs
                        .get(dep_id)
                        .is_some_and(TaskSpec::is_leaf)
                    {
                        leaves.insert(dep_id.clone());
                    }
                }
            }

            chain.pop();
            states.insert(index, VisitState::Done);
            memo.insert(index, leaves.clone());
            Ok(leaves)
        }

        let mut states = HashMap::new();
        let mut memo = HashMap::new();
        let indices: Vec<(TaskId, NodeIndex)> = self
            .task_lookup
            .iter()
            .map(|(id, index)| (id.clone(), *index))
            .collect();

        let mut relations: HashMap<TaskId, LeafRelations> = HashMap::new();
        for (task_id, index) in &indices {
            let mut chain = Vec::new();
            let dependent_leaves =
                collect(self, *index, &mut states, &mut memo, &mut chain)?;
            relations.insert(
                task_id.clone(),
                LeafRelations {
                    dependent_leaves,
                    ..Default::default()
                },
            );
        }

        // Invert: if D is in L's transitive leaf set, L is one of D's parents.
        let leaf_ids: Vec<TaskId> = self
            .task_specs
            .iter()
            .filter(|(_, spec)| spec.is_leaf())
            .map(|(id, _)| id.clone())
            .collect();
        for parent in &leaf_ids {
            let dependents = relations
                .get(parent)
                .map(|r| r.dependent_leaves.clone())
                .unwrap_or_default();
            for dependency in dependents {
                if let Some(entry) = relations.get_mut(&dependency) {
                    entry.parent_leaves.insert(parent.clone());
                }
            }
        }

        // Weight: intrinsic plus the intrinsic weight of every transitive
        // parent leaf.
        for (task_id, entry) in relations.iter_mut() {
            let intrinsic = self
                .task_specs
                .get(task_id)
                .and_then(TaskSpec::leaf)
                .map(|leaf| u64::from(leaf.weight))
                .unwrap_or(0);
            let inherited: u64 = entry
                .parent_leaves
                .iter()
                .filter_map(|parent| self.task_specs.get(parent))
                .filter_map(TaskSpec::leaf)
                .map(|leaf| u64::from(leaf.weight))
                .sum();
            entry.weight = intrinsic + inherited;
        }

        self.leaf_relations = relations;
        Ok(())
    }
}

impl Default for Engine<Building> {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine<Built> {
    pub fn task_spec(&self, task_id: &TaskId) -> Option<&TaskSpec> {
        self.task_specs.get(task_id)
    }

    pub fn task_ids(&self) -> impl Iterator<Item = &TaskId> {
        self.task_graph.node_weights().filter_map(|node| match node {
            TaskNode::Task(task_id) => Some(task_id),
            TaskNode::Root => None,
        })
    }

    pub fn leaf_ids(&self) -> impl Iterator<Item = &TaskId> {
        self.task_ids().filter(|id| {
            self.task_specs
                .get(id)
                .is_some_and(TaskSpec::is_leaf)
        })
    }

    pub fn len(&self) -> usize {
        self.task_lookup.len()
    }

    pub fn is_empty(&self) -> bool {
        self.task_lookup.is_empty()
    }

    /// Direct dependencies of a task (edges out of it, excluding the root).
    pub fn dependencies(&self, task_id: &TaskId) -> BTreeSet<&TaskId> {
        self.neighbors(task_id, petgraph::Direction::Outgoing)
    }

    /// Direct dependents of a task (edges into it).
    pub fn dependents(&self, task_id: &TaskId) -> BTreeSet<&TaskId> {
        self.neighbors(task_id, petgraph::Direction::Incoming)
    }

    /// Every task transitively reachable from `task_id` in the reverse
    /// graph, i.e. everything invalidated when it changes.
    pub fn transitive_dependents(&self, task_id: &TaskId) -> BTreeSet<&TaskId> {
        let Some(index) = self.task_lookup.get(task_id) else {
            return BTreeSet::new();
        };
        sail_graph_utils::transitive_closure(
            &self.task_graph,
            Some(*index),
            petgraph::Direction::Incoming,
        )
        .into_iter()
        .filter_map(|node| match node {
            TaskNode::Task(id) => Some(id),
            TaskNode::Root => None,
        })
        .collect()
    }

    pub fn relations(&self, task_id: &TaskId) -> Option<&LeafRelations> {
        self.leaf_relations.get(task_id)
    }

    /// Scheduling weight; tasks without relations (groups) weigh nothing.
    pub fn weight(&self, task_id: &TaskId) -> u64 {
        self.leaf_relations
            .get(task_id)
            .map(|r| r.weight)
            .unwrap_or(0)
    }

    pub fn task_graph(&self) -> &Graph<TaskNode, ()> {
        &self.task_graph
    }

    fn neighbors(
        &self,
        task_id: &TaskId,
        direction: petgraph::Direction,
    ) -> BTreeSet<&TaskId> {
        let Some(index) = self.task_lookup.get(task_id) else {
            return BTreeSet::new();
        };
        self.task_graph
            .neighbors_directed(*index, direction)
            .filter_map(|index| match &self.task_graph[index] {
                TaskNode::Task(id) => Some(id),
                TaskNode::Root => None,
            })
            .collect()
    }
}
