//! DOT rendering of the task graph for `--graph`.

use std::io::{self, Write};

use itertools::Itertools;
use petgraph::visit::EdgeRef;

use crate::{Built, Engine, TaskNode};

/// Writes the sealed graph in Graphviz DOT form. Edges follow the
/// dependency direction; the synthetic root is omitted.
pub fn render_dot<W: Write>(engine: &Engine<Built>, out: &mut W) -> io::Result<()> {
    writeln!(out, "digraph {{")?;

    let graph = engine.task_graph();
    let mut isolated: Vec<String> = Vec::new();
    let mut edges: Vec<(String, String)> = Vec::new();
    for edge in graph.edge_references() {
        let source = &graph[edge.source()];
        let target = &graph[edge.target()];
        match (source, target) {
            (TaskNode::Task(from), TaskNode::Task(to)) => {
                edges.push((from.to_string(), to.to_string()));
            }
            (TaskNode::Task(from), TaskNode::Root) => isolated.push(from.to_string()),
            _ => {}
        }
    }

    // Root-connected tasks that also have real dependencies would be listed
    // twice; an explicit node line is only needed when nothing else mentions
    // the task.
    let mentioned: Vec<&String> = edges.iter().flat_map(|(a, b)| [a, b]).collect();
    for node in isolated.iter().sorted() {
        if !mentioned.contains(&node) {
            writeln!(out, "\t\"{node}\"")?;
        }
    }
    for (from, to) in edges.iter().sorted() {
        writeln!(out, "\t\"{from}\" -> \"{to}\"")?;
    }

    writeln!(out, "}}")?;
    Ok(())
}
