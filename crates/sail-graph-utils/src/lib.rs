//! Petgraph helpers shared by the build graph and the scheduler:
//! transitive closure, cycle validation, and an async walker that emits
//! nodes in dependency order.

mod walker;

use std::{collections::HashSet, fmt::Display, hash::Hash};

use itertools::Itertools;
use petgraph::{
    prelude::*,
    visit::{depth_first_search, Reversed},
};
use thiserror::Error;

pub use walker::{WalkMessage, Walker};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Cyclic dependency detected:\n{cycle_lines}")]
    CyclicDependencies { cycle_lines: String },
    #[error("{0} depends on itself")]
    SelfDependency(String),
}

/// All nodes reachable from `indices` in the given direction, including the
/// starting nodes themselves.
pub fn transitive_closure<N: Hash + Eq, I: IntoIterator<Item = NodeIndex>>(
    graph: &Graph<N, ()>,
    indices: I,
    direction: petgraph::Direction,
) -> HashSet<&N> {
    let mut visited = HashSet::new();

    let visitor = |event| {
        if let petgraph::visit::DfsEvent::Discover(n, _) = event {
            visited.insert(
                graph
                    .node_weight(n)
                    .expect("node index found during dfs doesn't exist"),
            );
        }
    };

    match direction {
        petgraph::Direction::Outgoing => depth_first_search(&graph, indices, visitor),
        petgraph::Direction::Incoming => depth_first_search(Reversed(&graph), indices, visitor),
    };

    visited
}

/// Rejects graphs with cycles or self-edges.
///
/// Every strongly connected component with more than one member is reported,
/// one line per cycle listing its nodes.
pub fn validate_graph<N: Display>(graph: &Graph<N, ()>) -> Result<(), Error> {
    let cycle_lines = petgraph::algo::tarjan_scc(graph)
        .into_iter()
        .filter(|component| component.len() > 1)
        .map(|component| {
            let members = component
                .into_iter()
                .map(|id| graph.node_weight(id).expect("scc node exists"));
            format!("\t{}", members.format(", "))
        })
        .join("\n");

    if !cycle_lines.is_empty() {
        return Err(Error::CyclicDependencies { cycle_lines });
    }

    for edge in graph.edge_references() {
        if edge.source() == edge.target() {
            let node = graph
                .node_weight(edge.source())
                .expect("edge pointed to missing node");
            return Err(Error::SelfDependency(node.to_string()));
        }
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use petgraph::graph::Graph;

    use super::*;

    #[test]
    fn test_cycle_is_reported_with_members() {
        let mut g = Graph::new();
        let a = g.add_node("a");
        let b = g.add_node("b");
        let c = g.add_node("c");
        g.add_edge(a, b, ());
        g.add_edge(b, c, ());
        g.add_edge(c, a, ());

        let err = validate_graph(&g).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("Cyclic dependency detected"), "{message}");
        for node in ["a", "b", "c"] {
            assert!(message.contains(node), "{message}");
        }
    }

    #[test]
    fn test_self_dependency_is_rejected() {
        let mut g = Graph::new();
        let a = g.add_node("a");
        g.add_edge(a, a, ());

        let err = validate_graph(&g).unwrap_err();
        assert_eq!(err.to_string(), "a depends on itself");
    }

    #[test]
    fn test_acyclic_graph_is_accepted() {
        let mut g = Graph::new();
        let a = g.add_node("a");
        let b = g.add_node("b");
        let c = g.add_node("c");
        g.add_edge(a, b, ());
        g.add_edge(a, c, ());
        g.add_edge(b, c, ());

        assert!(validate_graph(&g).is_ok());
    }

    #[test]
    fn test_transitive_closure_incoming() {
        // a -> b -> c, d -> c
        let mut g = Graph::new();
        let a = g.add_node("a");
        let b = g.add_node("b");
        let c = g.add_node("c");
        let d = g.add_node("d");
        g.add_edge(a, b, ());
        g.add_edge(b, c, ());
        g.add_edge(d, c, ());

        let dependents = transitive_closure(&g, Some(c), petgraph::Direction::Incoming);
        assert_eq!(
            dependents,
            ["a", "b", "c", "d"].iter().collect::<HashSet<_>>()
        );

        let dependencies = transitive_closure(&g, Some(b), petgraph::Direction::Outgoing);
        assert_eq!(dependencies, ["b", "c"].iter().collect::<HashSet<_>>());
    }
}
