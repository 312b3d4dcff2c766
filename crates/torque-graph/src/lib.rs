#![deny(clippy::all)]

//! Graph utilities shared by the task engine: dependency-ordered walking
//! with cancellation, and validation that rejects graphs the walker cannot
//! safely traverse.

mod walker;

use std::{fmt::Display, hash::Hash};

use itertools::Itertools;
use petgraph::prelude::*;
use thiserror::Error;
pub use walker::{WalkMessage, Walker};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Cyclic dependency detected:\n\t{cycle_lines}")]
    CyclicDependencies { cycle_lines: String },
    #[error("{0} depends on itself")]
    SelfDependency(String),
}

/// Rejects graphs with cycles or self-dependencies. Must pass before a
/// [`Walker`] is constructed; a cyclic graph would deadlock it.
pub fn validate_graph<N: Display + Clone + Hash + Eq>(graph: &Graph<N, ()>) -> Result<(), Error> {
    let cycle_lines = petgraph::algo::tarjan_scc(graph)
        .into_iter()
        .filter(|scc| scc.len() > 1)
        .map(|scc| {
            scc.into_iter()
                .map(|id| {
                    graph
                        .node_weight(id)
                        .expect("tarjan_scc only yields nodes present in the graph")
                })
                .sorted_by_key(|node| node.to_string())
                .format(", ")
                .to_string()
        })
        .join("\n\t");

    if !cycle_lines.is_empty() {
        return Err(Error::CyclicDependencies { cycle_lines });
    }

    for edge in graph.edge_references() {
        if edge.source() == edge.target() {
            let node = graph
                .node_weight(edge.source())
                .expect("edge endpoints exist in the graph");
            return Err(Error::SelfDependency(node.to_string()));
        }
    }

    Ok(())
}
