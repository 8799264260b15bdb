use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{BTreeSet, HashMap};

use crate::core::errors::{MaestroError, Result};

/// Builds the dependency graph, one edge `dependency -> dependent`
///
/// Processes that are only referenced as dependencies still get a node, so
/// a cycle closed through a not-yet-created process is caught too.
fn build_graph(dependencies: &HashMap<String, Vec<String>>) -> (DiGraph<String, ()>, Vec<String>) {
    let ids: BTreeSet<&String> = dependencies
        .iter()
        .flat_map(|(id, deps)| std::iter::once(id).chain(deps.iter()))
        .collect();

    let mut graph = DiGraph::new();
    let mut indices: HashMap<&String, NodeIndex> = HashMap::new();
    for id in &ids {
        indices.insert(*id, graph.add_node((*id).clone()));
    }
    for (id, deps) in dependencies {
        for dep in deps {
            graph.add_edge(indices[dep], indices[id], ());
        }
    }
    (graph, ids.into_iter().cloned().collect())
}

/// Rejects a dependency map containing a cycle; `process_id` names the culprit
pub fn validate_dependency_graph(
    process_id: &str,
    dependencies: &HashMap<String, Vec<String>>,
) -> Result<()> {
    let (graph, _) = build_graph(dependencies);
    if is_cyclic_directed(&graph) {
        return Err(MaestroError::DependencyCycle {
            process_id: process_id.to_string(),
        });
    }
    Ok(())
}

/// Process ids ordered so every dependency precedes its dependents
pub fn execution_order(dependencies: &HashMap<String, Vec<String>>) -> Result<Vec<String>> {
    let (graph, _) = build_graph(dependencies);
    let order = toposort(&graph, None).map_err(|cycle| MaestroError::DependencyCycle {
        process_id: graph[cycle.node_id()].clone(),
    })?;
    Ok(order.into_iter().map(|index| graph[index].clone()).collect())
}
