//! Petgraph-backed dependency analysis.
//!
//! Builds a directed graph from work items (edge `a -> b` when `a` depends
//! on `b`) and answers the two questions the scheduler asks: which items
//! sit on a cycle, and how many other items an item transitively unblocks.

use std::collections::{HashMap, HashSet};

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;

use crate::graph::tracker::DependencyEdge;
use crate::work::WorkItem;

/// Directed dependency graph over work-item ids.
pub struct DependencyGraph {
    graph: DiGraph<String, ()>,
    index: HashMap<String, NodeIndex>,
}

impl DependencyGraph {
    /// Build from tracked work items.
    pub fn from_items<'a>(items: impl IntoIterator<Item = &'a WorkItem>) -> Self {
        let items: Vec<&WorkItem> = items.into_iter().collect();
        let mut builder = Self::builder();
        for item in &items {
            builder.ensure_node(&item.id);
        }
        for item in &items {
            for dep in &item.dependencies {
                builder.add_edge(&item.id, dep);
            }
        }
        builder
    }

    /// Build from raw tracker edges (`from` depends on `to`).
    pub fn from_edges<'a>(edges: impl IntoIterator<Item = &'a DependencyEdge>) -> Self {
        let mut builder = Self::builder();
        for edge in edges {
            builder.add_edge(&edge.from, &edge.to);
        }
        builder
    }

    fn builder() -> Self {
        Self {
            graph: DiGraph::new(),
            index: HashMap::new(),
        }
    }

    fn ensure_node(&mut self, id: &str) -> NodeIndex {
        if let Some(&ix) = self.index.get(id) {
            return ix;
        }
        let ix = self.graph.add_node(id.to_string());
        self.index.insert(id.to_string(), ix);
        ix
    }

    fn add_edge(&mut self, from: &str, to: &str) {
        let from_ix = self.ensure_node(from);
        let to_ix = self.ensure_node(to);
        self.graph.update_edge(from_ix, to_ix, ());
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Cycles in the graph, each as a path of ids.
    ///
    /// Strongly-connected components of size > 1 are cycles; a single node
    /// is a cycle only if it depends on itself.
    pub fn cycle_paths(&self) -> Vec<Vec<String>> {
        tarjan_scc(&self.graph)
            .into_iter()
            .filter(|scc| {
                scc.len() > 1
                    || (scc.len() == 1 && self.graph.find_edge(scc[0], scc[0]).is_some())
            })
            .map(|scc| scc.iter().map(|ix| self.graph[*ix].clone()).collect())
            .collect()
    }

    /// Every id that sits on some cycle. Dispatch is fatal only for these;
    /// unrelated work keeps flowing.
    pub fn cycle_members(&self) -> HashSet<String> {
        self.cycle_paths().into_iter().flatten().collect()
    }

    /// How many other items transitively depend on `id` — the number of
    /// items completing `id` helps unblock.
    pub fn unblock_count(&self, id: &str) -> usize {
        let Some(&start) = self.index.get(id) else {
            return 0;
        };
        let mut seen = HashSet::new();
        let mut stack = vec![start];
        while let Some(ix) = stack.pop() {
            for dependent in self.graph.neighbors_directed(ix, Direction::Incoming) {
                if seen.insert(dependent) {
                    stack.push(dependent);
                }
            }
        }
        seen.remove(&start);
        seen.len()
    }
}
