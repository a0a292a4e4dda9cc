// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 buildgraph contributors

//! Pipeline dependency graph
//!
//! Holds build nodes and dependency edges, validates that they form a DAG
//! and resolves a reproducible execution order.

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use crate::errors::{BuildgraphError, BuildgraphResult};
use crate::pipeline::{BuildNode, DependencyEdge};

/// Graph of build nodes joined by dependency edges
#[derive(Debug, Clone, Default)]
pub struct PipelineGraph {
    nodes: BTreeMap<String, BuildNode>,
    edges: Vec<DependencyEdge>,
}

impl PipelineGraph {
    /// Create an empty graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node; ids must be unique
    pub fn add_node(&mut self, node: BuildNode) -> BuildgraphResult<()> {
        if self.nodes.contains_key(&node.id) {
            return Err(BuildgraphError::DuplicateNode { id: node.id });
        }
        self.nodes.insert(node.id.clone(), node);
        Ok(())
    }

    /// Add an edge. Endpoints are checked by [`validate`](Self::validate).
    pub fn add_edge(&mut self, edge: DependencyEdge) {
        self.edges.push(edge);
    }

    /// Builder-style [`add_node`](Self::add_node)
    pub fn with_node(mut self, node: BuildNode) -> BuildgraphResult<Self> {
        self.add_node(node)?;
        Ok(self)
    }

    /// Builder-style [`add_edge`](Self::add_edge)
    pub fn with_edge(mut self, edge: DependencyEdge) -> Self {
        self.add_edge(edge);
        self
    }

    pub fn node(&self, id: &str) -> Option<&BuildNode> {
        self.nodes.get(id)
    }

    pub fn node_mut(&mut self, id: &str) -> Option<&mut BuildNode> {
        self.nodes.get_mut(id)
    }

    /// All nodes, ordered by id
    pub fn nodes(&self) -> impl Iterator<Item = &BuildNode> {
        self.nodes.values()
    }

    pub fn edges(&self) -> &[DependencyEdge] {
        &self.edges
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Check that every edge references declared nodes and that there is no cycle
    pub fn validate(&self) -> BuildgraphResult<()> {
        for edge in &self.edges {
            if !self.nodes.contains_key(&edge.from) || !self.nodes.contains_key(&edge.to) {
                return Err(BuildgraphError::UnknownNode {
                    edge_from: edge.from.clone(),
                    edge_to: edge.to.clone(),
                });
            }
        }

        if let Some(nodes) = self.find_cycle() {
            return Err(BuildgraphError::Cycle { nodes });
        }

        Ok(())
    }

    /// Node ids in execution order.
    ///
    /// Kahn's algorithm processed level by level: a node's position is
    /// determined by its depth, then by its id.
    pub fn topological_order(&self) -> BuildgraphResult<Vec<String>> {
        Ok(self.levels()?.into_iter().flatten().collect())
    }

    /// Node ids grouped by dependency depth; nodes in one level have no
    /// edges between them
    pub fn levels(&self) -> BuildgraphResult<Vec<Vec<String>>> {
        self.validate()?;

        let mut in_degree: BTreeMap<&str, usize> =
            self.nodes.keys().map(|id| (id.as_str(), 0)).collect();
        let mut dependents: HashMap<&str, BTreeSet<&str>> = HashMap::new();

        for (upstream, downstream) in self.unique_links() {
            if dependents.entry(upstream).or_default().insert(downstream) {
                *in_degree.entry(downstream).or_default() += 1;
            }
        }

        let mut levels = Vec::new();
        let mut current: Vec<&str> = in_degree
            .iter()
            .filter(|(_, &d)| d == 0)
            .map(|(id, _)| *id)
            .collect();

        while !current.is_empty() {
            let mut next = BTreeSet::new();
            for id in &current {
                for dependent in dependents.get(id).into_iter().flatten() {
                    if let Some(degree) = in_degree.get_mut(dependent) {
                        *degree -= 1;
                        if *degree == 0 {
                            next.insert(*dependent);
                        }
                    }
                }
            }
            levels.push(current.iter().map(|s| s.to_string()).collect());
            current = next.into_iter().collect();
        }

        Ok(levels)
    }

    /// Edges pointing from `id` to its upstreams
    pub fn upstream_edges(&self, id: &str) -> Vec<&DependencyEdge> {
        self.edges.iter().filter(|e| e.from == id).collect()
    }

    /// Direct upstream node ids, sorted and deduplicated
    pub fn dependencies(&self, id: &str) -> Vec<String> {
        self.upstream_edges(id)
            .into_iter()
            .map(|e| e.to.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Direct downstream node ids, sorted and deduplicated
    pub fn downstream(&self, id: &str) -> Vec<String> {
        self.edges
            .iter()
            .filter(|e| e.to == id)
            .map(|e| e.from.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// `id` plus every node it transitively depends on
    pub fn dependency_closure(&self, id: &str) -> BuildgraphResult<BTreeSet<String>> {
        if !self.nodes.contains_key(id) {
            return Err(BuildgraphError::NodeNotFound { id: id.to_string() });
        }

        let mut closure = BTreeSet::new();
        let mut queue = VecDeque::from([id.to_string()]);

        while let Some(current) = queue.pop_front() {
            if !closure.insert(current.clone()) {
                continue;
            }
            for edge in self.upstream_edges(&current) {
                queue.push_back(edge.to.clone());
            }
        }

        Ok(closure)
    }

    /// Every transitive upstream of `id` with its shortest edge distance
    pub fn upstream_distances(&self, id: &str) -> BTreeMap<String, usize> {
        let mut distances = BTreeMap::new();
        let mut queue = VecDeque::from([(id.to_string(), 0usize)]);

        while let Some((current, distance)) = queue.pop_front() {
            for edge in self.upstream_edges(&current) {
                if edge.to == id || distances.contains_key(&edge.to) {
                    continue;
                }
                distances.insert(edge.to.clone(), distance + 1);
                queue.push_back((edge.to.clone(), distance + 1));
            }
        }

        distances
    }

    /// Graph restricted to `ids` and the edges between them
    pub fn subgraph(&self, ids: &BTreeSet<String>) -> Self {
        Self {
            nodes: self
                .nodes
                .iter()
                .filter(|(id, _)| ids.contains(*id))
                .map(|(id, n)| (id.clone(), n.clone()))
                .collect(),
            edges: self
                .edges
                .iter()
                .filter(|e| ids.contains(&e.from) && ids.contains(&e.to))
                .cloned()
                .collect(),
        }
    }

    /// Check if node A depends (directly or transitively) on node B
    pub fn depends_on(&self, node_a: &str, node_b: &str) -> bool {
        node_a != node_b
            && self
                .dependency_closure(node_a)
                .map(|c| c.contains(node_b))
                .unwrap_or(false)
    }

    /// Generate Mermaid diagram of the graph (edges point downstream)
    pub fn to_mermaid(&self) -> String {
        let mut out = String::from("graph TD\n");

        for node in self.nodes.values() {
            out.push_str(&format!("    {}[\"{}\"]\n", mermaid_id(&node.id), node.display_name()));
        }

        for (upstream, downstream) in self.unique_links() {
            out.push_str(&format!(
                "    {} --> {}\n",
                mermaid_id(upstream),
                mermaid_id(downstream)
            ));
        }

        out
    }

    /// Generate DOT diagram of the graph
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph pipeline {\n");
        out.push_str("    rankdir=TB;\n");
        out.push_str("    node [shape=box, style=rounded];\n\n");

        for edge in &self.edges {
            let style = match edge.on_failure {
                crate::pipeline::FailureAction::FailToStart => "",
                crate::pipeline::FailureAction::Ignore => " [style=dashed]",
                crate::pipeline::FailureAction::Wait => " [style=dotted]",
            };
            out.push_str(&format!("    \"{}\" -> \"{}\"{};\n", edge.to, edge.from, style));
        }

        // Isolated nodes (no edges)
        for id in self.nodes.keys() {
            if !self.edges.iter().any(|e| &e.from == id || &e.to == id) {
                out.push_str(&format!("    \"{}\";\n", id));
            }
        }

        out.push_str("}\n");
        out
    }

    /// Generate text representation of execution order
    pub fn to_text(&self) -> BuildgraphResult<String> {
        let mut out = String::new();
        let mut position = 1;

        for (depth, level) in self.levels()?.iter().enumerate() {
            out.push_str(&format!("Level {}:\n", depth));
            for id in level {
                let node = &self.nodes[id];
                out.push_str(&format!("  {}. {}", position, id));
                if node.display_name() != id {
                    out.push_str(&format!(" ({})", node.display_name()));
                }

                let deps = self.dependencies(id);
                if !deps.is_empty() {
                    out.push_str(&format!(" [depends: {}]", deps.join(", ")));
                }
                if let Some(cap) = node.max_concurrent_runs {
                    out.push_str(&format!(" [max runs: {}]", cap));
                }

                out.push('\n');
                position += 1;
            }
        }

        Ok(out)
    }

    /// Distinct (upstream, downstream) pairs, in edge order
    fn unique_links(&self) -> Vec<(&str, &str)> {
        let mut seen = BTreeSet::new();
        self.edges
            .iter()
            .map(|e| (e.to.as_str(), e.from.as_str()))
            .filter(|link| seen.insert(*link))
            .collect()
    }

    /// Members of a cycle, if any, sorted by id
    fn find_cycle(&self) -> Option<Vec<String>> {
        let mut graph: DiGraph<&str, ()> = DiGraph::new();
        let index: HashMap<&str, NodeIndex> = self
            .nodes
            .keys()
            .map(|id| (id.as_str(), graph.add_node(id.as_str())))
            .collect();

        for (upstream, downstream) in self.unique_links() {
            graph.add_edge(index[upstream], index[downstream], ());
        }

        tarjan_scc(&graph)
            .into_iter()
            .filter(|scc| scc.len() > 1 || graph.contains_edge(scc[0], scc[0]))
            .map(|scc| {
                let mut members: Vec<String> =
                    scc.into_iter().map(|n| graph[n].to_string()).collect();
                members.sort();
                members
            })
            .min()
    }
}

fn mermaid_id(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}
