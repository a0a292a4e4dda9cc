// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 buildgraph contributors

//! Pipeline validation
//!
//! Lints a pipeline configuration before execution. Graph errors (cycles,
//! unknown nodes) are reported alongside softer configuration problems.

use std::collections::BTreeSet;

use crate::errors::BuildgraphError;
use crate::pipeline::params::{self, BUILTIN_PARAMETERS, REVERSE_PREFIX};
use crate::pipeline::{BuildNode, ExecutionMode, PipelineConfig, PipelineGraph};

/// Pipeline validator
pub struct PipelineValidator;

impl PipelineValidator {
    /// Validate a pipeline configuration, optionally with an overlay applied
    pub fn validate(pipeline: &PipelineConfig, environment: Option<&str>) -> ValidationResult {
        let mut result = ValidationResult::new();

        if pipeline.nodes.is_empty() && pipeline.templates.is_empty() {
            result.add_error("Pipeline has no nodes defined");
            return result;
        }

        let graph = match pipeline.build_graph(environment) {
            Ok(graph) => graph,
            Err(BuildgraphError::Cycle { nodes }) => {
                result.add_error(&format!("Dependency cycle: {}", nodes.join(" → ")));
                return result;
            }
            Err(e) => {
                result.add_error(&e.to_string());
                return result;
            }
        };

        for node in graph.nodes() {
            Self::validate_node(node, &graph, &mut result);
        }

        for edge in graph.edges() {
            let upstream_publishes = graph
                .node(&edge.to)
                .map(|n| !n.artifact_rules.is_empty())
                .unwrap_or(false);
            if !edge.artifact_rules.is_empty() && !upstream_publishes {
                result.add_warning(&format!(
                    "Edge '{}' -> '{}': copies artifacts but '{}' publishes none",
                    edge.from, edge.to, edge.to
                ));
            }
        }

        result
    }

    /// Validate a single node
    fn validate_node(node: &BuildNode, graph: &PipelineGraph, result: &mut ValidationResult) {
        if node.id.is_empty()
            || node
                .id
                .chars()
                .any(|c| c == '.' || c == '%' || c == '@' || c.is_whitespace())
        {
            result.add_error(&format!(
                "Node '{}': ids may not be empty or contain '.', '%', '@' or whitespace",
                node.id
            ));
        }

        if node.max_concurrent_runs == Some(0) {
            result.add_error(&format!("Node '{}': max_concurrent_runs must be at least 1", node.id));
        }

        if node.steps.is_empty() {
            result.add_warning(&format!("Node '{}': has no steps", node.id));
        }

        for step in &node.steps {
            if step.command.trim().is_empty() {
                result.add_error(&format!(
                    "Node '{}': step '{}' has an empty command",
                    node.id, step.name
                ));
                continue;
            }

            if !step.enabled {
                result.add_warning(&format!(
                    "Node '{}': step '{}' is disabled and will be skipped",
                    node.id, step.name
                ));
            } else if params::placeholders(&step.command).is_empty()
                && which::which(&step.command).is_err()
                && !std::path::Path::new(&step.command).exists()
            {
                result.add_warning(&format!(
                    "Node '{}': step '{}' runs '{}', which is not on PATH here",
                    node.id, step.name, step.command
                ));
            }
        }

        if node.max_concurrent_runs == Some(1)
            && !node.steps.iter().any(|s| s.mode == ExecutionMode::Always)
        {
            result.add_warning(&format!(
                "Node '{}': exclusive node has no 'always' cleanup step",
                node.id
            ));
        }

        Self::validate_references(node, graph, result);
    }

    /// Check placeholders that reference upstream nodes or undeclared parameters
    fn validate_references(node: &BuildNode, graph: &PipelineGraph, result: &mut ValidationResult) {
        let upstream: BTreeSet<String> = graph.dependencies(&node.id).into_iter().collect();

        let mut texts: Vec<&str> = node
            .parameters
            .iter()
            .filter(|(k, _)| !k.starts_with(REVERSE_PREFIX))
            .map(|(_, v)| v.as_str())
            .collect();
        for step in &node.steps {
            texts.push(&step.command);
            texts.extend(step.args.iter().map(String::as_str));
            texts.extend(step.working_dir.as_deref());
            texts.extend(step.env.values().map(String::as_str));
        }
        for rule in &node.artifact_rules {
            texts.push(&rule.source);
            texts.push(&rule.destination);
        }
        for edge in graph.upstream_edges(&node.id) {
            for rule in &edge.artifact_rules {
                texts.push(&rule.source);
                texts.push(&rule.destination);
            }
        }

        let mut reported = BTreeSet::new();
        for token in texts.into_iter().flat_map(params::placeholders) {
            if !reported.insert(token.clone()) {
                continue;
            }

            if let Some((dep, _)) = params::split_dep_reference(&token) {
                if !upstream.contains(dep) {
                    result.add_error(&format!(
                        "Node '{}': '%{}%' references '{}', which is not a direct upstream",
                        node.id, token, dep
                    ));
                }
                continue;
            }

            let declared = node.parameters.contains_key(&token)
                || BUILTIN_PARAMETERS.contains(&token.as_str());
            if !declared {
                result.add_warning(&format!(
                    "Node '{}': '%{}%' is not declared and must come from the environment",
                    node.id, token
                ));
            }
        }
    }
}

/// Result of pipeline validation
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, message: &str) {
        self.errors.push(message.to_string());
    }

    pub fn add_warning(&mut self, message: &str) {
        self.warnings.push(message.to_string());
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }
}
