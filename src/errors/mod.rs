// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 buildgraph contributors

//! Error types
//!
//! Graph-definition errors are fatal and block scheduling. Failures that
//! happen while a run executes are recorded on the run instance as a
//! [`FailureReason`](crate::scheduler::FailureReason) instead.

use miette::Diagnostic;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for buildgraph operations
pub type BuildgraphResult<T> = Result<T, BuildgraphError>;

/// Main error type for buildgraph
#[derive(Error, Debug, Diagnostic)]
pub enum BuildgraphError {
    // ─────────────────────────────────────────────────────────────────────────
    // Graph Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Dependency cycle detected between: {}", nodes.join(", "))]
    #[diagnostic(
        code(buildgraph::cycle),
        help("Remove one of the dependency edges between these nodes")
    )]
    Cycle { nodes: Vec<String> },

    #[error("Edge '{edge_from}' -> '{edge_to}' references an undeclared node")]
    #[diagnostic(
        code(buildgraph::unknown_node),
        help("Check that both '{edge_from}' and '{edge_to}' are declared as nodes")
    )]
    UnknownNode { edge_from: String, edge_to: String },

    #[error("Node '{id}' is declared more than once")]
    #[diagnostic(code(buildgraph::duplicate_node))]
    DuplicateNode { id: String },

    #[error("Node '{id}' not found in pipeline")]
    #[diagnostic(code(buildgraph::node_not_found))]
    NodeNotFound { id: String },

    #[error("Template '{template}' is invalid: {reason}")]
    #[diagnostic(code(buildgraph::invalid_template))]
    InvalidTemplate { template: String, reason: String },

    // ─────────────────────────────────────────────────────────────────────────
    // Parameter Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Node '{node}': placeholder '%{token}%' could not be resolved")]
    #[diagnostic(
        code(buildgraph::unresolved_parameter),
        help("Declare '{token}' as a node parameter, reference an upstream with 'dep.<id>.<name>', or export it in the environment")
    )]
    UnresolvedParameter { node: String, token: String },

    #[error("Node '{node}': placeholder '%{token}%' nests too deeply")]
    #[diagnostic(
        code(buildgraph::parameter_recursion),
        help("Parameters probably reference each other in a loop")
    )]
    ParameterRecursion { node: String, token: String },

    // ─────────────────────────────────────────────────────────────────────────
    // Scheduling Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("No agent satisfied the requirements of '{node}' within {waited_secs}s")]
    #[diagnostic(
        code(buildgraph::no_agent_available),
        help("Register an agent matching the node's requirements or raise scheduler.agent_wait_timeout_secs")
    )]
    NoAgentAvailable { node: String, waited_secs: u64 },

    #[error("Run {run_number} of '{node}' cannot move from {from} to {to}")]
    #[diagnostic(code(buildgraph::invalid_transition))]
    InvalidTransition {
        node: String,
        run_number: u64,
        from: String,
        to: String,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // Step Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Step '{step}' could not be launched: {error}")]
    #[diagnostic(code(buildgraph::step_launch))]
    StepLaunch {
        step: String,
        error: String,
        #[help]
        help: Option<String>,
    },

    #[error("Step '{step}' timed out after {timeout_secs}s")]
    #[diagnostic(code(buildgraph::step_timeout))]
    StepTimeout { step: String, timeout_secs: u64 },

    // ─────────────────────────────────────────────────────────────────────────
    // Artifact Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("No artifacts of '{node}' #{run_number} matched '{pattern}'")]
    #[diagnostic(
        code(buildgraph::artifact_not_found),
        help("An empty artifact set is treated as an error; check the pattern and the producing steps")
    )]
    ArtifactNotFound {
        node: String,
        run_number: u64,
        pattern: String,
    },

    #[error("Artifacts for '{node}' #{run_number} were already published")]
    #[diagnostic(code(buildgraph::artifact_conflict))]
    ArtifactConflict { node: String, run_number: u64 },

    #[error("Artifact '{path}' does not match its recorded digest")]
    #[diagnostic(code(buildgraph::artifact_corrupted))]
    ArtifactCorrupted { path: PathBuf },

    #[error("Invalid artifact rule '{rule}': {reason}")]
    #[diagnostic(
        code(buildgraph::invalid_artifact_rule),
        help("Use 'source=>destination', 'source:destination' or a bare 'source'")
    )]
    InvalidArtifactRule { rule: String, reason: String },

    // ─────────────────────────────────────────────────────────────────────────
    // Pipeline File Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Pipeline file not found: {path}")]
    #[diagnostic(
        code(buildgraph::pipeline_not_found),
        help("Pass the pipeline file with --pipeline or create buildgraph.yaml")
    )]
    PipelineNotFound { path: PathBuf },

    #[error("Invalid pipeline configuration: {reason}")]
    #[diagnostic(code(buildgraph::invalid_pipeline))]
    InvalidPipeline {
        reason: String,
        #[help]
        help: Option<String>,
    },

    #[error("Environment overlay '{name}' is not defined")]
    #[diagnostic(code(buildgraph::unknown_environment))]
    UnknownEnvironment { name: String },

    #[error("Failed to read file '{path}': {error}")]
    #[diagnostic(code(buildgraph::file_read_error))]
    FileReadError { path: PathBuf, error: String },

    #[error("Failed to write file '{path}': {error}")]
    #[diagnostic(code(buildgraph::file_write_error))]
    FileWriteError { path: PathBuf, error: String },

    // ─────────────────────────────────────────────────────────────────────────
    // IO/System Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("IO error: {message}")]
    #[diagnostic(code(buildgraph::io_error))]
    Io { message: String },

    #[error("YAML parsing error: {message}")]
    #[diagnostic(code(buildgraph::yaml_error))]
    Yaml { message: String },

    #[error("JSON parsing error: {message}")]
    #[diagnostic(code(buildgraph::json_error))]
    Json { message: String },

    #[error("TOML parsing error: {message}")]
    #[diagnostic(code(buildgraph::toml_error))]
    Toml { message: String },

    #[error("Glob pattern error: {message}")]
    #[diagnostic(code(buildgraph::glob_error))]
    GlobPattern { message: String },
}

impl From<std::io::Error> for BuildgraphError {
    fn from(e: std::io::Error) -> Self {
        Self::Io { message: e.to_string() }
    }
}

impl From<serde_yaml::Error> for BuildgraphError {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Yaml { message: e.to_string() }
    }
}

impl From<serde_json::Error> for BuildgraphError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json { message: e.to_string() }
    }
}

impl From<toml::de::Error> for BuildgraphError {
    fn from(e: toml::de::Error) -> Self {
        Self::Toml { message: e.to_string() }
    }
}

impl From<glob::PatternError> for BuildgraphError {
    fn from(e: glob::PatternError) -> Self {
        Self::GlobPattern { message: e.to_string() }
    }
}

impl BuildgraphError {
    /// Create a launch error, suggesting a fix when the program is not on PATH
    pub fn step_launch(step: &str, program: &str, error: impl ToString) -> Self {
        let help = if which::which(program).is_err() && !std::path::Path::new(program).exists() {
            Some(format!("'{}' was not found on PATH", program))
        } else {
            None
        };

        Self::StepLaunch {
            step: step.to_string(),
            error: error.to_string(),
            help,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_names_nodes() {
        let err = BuildgraphError::Cycle {
            nodes: vec!["a".into(), "b".into()],
        };
        assert_eq!(err.to_string(), "Dependency cycle detected between: a, b");
    }

    #[test]
    fn test_launch_help_for_missing_program() {
        let err = BuildgraphError::step_launch("build", "definitely-not-a-real-tool-xyz", "not found");
        match err {
            BuildgraphError::StepLaunch { help, .. } => {
                assert!(help.unwrap().contains("definitely-not-a-real-tool-xyz"));
            }
            _ => panic!("Expected StepLaunch"),
        }
    }
}
