// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 buildgraph contributors

//! CLI command definitions and handlers
//!
//! Defines the command-line interface for buildgraph.

pub mod artifacts;
pub mod graph;
pub mod run;
pub mod validate;

use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::artifacts::FilesystemStore;
use crate::executors::ProcessRunner;
use crate::pipeline::PipelineConfig;
use crate::scheduler::{AgentPool, Scheduler};

/// Build pipeline orchestrator
///
/// Schedule a graph of build nodes across agents and pass artifacts between them.
#[derive(Parser, Debug)]
#[clap(
    name = "buildgraph",
    version,
    about = "Build pipeline orchestrator with dependency-aware scheduling and artifact passing",
    long_about = None,
    after_help = "Examples:\n\
        buildgraph validate                     Check the pipeline definition\n\
        buildgraph graph --format dot           Render the dependency graph\n\
        buildgraph run --node publish           Build a node and everything it needs\n\
        buildgraph run -P env.CMAKE_PRESET=x    Override a parameter\n\n\
        See 'buildgraph <command> --help' for more information on a specific command."
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,

    /// Enable verbose output
    #[clap(short, long, global = true)]
    pub verbose: bool,

    /// Change to directory before executing
    #[clap(short = 'C', long, global = true, value_name = "DIR")]
    pub directory: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Schedule and run the pipeline
    Run {
        /// Pipeline file
        #[clap(short, long, default_value = "buildgraph.yaml")]
        pipeline: PathBuf,

        /// Node to build along with its dependencies (default: every node)
        #[clap(short, long)]
        node: Option<String>,

        /// Environment overlay to apply
        #[clap(short, long)]
        env: Option<String>,

        /// Parameter override, `key=value` (repeatable)
        #[clap(short = 'P', long = "param", value_name = "KEY=VALUE", value_parser = parse_key_value)]
        params: Vec<(String, String)>,

        /// Source revision the trigger refers to
        #[clap(long, default_value = "HEAD")]
        source_ref: String,

        /// Show what would run without running it
        #[clap(long)]
        dry_run: bool,
    },

    /// Validate pipeline configuration
    Validate {
        /// Pipeline file to validate
        #[clap(default_value = "buildgraph.yaml")]
        pipeline: PathBuf,

        /// Environment overlay to apply
        #[clap(short, long)]
        env: Option<String>,
    },

    /// Show pipeline as a graph
    Graph {
        /// Pipeline file
        #[clap(default_value = "buildgraph.yaml")]
        pipeline: PathBuf,

        /// Environment overlay to apply
        #[clap(short, long)]
        env: Option<String>,

        /// Output format
        #[clap(short, long, value_enum, default_value_t = GraphFormat::Text)]
        format: GraphFormat,
    },

    /// Artifact store management
    Artifacts {
        /// Pipeline file (locates the store)
        #[clap(short, long, default_value = "buildgraph.yaml")]
        pipeline: PathBuf,

        #[clap(subcommand)]
        action: ArtifactsAction,
    },
}

/// Artifact store actions
#[derive(Subcommand, Debug, Clone)]
pub enum ArtifactsAction {
    /// Show store statistics
    Stats,

    /// List stored runs
    List {
        /// Only this node
        node: Option<String>,
    },

    /// Delete all but the newest runs of each node
    Prune {
        /// Runs to keep per node
        #[clap(short, long, default_value = "5")]
        keep: usize,
    },

    /// Delete every stored artifact
    Clear {
        /// Skip confirmation
        #[clap(short, long)]
        yes: bool,
    },
}

/// Graph output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum GraphFormat {
    Text,
    Dot,
    Mermaid,
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got '{}'", s)),
    }
}

/// Load a pipeline file, with a hint when it is missing
pub(crate) fn load_pipeline(path: &Path) -> miette::Result<PipelineConfig> {
    if !path.exists() {
        return Err(miette::miette!(
            "Pipeline file not found: {}\n\n\
             Pass --pipeline or use -C to point at the project directory.",
            path.display()
        ));
    }

    Ok(PipelineConfig::from_file(path)?)
}

/// Open the artifact store configured by a pipeline
pub(crate) fn open_store(pipeline: &PipelineConfig) -> miette::Result<FilesystemStore> {
    Ok(FilesystemStore::new(pipeline.store.directory.clone())?)
}

/// Scheduler wired to local processes and the filesystem store
pub(crate) fn build_scheduler(pipeline: &PipelineConfig) -> miette::Result<Scheduler> {
    let agents = if pipeline.agents.is_empty() {
        AgentPool::local()
    } else {
        AgentPool::new(pipeline.agents.clone())
    };
    let store = open_store(pipeline)?;

    Ok(Scheduler::new(
        agents,
        Arc::new(ProcessRunner::new()),
        Arc::new(store),
        pipeline.scheduler.clone(),
    ))
}
