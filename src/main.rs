// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 buildgraph contributors

//! buildgraph - Build Pipeline Orchestrator
//!
//! Schedule build graphs across agents with artifact and parameter passing.

use clap::Parser;
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use buildgraph::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "buildgraph=debug"
    } else {
        "buildgraph=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    // Change to specified directory if provided
    if let Some(ref dir) = cli.directory {
        std::env::set_current_dir(dir).map_err(|e| {
            miette::miette!("Failed to change to directory '{}': {}", dir.display(), e)
        })?;
    }

    // Dispatch to command handlers
    match cli.command {
        Commands::Run {
            pipeline,
            node,
            env,
            params,
            source_ref,
            dry_run,
        } => {
            buildgraph::cli::run::run(pipeline, node, env, params, source_ref, dry_run, cli.verbose)
                .await
        }
        Commands::Validate { pipeline, env } => {
            buildgraph::cli::validate::run(pipeline, env, cli.verbose).await
        }
        Commands::Graph {
            pipeline,
            env,
            format,
        } => buildgraph::cli::graph::run(pipeline, env, format, cli.verbose).await,
        Commands::Artifacts { pipeline, action } => {
            buildgraph::cli::artifacts::run(pipeline, action, cli.verbose).await
        }
    }
}
