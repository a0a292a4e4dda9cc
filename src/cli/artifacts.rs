// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 buildgraph contributors

//! Artifacts command - inspect and manage the artifact store

use colored::Colorize;
use miette::Result;
use std::io::{self, Write};
use std::path::PathBuf;

use super::{load_pipeline, open_store, ArtifactsAction};
use crate::artifacts::{format_size, ArtifactStore};
use crate::utils::{format_duration, print_header};

/// Run the artifacts command
pub async fn run(pipeline_path: PathBuf, action: ArtifactsAction, _verbose: bool) -> Result<()> {
    let pipeline = load_pipeline(&pipeline_path)?;
    let store = open_store(&pipeline)?;

    match action {
        ArtifactsAction::Stats => {
            let stats = store.stats().await?;

            print_header("Artifact Store");
            println!("  Location: {}", store.root().display());
            println!("  Nodes:    {}", stats.nodes);
            println!("  Runs:     {}", stats.runs);
            println!("  Files:    {}", stats.files);
            println!("  Size:     {}", stats.formatted_size());

            if let Some(oldest) = stats.oldest_run {
                if let Ok(duration) = oldest.elapsed() {
                    println!("  Oldest:   {} ago", format_duration(duration));
                }
            }

            if let Some(newest) = stats.newest_run {
                if let Ok(duration) = newest.elapsed() {
                    println!("  Newest:   {} ago", format_duration(duration));
                }
            }

            Ok(())
        }

        ArtifactsAction::List { node } => {
            let manifests: Vec<_> = store
                .list()
                .await?
                .into_iter()
                .filter(|m| node.as_ref().map_or(true, |n| &m.node_id == n))
                .collect();

            print_header("Published Runs");

            if manifests.is_empty() {
                println!("{}", "  No published runs.".dimmed());
                return Ok(());
            }

            for manifest in &manifests {
                println!(
                    "  {} #{}  {} files, {}",
                    manifest.node_id.bold(),
                    manifest.run_number,
                    manifest.files.len(),
                    format_size(manifest.total_size())
                );
                for file in &manifest.files {
                    println!("      {}", file.path.dimmed());
                }
            }

            Ok(())
        }

        ArtifactsAction::Prune { keep } => {
            let removed = store.prune(keep).await?;
            if removed == 0 {
                println!("{}", "Nothing to prune.".dimmed());
            } else {
                println!(
                    "{}",
                    format!("Removed {} runs, kept the newest {} per node.", removed, keep).green()
                );
            }
            Ok(())
        }

        ArtifactsAction::Clear { yes } => {
            let stats = store.stats().await?;

            if stats.runs == 0 {
                println!("{}", "Artifact store is already empty.".dimmed());
                return Ok(());
            }

            if !yes {
                print!(
                    "Delete {} runs ({})? [y/N] ",
                    stats.runs,
                    stats.formatted_size()
                );
                io::stdout().flush().ok();

                let mut input = String::new();
                io::stdin().read_line(&mut input).ok();

                if !input.trim().eq_ignore_ascii_case("y") {
                    println!("{}", "Cancelled.".dimmed());
                    return Ok(());
                }
            }

            store.clear().await?;
            println!("{}", "Artifact store cleared.".green());

            Ok(())
        }
    }
}
