// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 buildgraph contributors

//! Run command - schedule the pipeline

use colored::Colorize;
use miette::Result;
use std::path::PathBuf;
use std::sync::Arc;

use super::{build_scheduler, load_pipeline};
use crate::pipeline::PipelineValidator;
use crate::scheduler::{ScheduleReport, TriggerEvent};
use crate::utils::{create_progress_bar, format_duration, print_header, status_label, status_symbol};

/// Run the pipeline
pub async fn run(
    pipeline_path: PathBuf,
    node: Option<String>,
    env: Option<String>,
    params: Vec<(String, String)>,
    source_ref: String,
    dry_run: bool,
    verbose: bool,
) -> Result<()> {
    let pipeline = load_pipeline(&pipeline_path)?;

    let validation = PipelineValidator::validate(&pipeline, env.as_deref());
    if !validation.is_valid() {
        eprintln!("{}", "Pipeline validation failed:".red().bold());
        for error in &validation.errors {
            eprintln!("  {} {}", "✗".red(), error);
        }
        return Err(miette::miette!("Pipeline configuration is invalid"));
    }

    if validation.has_warnings() && verbose {
        eprintln!("{}", "Pipeline warnings:".yellow().bold());
        for warning in &validation.warnings {
            eprintln!("  {} {}", "⚠".yellow(), warning);
        }
        eprintln!();
    }

    let graph = pipeline.build_graph(env.as_deref())?;

    let mut trigger = TriggerEvent::manual(source_ref);
    if let Some(id) = node {
        trigger = trigger.requesting(id);
    }
    for (key, value) in params {
        trigger = trigger.with_parameter(key, value);
    }

    if dry_run {
        let planned = match &trigger.requested_node_id {
            Some(id) => graph.subgraph(&graph.dependency_closure(id)?),
            None => graph,
        };
        println!("{}", "Dry run - nothing will be executed".yellow().bold());
        println!();
        print!("{}", planned.to_text()?);
        return Ok(());
    }

    let scheduler = build_scheduler(&pipeline)?;
    let mut handle = scheduler.start(trigger, Arc::new(graph)).await?;

    let progress = create_progress_bar(handle.nodes().len() as u64, "Building");
    let events = handle.take_events().map(|mut events| {
        let progress = progress.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if !event.status.is_terminal() {
                    if verbose {
                        progress.println(format!(
                            "  {} {} #{} {}",
                            status_symbol(event.status),
                            event.node_id,
                            event.run_number,
                            status_label(event.status)
                        ));
                    }
                    continue;
                }

                let mut line = format!(
                    "  {} {} #{}",
                    status_symbol(event.status),
                    event.node_id,
                    event.run_number
                );
                if let Some(reason) = &event.reason {
                    line.push_str(&format!(" - {}", reason.to_string().dimmed()));
                }
                progress.println(line);
                progress.inc(1);
            }
        })
    });

    let canceller = handle.canceller();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("{}", "Interrupted, cancelling runs...".yellow());
            canceller.cancel_all();
        }
    });

    let report = handle.wait().await;
    interrupt.abort();
    if let Some(events) = events {
        let _ = events.await;
    }
    progress.finish_and_clear();

    print_summary(&report);

    if let Some(keep) = pipeline.store.keep_runs {
        let removed = scheduler.store().prune(keep).await?;
        if removed > 0 && verbose {
            println!("{}", format!("Pruned {} old artifact runs", removed).dimmed());
        }
    }

    if report.succeeded() {
        Ok(())
    } else {
        Err(miette::miette!(
            "{} of {} runs did not succeed",
            report.failures().count(),
            report.runs.len()
        ))
    }
}

fn print_summary(report: &ScheduleReport) {
    println!();
    print_header("Schedule summary");

    for run in &report.runs {
        let duration = run
            .duration()
            .map(|d| format!(" ({})", format_duration(d)))
            .unwrap_or_default();
        println!(
            "  {} {} #{} {}{}",
            status_symbol(run.status),
            run.node_id.bold(),
            run.run_number,
            status_label(run.status),
            duration.dimmed()
        );
        if let Some(reason) = &run.reason {
            println!("      {}", reason.to_string().dimmed());
        }
    }

    println!();
    if report.succeeded() {
        println!("{}", "All runs succeeded.".green().bold());
    }
}
