// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 buildgraph contributors

//! Validate command - check pipeline configuration

use colored::Colorize;
use miette::Result;
use std::path::PathBuf;

use super::load_pipeline;
use crate::pipeline::PipelineValidator;
use crate::utils::{print_error, print_success, print_warning};

/// Run the validate command
pub async fn run(pipeline_path: PathBuf, env: Option<String>, verbose: bool) -> Result<()> {
    println!("{}", "Validating pipeline...".bold());
    println!();

    let pipeline = match load_pipeline(&pipeline_path) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("  {} Failed to load pipeline", "✗".red());
            eprintln!();
            return Err(e);
        }
    };

    print_success("Pipeline file parsed");

    let validation = PipelineValidator::validate(&pipeline, env.as_deref());

    if !validation.errors.is_empty() {
        println!();
        println!("{}:", "Errors".red().bold());
        for error in &validation.errors {
            print_error(error);
        }
    }

    if !validation.warnings.is_empty() {
        println!();
        println!("{}:", "Warnings".yellow().bold());
        for warning in &validation.warnings {
            print_warning(warning);
        }
    }

    if verbose && validation.is_valid() {
        let graph = pipeline.build_graph(env.as_deref())?;
        println!();
        println!("{}:", "Pipeline summary".bold());
        println!("  Name: {}", pipeline.name);
        if let Some(env) = &env {
            println!("  Environment: {}", env);
        }
        let environments = pipeline.environment_names();
        if !environments.is_empty() {
            println!("  Environments: {}", environments.join(", "));
        }
        println!("  Nodes: {}", graph.len());
        for id in graph.topological_order()? {
            let Some(node) = graph.node(&id) else {
                continue;
            };
            let deps = graph.dependencies(&id);
            let deps = if deps.is_empty() {
                String::new()
            } else {
                format!(" [depends: {}]", deps.join(", "))
            };
            println!(
                "    - {} ({} steps){}",
                node.id,
                node.steps.len(),
                deps.dimmed()
            );
        }
    }

    println!();

    if !validation.is_valid() {
        Err(miette::miette!("Pipeline validation failed"))
    } else if validation.has_warnings() {
        println!("{}", "Pipeline is valid but has warnings.".yellow().bold());
        Ok(())
    } else {
        println!("{}", "Pipeline is valid!".green().bold());
        Ok(())
    }
}
