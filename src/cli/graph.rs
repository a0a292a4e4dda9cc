// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 buildgraph contributors

//! Graph command - visualize pipeline as a graph

use miette::Result;
use std::path::PathBuf;

use super::{load_pipeline, GraphFormat};

/// Run the graph command
pub async fn run(
    pipeline_path: PathBuf,
    env: Option<String>,
    format: GraphFormat,
    _verbose: bool,
) -> Result<()> {
    let pipeline = load_pipeline(&pipeline_path)?;
    let graph = pipeline.build_graph(env.as_deref())?;

    let output = match format {
        GraphFormat::Text => graph.to_text()?,
        GraphFormat::Dot => graph.to_dot(),
        GraphFormat::Mermaid => graph.to_mermaid(),
    };

    println!("{}", output);

    Ok(())
}
