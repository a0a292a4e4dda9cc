// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 buildgraph contributors

//! # buildgraph - Build Pipeline Orchestrator
//!
//! `buildgraph` schedules a directed acyclic graph of build nodes onto
//! agents, passes artifacts and parameters between them, and records the
//! outcome of every run.
//!
//! ## Features
//!
//! - **Dependency-aware scheduling** - every node runs after its upstreams reach a terminal state
//! - **Failure policies** - per-edge fail-to-start, wait or ignore handling
//! - **Artifact passing** - append-only, digest-verified artifact store
//! - **Parameters** - `%placeholder%` resolution, step-emitted values, reverse dependency overrides
//! - **Agents** - requirement matching and per-node concurrency caps
//!
//! ## Quick Start
//!
//! ```bash
//! # Check the pipeline definition
//! buildgraph validate
//!
//! # Render the graph
//! buildgraph graph --format mermaid
//!
//! # Build a node and everything it needs
//! buildgraph run --node publish
//! ```

pub mod artifacts;
pub mod cli;
pub mod errors;
pub mod executors;
pub mod pipeline;
pub mod scheduler;
pub mod utils;

// Re-export commonly used types
pub use artifacts::{ArtifactStore, FilesystemStore};
pub use errors::{BuildgraphError, BuildgraphResult};
pub use executors::{ProcessRunner, StepRunner};
pub use pipeline::{BuildNode, DependencyEdge, PipelineConfig, PipelineGraph};
pub use scheduler::{RunStatus, ScheduleReport, Scheduler, TriggerEvent};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
