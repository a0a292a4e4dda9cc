// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 buildgraph contributors

//! Pipeline definitions and types
//!
//! This module defines the build graph: nodes, steps, artifact rules,
//! dependency edges, variant templates and parameter resolution.

mod dag;
mod definition;
pub mod params;
mod template;
mod validation;

pub use dag::PipelineGraph;
pub use definition::*;
pub use template::{NodeTemplate, Variant};
pub use validation::{PipelineValidator, ValidationResult};
