// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 buildgraph contributors

//! Utility modules
//!
//! Common utilities for the buildgraph CLI.

pub mod colors;
pub mod progress;

pub use colors::*;
pub use progress::*;
