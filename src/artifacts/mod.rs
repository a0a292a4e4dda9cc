// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 buildgraph contributors

//! Artifact store
//!
//! Published files are keyed by `(node id, run number)` and never change once
//! written. Downstream nodes copy them into their working directories.

mod filesystem;
pub mod matcher;

pub use filesystem::FilesystemStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::errors::BuildgraphResult;
use crate::pipeline::ArtifactRule;

/// Trait for artifact stores
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Copy the files selected by `rules` out of `working_dir` and record
    /// them as the artifacts of `node` #`run_number`
    async fn publish(
        &self,
        node: &str,
        run_number: u64,
        working_dir: &Path,
        rules: &[ArtifactRule],
    ) -> BuildgraphResult<ArtifactManifest>;

    /// Copy the artifacts selected by `rule` below `dest_root`, returning the
    /// written paths
    async fn fetch(
        &self,
        node: &str,
        run_number: u64,
        rule: &ArtifactRule,
        dest_root: &Path,
    ) -> BuildgraphResult<Vec<PathBuf>>;

    /// Manifest of a published run
    async fn manifest(&self, node: &str, run_number: u64)
        -> BuildgraphResult<Option<ArtifactManifest>>;

    /// Highest run number the store has seen for `node`
    async fn latest_run(&self, node: &str) -> BuildgraphResult<Option<u64>>;

    /// Every published run, ordered by node and run number
    async fn list(&self) -> BuildgraphResult<Vec<ArtifactManifest>>;

    /// Get store statistics
    async fn stats(&self) -> BuildgraphResult<StoreStats>;

    /// Keep the newest `keep_last` runs of every node, returning how many
    /// runs were removed
    async fn prune(&self, keep_last: usize) -> BuildgraphResult<usize>;

    /// Remove everything
    async fn clear(&self) -> BuildgraphResult<()>;
}

/// Record of one published run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArtifactManifest {
    pub node_id: String,
    pub run_number: u64,
    pub created_at: SystemTime,
    pub files: Vec<ArtifactFile>,
}

impl ArtifactManifest {
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }

    /// Entry for a `/`-separated relative path
    pub fn file(&self, path: &str) -> Option<&ArtifactFile> {
        self.files.iter().find(|f| f.path == path)
    }
}

/// A published file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArtifactFile {
    /// Path relative to the run's file root, `/`-separated
    pub path: String,
    pub size: u64,
    /// BLAKE3 digest, hex encoded
    pub digest: String,
}

/// Store statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreStats {
    /// Nodes with at least one published run
    pub nodes: usize,
    /// Published runs
    pub runs: usize,
    /// Published files
    pub files: usize,
    /// Total size in bytes
    pub size_bytes: u64,
    pub oldest_run: Option<SystemTime>,
    pub newest_run: Option<SystemTime>,
}

impl StoreStats {
    /// Format size for display
    pub fn formatted_size(&self) -> String {
        format_size(self.size_bytes)
    }
}

/// Human-readable byte count
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 bytes");
        assert_eq!(format_size(2048), "2.00 KB");
        assert_eq!(format_size(5 * 1024 * 1024 + 512 * 1024), "5.50 MB");
    }

    #[test]
    fn test_manifest_lookup() {
        let manifest = ArtifactManifest {
            node_id: "x64".into(),
            run_number: 3,
            created_at: SystemTime::now(),
            files: vec![
                ArtifactFile {
                    path: "lib/a.so".into(),
                    size: 10,
                    digest: "00".into(),
                },
                ArtifactFile {
                    path: "b.h".into(),
                    size: 5,
                    digest: "11".into(),
                },
            ],
        };

        assert_eq!(manifest.total_size(), 15);
        assert_eq!(manifest.file("lib/a.so").map(|f| f.size), Some(10));
        assert!(manifest.file("lib").is_none());
    }
}
