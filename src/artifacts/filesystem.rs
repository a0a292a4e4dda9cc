// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 buildgraph contributors

//! Filesystem-based artifact store
//!
//! Layout: `{root}/{node}/{run}/files/...` plus `{root}/{node}/{run}/manifest.json`.
//! A run is staged next to its final directory and renamed into place, so a
//! partially published run is never visible.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info};

use super::matcher::{check_destination, find_matches, portable};
use super::{ArtifactFile, ArtifactManifest, ArtifactStore, StoreStats};
use crate::errors::{BuildgraphError, BuildgraphResult};
use crate::pipeline::ArtifactRule;

const MANIFEST: &str = "manifest.json";
const FILES: &str = "files";

/// Filesystem-based artifact store
#[derive(Debug, Clone)]
pub struct FilesystemStore {
    root: PathBuf,
}

impl FilesystemStore {
    /// Open a store, creating its directory if needed
    pub fn new(root: impl Into<PathBuf>) -> BuildgraphResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| BuildgraphError::FileWriteError {
            path: root.clone(),
            error: e.to_string(),
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn run_dir(&self, node: &str, run_number: u64) -> PathBuf {
        self.root.join(node).join(run_number.to_string())
    }

    fn staging_dir(&self, node: &str, run_number: u64) -> PathBuf {
        self.root.join(node).join(format!(".{}.staging", run_number))
    }

    async fn read_manifest(path: &Path) -> BuildgraphResult<ArtifactManifest> {
        let content =
            tokio::fs::read_to_string(path)
                .await
                .map_err(|e| BuildgraphError::FileReadError {
                    path: path.to_path_buf(),
                    error: e.to_string(),
                })?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Run numbers present for each node, published or not
    async fn runs_by_node(&self) -> BuildgraphResult<BTreeMap<String, BTreeSet<u64>>> {
        let mut runs = BTreeMap::new();
        let mut node_dirs = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(runs),
            Err(e) => return Err(e.into()),
        };

        while let Some(node_dir) = node_dirs.next_entry().await? {
            if !node_dir.file_type().await?.is_dir() {
                continue;
            }
            let Some(node) = node_dir.file_name().to_str().map(str::to_string) else {
                continue;
            };

            let mut numbers = BTreeSet::new();
            let mut entries = tokio::fs::read_dir(node_dir.path()).await?;
            while let Some(entry) = entries.next_entry().await? {
                if let Some(number) = entry.file_name().to_str().and_then(|n| n.parse().ok()) {
                    numbers.insert(number);
                }
            }
            runs.insert(node, numbers);
        }

        Ok(runs)
    }

    async fn copy_verified(
        source: &Path,
        dest: &Path,
        expected: Option<&ArtifactFile>,
    ) -> BuildgraphResult<()> {
        let bytes = tokio::fs::read(source)
            .await
            .map_err(|e| BuildgraphError::FileReadError {
                path: source.to_path_buf(),
                error: e.to_string(),
            })?;

        if let Some(expected) = expected {
            if blake3::hash(&bytes).to_hex().as_str() != expected.digest {
                return Err(BuildgraphError::ArtifactCorrupted {
                    path: source.to_path_buf(),
                });
            }
        }

        write_file(dest, &bytes).await
    }
}

async fn write_file(dest: &Path, bytes: &[u8]) -> BuildgraphResult<()> {
    let write_error = |e: std::io::Error| BuildgraphError::FileWriteError {
        path: dest.to_path_buf(),
        error: e.to_string(),
    };

    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(write_error)?;
    }
    tokio::fs::write(dest, bytes).await.map_err(write_error)
}

#[async_trait]
impl ArtifactStore for FilesystemStore {
    async fn publish(
        &self,
        node: &str,
        run_number: u64,
        working_dir: &Path,
        rules: &[ArtifactRule],
    ) -> BuildgraphResult<ArtifactManifest> {
        let final_dir = self.run_dir(node, run_number);
        if final_dir.exists() {
            return Err(BuildgraphError::ArtifactConflict {
                node: node.to_string(),
                run_number,
            });
        }

        // Later rules overwrite earlier ones at the same destination
        let mut selected: BTreeMap<String, PathBuf> = BTreeMap::new();
        for rule in rules {
            check_destination(rule)?;
            let matches = find_matches(working_dir, rule)?;
            if matches.is_empty() {
                return Err(BuildgraphError::ArtifactNotFound {
                    node: node.to_string(),
                    run_number,
                    pattern: rule.source.clone(),
                });
            }
            for m in matches {
                let relative = Path::new(&rule.destination).join(&m.relative);
                selected.insert(portable(&relative), m.source);
            }
        }

        let staging = self.staging_dir(node, run_number);
        if staging.exists() {
            tokio::fs::remove_dir_all(&staging).await?;
        }

        let mut files = Vec::with_capacity(selected.len());
        for (path, source) in &selected {
            let bytes = tokio::fs::read(source)
                .await
                .map_err(|e| BuildgraphError::FileReadError {
                    path: source.clone(),
                    error: e.to_string(),
                })?;
            write_file(&staging.join(FILES).join(path), &bytes).await?;

            files.push(ArtifactFile {
                path: path.clone(),
                size: bytes.len() as u64,
                digest: blake3::hash(&bytes).to_hex().to_string(),
            });
        }

        let manifest = ArtifactManifest {
            node_id: node.to_string(),
            run_number,
            created_at: SystemTime::now(),
            files,
        };
        let json = serde_json::to_string_pretty(&manifest)?;
        write_file(&staging.join(MANIFEST), json.as_bytes()).await?;

        if final_dir.exists() {
            let _ = tokio::fs::remove_dir_all(&staging).await;
            return Err(BuildgraphError::ArtifactConflict {
                node: node.to_string(),
                run_number,
            });
        }
        tokio::fs::rename(&staging, &final_dir)
            .await
            .map_err(|e| BuildgraphError::FileWriteError {
                path: final_dir.clone(),
                error: e.to_string(),
            })?;

        info!(
            node,
            run_number,
            files = manifest.files.len(),
            bytes = manifest.total_size(),
            "Published artifacts"
        );

        Ok(manifest)
    }

    async fn fetch(
        &self,
        node: &str,
        run_number: u64,
        rule: &ArtifactRule,
        dest_root: &Path,
    ) -> BuildgraphResult<Vec<PathBuf>> {
        check_destination(rule)?;

        let not_found = || BuildgraphError::ArtifactNotFound {
            node: node.to_string(),
            run_number,
            pattern: rule.source.clone(),
        };

        let manifest = self
            .manifest(node, run_number)
            .await?
            .ok_or_else(not_found)?;

        let files_root = self.run_dir(node, run_number).join(FILES);
        let matches = find_matches(&files_root, rule)?;
        if matches.is_empty() {
            return Err(not_found());
        }

        let dest_dir = dest_root.join(&rule.destination);
        let mut written = Vec::with_capacity(matches.len());
        for m in matches {
            let stored = m
                .source
                .strip_prefix(&files_root)
                .map(portable)
                .unwrap_or_default();
            let expected = manifest.file(&stored).ok_or_else(|| {
                BuildgraphError::ArtifactCorrupted {
                    path: m.source.clone(),
                }
            })?;

            let dest = dest_dir.join(&m.relative);
            Self::copy_verified(&m.source, &dest, Some(expected)).await?;
            written.push(dest);
        }

        debug!(node, run_number, rule = %rule, files = written.len(), "Fetched artifacts");
        Ok(written)
    }

    async fn manifest(
        &self,
        node: &str,
        run_number: u64,
    ) -> BuildgraphResult<Option<ArtifactManifest>> {
        let path = self.run_dir(node, run_number).join(MANIFEST);
        if !path.exists() {
            return Ok(None);
        }
        Self::read_manifest(&path).await.map(Some)
    }

    async fn latest_run(&self, node: &str) -> BuildgraphResult<Option<u64>> {
        Ok(self
            .runs_by_node()
            .await?
            .get(node)
            .and_then(|runs| runs.last().copied()))
    }

    async fn list(&self) -> BuildgraphResult<Vec<ArtifactManifest>> {
        let mut manifests = Vec::new();
        for (node, runs) in self.runs_by_node().await? {
            for run in runs {
                if let Some(manifest) = self.manifest(&node, run).await? {
                    manifests.push(manifest);
                }
            }
        }
        Ok(manifests)
    }

    async fn stats(&self) -> BuildgraphResult<StoreStats> {
        let manifests = self.list().await?;

        let nodes: BTreeSet<&str> = manifests.iter().map(|m| m.node_id.as_str()).collect();
        Ok(StoreStats {
            nodes: nodes.len(),
            runs: manifests.len(),
            files: manifests.iter().map(|m| m.files.len()).sum(),
            size_bytes: manifests.iter().map(ArtifactManifest::total_size).sum(),
            oldest_run: manifests.iter().map(|m| m.created_at).min(),
            newest_run: manifests.iter().map(|m| m.created_at).max(),
        })
    }

    async fn prune(&self, keep_last: usize) -> BuildgraphResult<usize> {
        let mut removed = 0;
        for (node, runs) in self.runs_by_node().await? {
            let excess = runs.len().saturating_sub(keep_last);
            for run in runs.into_iter().take(excess) {
                tokio::fs::remove_dir_all(self.run_dir(&node, run)).await?;
                removed += 1;
            }
        }

        if removed > 0 {
            info!(removed, keep_last, "Pruned artifact runs");
        }
        Ok(removed)
    }

    async fn clear(&self) -> BuildgraphResult<()> {
        if self.root.exists() {
            tokio::fs::remove_dir_all(&self.root).await?;
        }
        tokio::fs::create_dir_all(&self.root).await?;
        Ok(())
    }
}
