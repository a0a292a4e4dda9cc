// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 buildgraph contributors

//! Command-line behaviour against pipelines on disk

#![cfg(unix)]

use assert_cmd::Command;
use predicates::prelude::*;
use std::path::Path;
use tempfile::TempDir;

const PIPELINE: &str = r#"
name: carbon
parameters:
  config: release
nodes:
  - id: arm64
    name: Build arm64
    parameters:
      env.CMAKE_PRESET: arm64-osx-%config%
    steps:
      - name: compile
        command: sh
        args: ["-c", "mkdir -p out/lib && echo $CMAKE_PRESET > out/lib/libcarbon.a"]
    artifact_rules:
      - "out"
  - id: x64
    steps:
      - name: compile
        command: sh
        args: ["-c", "mkdir -p out/lib && echo x64 > out/lib/libcarbon.a"]
    artifact_rules:
      - "out"
  - id: universal
    name: Create Universal Binaries
    steps:
      - name: lipo
        command: sh
        args: ["-c", "cat arm64/libcarbon.a x64/libcarbon.a > universal.a"]
    artifact_rules:
      - "universal.a"
edges:
  - from: universal
    to: arm64
    artifact_rules: ["lib => arm64"]
  - from: universal
    to: x64
    artifact_rules: ["lib => x64"]
"#;

fn project(pipeline: &str) -> TempDir {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("buildgraph.yaml"), pipeline).unwrap();
    dir
}

fn buildgraph(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("buildgraph").unwrap();
    cmd.arg("-C").arg(dir).env("NO_COLOR", "1").env("CLICOLOR", "0");
    cmd
}

#[test]
fn test_validate_accepts_pipeline() {
    let dir = project(PIPELINE);
    buildgraph(dir.path())
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("Pipeline is valid"));
}

#[test]
fn test_validate_reports_cycle() {
    let dir = project(
        r#"
name: loop
nodes:
  - id: a
    steps: [{name: x, command: "true"}]
  - id: b
    steps: [{name: x, command: "true"}]
edges:
  - {from: a, to: b}
  - {from: b, to: a}
"#,
    );
    buildgraph(dir.path())
        .arg("validate")
        .assert()
        .failure()
        .stdout(predicate::str::contains("Dependency cycle: a → b"));
}

#[test]
fn test_missing_pipeline_file() {
    let dir = TempDir::new().unwrap();
    buildgraph(dir.path())
        .arg("validate")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Pipeline file not found"));
}

#[test]
fn test_graph_formats() {
    let dir = project(PIPELINE);
    buildgraph(dir.path())
        .args(["graph", "--format", "mermaid"])
        .assert()
        .success()
        .stdout(predicate::str::contains("graph TD"))
        .stdout(predicate::str::contains("arm64 --> universal"));

    buildgraph(dir.path())
        .args(["graph", "--format", "dot"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"x64\" -> \"universal\";"));
}

#[test]
fn test_dry_run_executes_nothing() {
    let dir = project(PIPELINE);
    buildgraph(dir.path())
        .args(["run", "--dry-run", "--node", "arm64"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Dry run"))
        .stdout(predicate::str::contains("arm64"))
        .stdout(predicate::str::contains("universal").not());
    assert!(!dir.path().join(".buildgraph").exists());
}

#[test]
fn test_run_publishes_and_lists_artifacts() {
    let dir = project(PIPELINE);
    buildgraph(dir.path())
        .args(["run", "-P", "config=debug"])
        .assert()
        .success()
        .stdout(predicate::str::contains("All runs succeeded"));

    let lib = dir
        .path()
        .join(".buildgraph/artifacts/arm64/1/files/lib/libcarbon.a");
    assert_eq!(
        std::fs::read_to_string(lib).unwrap().trim(),
        "arm64-osx-debug"
    );

    buildgraph(dir.path())
        .args(["artifacts", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("universal #1"))
        .stdout(predicate::str::contains("universal.a"));

    buildgraph(dir.path())
        .args(["artifacts", "stats"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Runs:     3"));
}

#[test]
fn test_failed_run_exits_nonzero() {
    let dir = project(
        r#"
name: broken
nodes:
  - id: build
    steps: [{name: compile, command: sh, args: ["-c", "exit 2"]}]
  - id: publish
    steps: [{name: upload, command: "true"}]
edges:
  - {from: publish, to: build}
"#,
    );
    buildgraph(dir.path())
        .arg("run")
        .assert()
        .failure()
        .stdout(predicate::str::contains("step 'compile' exited with code 2"))
        .stdout(predicate::str::contains("failed to start"))
        .stderr(predicate::str::contains("2 of 2 runs did not succeed"));
}
