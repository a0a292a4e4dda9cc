// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 buildgraph contributors

//! End-to-end scheduling with real processes and the filesystem store

#![cfg(unix)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use buildgraph::artifacts::{ArtifactStore, FilesystemStore};
use buildgraph::errors::BuildgraphError;
use buildgraph::executors::ProcessRunner;
use buildgraph::pipeline::{
    AgentAttribute, ArtifactRule, BuildNode, DependencyEdge, FailureAction, PipelineGraph,
    Requirement, SchedulerConfig, StepSpec,
};
use buildgraph::scheduler::{
    Agent, AgentPool, FailureReason, RunStatus, Scheduler, StepOutcome, TriggerEvent,
};

fn mac_agents() -> Vec<Agent> {
    vec![
        Agent::new("mac-arm-1", "Mac OS X", "aarch64"),
        Agent::new("mac-x64-1", "Mac OS X", "x86_64"),
    ]
}

fn scheduler(tmp: &TempDir, agents: Vec<Agent>) -> Scheduler {
    let store = FilesystemStore::new(tmp.path().join("store")).unwrap();
    let config = SchedulerConfig {
        agent_wait_timeout_secs: 2,
        agent_poll_interval_ms: 20,
        workspace_dir: tmp.path().join("work"),
        default_step_timeout_secs: Some(30),
    };
    Scheduler::new(
        AgentPool::new(agents),
        Arc::new(ProcessRunner::new()),
        Arc::new(store),
        config,
    )
    .with_environment(HashMap::new())
}

fn arch(value: &str) -> Requirement {
    Requirement::Equals {
        attribute: AgentAttribute::OsArch,
        value: value.to_string(),
    }
}

fn slice_node(id: &str, agent_arch: &str) -> BuildNode {
    BuildNode::new(id, format!("Build {}", id))
        .with_requirement(arch(agent_arch))
        .with_step(StepSpec::script(
            "compile",
            format!("mkdir -p out/lib && echo {} > out/lib/libcarbon.a", id),
        ))
        .with_artifact_rule(ArtifactRule::preserve("out", ""))
}

#[tokio::test]
async fn test_fan_in_passes_artifacts_and_step_parameters() {
    let tmp = TempDir::new().unwrap();
    let scheduler = scheduler(&tmp, mac_agents());

    let arm64 = slice_node("arm64", "aarch64").with_step(StepSpec::script(
        "get git tag/hash",
        "echo \"##buildgraph[setParameter name='env.GIT_TAG_HASH' value='v1.2-abc']\"",
    ));
    let universal = BuildNode::new("universal", "Create Universal Binaries")
        .with_requirement(Requirement::StartsWith {
            attribute: AgentAttribute::OsName,
            value: "Mac".into(),
        })
        .with_step(StepSpec::script(
            "lipo",
            "cat arm64/lib/libcarbon.a x64/lib/libcarbon.a > universal.a",
        ))
        .with_artifact_rule(ArtifactRule::preserve(
            "universal.a",
            "%dep.arm64.env.GIT_TAG_HASH%",
        ));

    let graph = PipelineGraph::new()
        .with_node(arm64)
        .unwrap()
        .with_node(slice_node("x64", "x86_64"))
        .unwrap()
        .with_node(universal)
        .unwrap()
        .with_edge(
            DependencyEdge::new("universal", "arm64")
                .with_rule(ArtifactRule::preserve("lib", "arm64/lib")),
        )
        .with_edge(
            DependencyEdge::new("universal", "x64")
                .with_rule(ArtifactRule::preserve("lib", "x64/lib")),
        );

    let report = scheduler
        .schedule(
            TriggerEvent::manual("refs/heads/main").requesting("universal"),
            Arc::new(graph),
        )
        .await
        .unwrap();

    assert!(report.succeeded(), "{:?}", report.runs);
    assert_eq!(
        report.runs.iter().map(|r| r.node_id.as_str()).collect::<Vec<_>>(),
        vec!["arm64", "x64", "universal"]
    );
    assert_eq!(report.run("arm64").unwrap().agent.as_deref(), Some("mac-arm-1"));
    assert_eq!(report.run("x64").unwrap().agent.as_deref(), Some("mac-x64-1"));
    assert_eq!(
        report.run("arm64").unwrap().resolved_parameters["env.GIT_TAG_HASH"],
        "v1.2-abc"
    );

    let manifest = scheduler.store().manifest("universal", 1).await.unwrap().unwrap();
    let file = manifest.file("v1.2-abc/universal.a").unwrap();
    assert_eq!(file.size, "arm64\nx64\n".len() as u64);
}

#[tokio::test]
async fn test_failure_propagates_fail_to_start() {
    let tmp = TempDir::new().unwrap();
    let scheduler = scheduler(&tmp, mac_agents());

    let graph = PipelineGraph::new()
        .with_node(
            BuildNode::new("a", "")
                .with_step(StepSpec::script("fail", "exit 3"))
                .with_step(StepSpec::script("after", "touch after.txt"))
                .with_step(StepSpec::script("cleanup", "touch cleaned.txt").always()),
        )
        .unwrap()
        .with_node(BuildNode::new("b", "").with_step(StepSpec::script("b", "true")))
        .unwrap()
        .with_node(BuildNode::new("c", "").with_step(StepSpec::script("c", "true")))
        .unwrap()
        .with_edge(DependencyEdge::new("b", "a"))
        .with_edge(DependencyEdge::new("c", "b"));

    let report = scheduler
        .schedule(TriggerEvent::manual("main"), Arc::new(graph))
        .await
        .unwrap();

    let a = report.run("a").unwrap();
    assert_eq!(a.status, RunStatus::Failed);
    assert_eq!(
        a.reason,
        Some(FailureReason::StepFailure {
            step: "fail".into(),
            exit_code: Some(3)
        })
    );
    let outcomes: Vec<_> = a.steps.iter().map(|s| s.outcome).collect();
    assert_eq!(
        outcomes,
        vec![StepOutcome::Executed, StepOutcome::Skipped, StepOutcome::Executed]
    );
    let work = a.working_dir.clone().unwrap();
    assert!(work.join("cleaned.txt").exists());
    assert!(!work.join("after.txt").exists());

    let b = report.run("b").unwrap();
    assert_eq!(b.status, RunStatus::FailedToStart);
    assert_eq!(
        b.reason,
        Some(FailureReason::UpstreamFailed {
            upstream: vec!["a".into()]
        })
    );
    assert!(b.started_at.is_none());
    assert_eq!(report.status("c"), Some(RunStatus::FailedToStart));
}

#[tokio::test]
async fn test_wait_and_ignore_policies_proceed() {
    let tmp = TempDir::new().unwrap();
    let scheduler = scheduler(&tmp, mac_agents());

    let graph = PipelineGraph::new()
        .with_node(BuildNode::new("broken", "").with_step(StepSpec::script("x", "exit 1")))
        .unwrap()
        .with_node(BuildNode::new("ok", "").with_step(StepSpec::script("x", "true")))
        .unwrap()
        .with_node(BuildNode::new("waits", "").with_step(StepSpec::script("x", "true")))
        .unwrap()
        .with_node(BuildNode::new("ignores", "").with_step(StepSpec::script("x", "true")))
        .unwrap()
        .with_edge(
            DependencyEdge::new("waits", "broken")
                .with_rule(ArtifactRule::preserve("*.zip", ""))
                .on_failure(FailureAction::Wait),
        )
        .with_edge(
            DependencyEdge::new("ignores", "broken")
                .with_rule(ArtifactRule::preserve("*.zip", ""))
                .on_failure(FailureAction::Ignore),
        )
        // "ok" publishes nothing, so this fetch fails and is ignored
        .with_edge(
            DependencyEdge::new("ignores", "ok")
                .with_rule(ArtifactRule::preserve("*.zip", ""))
                .on_failure(FailureAction::Ignore),
        );

    let report = scheduler
        .schedule(TriggerEvent::manual("main"), Arc::new(graph))
        .await
        .unwrap();

    assert_eq!(report.status("broken"), Some(RunStatus::Failed));
    assert_eq!(report.status("waits"), Some(RunStatus::Succeeded));
    assert_eq!(report.status("ignores"), Some(RunStatus::Succeeded));
}

#[tokio::test]
async fn test_missing_upstream_artifacts_fail_downstream() {
    let tmp = TempDir::new().unwrap();
    let scheduler = scheduler(&tmp, mac_agents());

    let graph = PipelineGraph::new()
        .with_node(BuildNode::new("up", "").with_step(StepSpec::script("x", "true")))
        .unwrap()
        .with_node(BuildNode::new("down", "").with_step(StepSpec::script("x", "touch ran.txt")))
        .unwrap()
        .with_edge(
            DependencyEdge::new("down", "up").with_rule(ArtifactRule::preserve("bin/*", "")),
        );

    let report = scheduler
        .schedule(TriggerEvent::manual("main"), Arc::new(graph))
        .await
        .unwrap();

    let down = report.run("down").unwrap();
    assert_eq!(down.status, RunStatus::Failed);
    assert!(matches!(
        down.reason,
        Some(FailureReason::ArtifactNotFound { ref node, .. }) if node == "up"
    ));
    assert!(down.steps.is_empty());
}

#[tokio::test]
async fn test_concurrency_cap_serializes_runs_across_schedules() {
    let tmp = TempDir::new().unwrap();
    let scheduler = scheduler(&tmp, mac_agents());

    let graph = Arc::new(
        PipelineGraph::new()
            .with_node(
                BuildNode::new("universal", "")
                    .with_max_concurrent_runs(1)
                    .with_step(StepSpec::script(
                        "exclusive",
                        "if [ -e ../lock ]; then exit 9; fi; touch ../lock; sleep 0.3; rm ../lock",
                    )),
            )
            .unwrap(),
    );

    let first = scheduler
        .start(TriggerEvent::manual("main"), Arc::clone(&graph))
        .await
        .unwrap();
    let second = scheduler
        .start(TriggerEvent::manual("main"), Arc::clone(&graph))
        .await
        .unwrap();
    let (first, second) = tokio::join!(first.wait(), second.wait());

    let a = first.run("universal").unwrap();
    let b = second.run("universal").unwrap();
    assert_eq!(a.status, RunStatus::Succeeded, "{:?}", a.reason);
    assert_eq!(b.status, RunStatus::Succeeded, "{:?}", b.reason);
    assert_eq!((a.run_number, b.run_number), (1, 2));

    let (earlier, later) = if a.started_at <= b.started_at { (a, b) } else { (b, a) };
    assert!(earlier.finished_at.unwrap() <= later.started_at.unwrap());
}

#[tokio::test]
async fn test_cancel_runs_cleanup_and_blocks_downstream() {
    let tmp = TempDir::new().unwrap();
    let scheduler = scheduler(&tmp, mac_agents());

    let graph = PipelineGraph::new()
        .with_node(
            BuildNode::new("slow", "")
                .with_step(StepSpec::script("build", "exec sleep 10"))
                .with_step(StepSpec::script("cleanup", "touch cleaned.txt").always()),
        )
        .unwrap()
        .with_node(BuildNode::new("next", "").with_step(StepSpec::script("x", "true")))
        .unwrap()
        .with_edge(DependencyEdge::new("next", "slow"));

    let mut handle = scheduler
        .start(TriggerEvent::manual("main"), Arc::new(graph))
        .await
        .unwrap();
    let mut events = handle.take_events().unwrap();
    assert!(handle.take_events().is_none());

    while let Some(event) = events.recv().await {
        if event.node_id == "slow" && event.status == RunStatus::Running {
            break;
        }
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    handle.cancel("slow").unwrap();
    assert!(matches!(
        handle.cancel("missing"),
        Err(BuildgraphError::NodeNotFound { .. })
    ));

    let report = tokio::time::timeout(Duration::from_secs(8), handle.wait())
        .await
        .unwrap();

    let slow = report.run("slow").unwrap();
    assert_eq!(slow.status, RunStatus::Cancelled);
    assert_eq!(slow.reason, Some(FailureReason::Cancelled));
    assert!(slow.working_dir.as_ref().unwrap().join("cleaned.txt").exists());
    assert_eq!(report.status("next"), Some(RunStatus::FailedToStart));
}

#[tokio::test]
async fn test_cancel_queued_run_has_no_side_effects() {
    let tmp = TempDir::new().unwrap();
    let scheduler = scheduler(&tmp, mac_agents());

    let graph = PipelineGraph::new()
        .with_node(BuildNode::new("slow", "").with_step(StepSpec::script("build", "sleep 1")))
        .unwrap()
        .with_node(
            BuildNode::new("next", "")
                .with_step(StepSpec::script("x", "touch ran.txt"))
                .with_step(StepSpec::script("cleanup", "touch cleaned.txt").always()),
        )
        .unwrap()
        .with_edge(DependencyEdge::new("next", "slow"));

    let mut handle = scheduler
        .start(TriggerEvent::manual("main"), Arc::new(graph))
        .await
        .unwrap();
    let mut events = handle.take_events().unwrap();
    while let Some(event) = events.recv().await {
        if event.node_id == "slow" && event.status == RunStatus::Running {
            break;
        }
    }
    handle.cancel("next").unwrap();

    let report = handle.wait().await;

    assert_eq!(report.status("slow"), Some(RunStatus::Succeeded));
    let next = report.run("next").unwrap();
    assert_eq!(next.status, RunStatus::Cancelled);
    assert_eq!(next.reason, Some(FailureReason::Cancelled));
    assert!(next.started_at.is_none());
    assert!(next.agent.is_none());
    assert!(next.working_dir.is_none());
    assert!(next.steps.is_empty());
    assert!(!tmp.path().join("work").join("next").exists());
}

#[tokio::test]
async fn test_cancel_run_waiting_on_concurrency_cap() {
    let tmp = TempDir::new().unwrap();
    let scheduler = scheduler(&tmp, mac_agents());

    let graph = Arc::new(
        PipelineGraph::new()
            .with_node(
                BuildNode::new("universal", "")
                    .with_max_concurrent_runs(1)
                    .with_step(StepSpec::script("lipo", "sleep 0.5")),
            )
            .unwrap(),
    );

    let mut first = scheduler
        .start(TriggerEvent::manual("main"), Arc::clone(&graph))
        .await
        .unwrap();
    let mut events = first.take_events().unwrap();
    while let Some(event) = events.recv().await {
        if event.status == RunStatus::Running {
            break;
        }
    }

    let second = scheduler
        .start(TriggerEvent::manual("main"), Arc::clone(&graph))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    second.cancel("universal").unwrap();

    let (first, second) = tokio::join!(first.wait(), second.wait());

    assert_eq!(first.status("universal"), Some(RunStatus::Succeeded));
    let queued = second.run("universal").unwrap();
    assert_eq!(queued.run_number, 2);
    assert_eq!(queued.status, RunStatus::Cancelled);
    assert!(queued.started_at.is_none());
    assert!(queued.working_dir.is_none());
    assert!(queued.steps.is_empty());
    assert!(!tmp.path().join("work").join("universal").join("2").exists());
}

#[tokio::test]
async fn test_fan_in_fails_to_start_naming_failed_upstream() {
    let tmp = TempDir::new().unwrap();
    let scheduler = scheduler(&tmp, mac_agents());

    let graph = PipelineGraph::new()
        .with_node(
            BuildNode::new("a", "")
                .with_requirement(arch("aarch64"))
                .with_step(StepSpec::script("x", "true")),
        )
        .unwrap()
        .with_node(
            BuildNode::new("b", "")
                .with_requirement(arch("x86_64"))
                .with_step(StepSpec::script("x", "exit 1")),
        )
        .unwrap()
        .with_node(BuildNode::new("c", "").with_step(StepSpec::script("x", "touch ran.txt")))
        .unwrap()
        .with_edge(DependencyEdge::new("c", "a"))
        .with_edge(DependencyEdge::new("c", "b"));

    let report = scheduler
        .schedule(TriggerEvent::manual("main"), Arc::new(graph))
        .await
        .unwrap();

    assert_eq!(report.status("a"), Some(RunStatus::Succeeded));
    assert_eq!(report.status("b"), Some(RunStatus::Failed));
    let c = report.run("c").unwrap();
    assert_eq!(c.status, RunStatus::FailedToStart);
    assert_eq!(
        c.reason,
        Some(FailureReason::UpstreamFailed {
            upstream: vec!["b".into()]
        })
    );
    assert!(c.started_at.is_none());
    assert!(c.steps.is_empty());
}

#[tokio::test]
async fn test_no_compatible_agent_fails_run() {
    let tmp = TempDir::new().unwrap();
    let scheduler = scheduler(&tmp, mac_agents());

    let graph = PipelineGraph::new()
        .with_node(
            BuildNode::new("win", "")
                .with_requirement(Requirement::Equals {
                    attribute: AgentAttribute::OsName,
                    value: "Windows".into(),
                })
                .with_step(StepSpec::script("x", "true")),
        )
        .unwrap()
        .with_node(BuildNode::new("publish", "").with_step(StepSpec::script("x", "true")))
        .unwrap()
        .with_edge(DependencyEdge::new("publish", "win"));

    let report = scheduler
        .schedule(TriggerEvent::manual("main"), Arc::new(graph))
        .await
        .unwrap();

    let win = report.run("win").unwrap();
    assert_eq!(win.status, RunStatus::Failed);
    assert_eq!(
        win.reason,
        Some(FailureReason::NoAgentAvailable { waited_secs: 0 })
    );
    assert!(win.agent.is_none());
    assert_eq!(report.status("publish"), Some(RunStatus::FailedToStart));
}

#[tokio::test]
async fn test_parameters_reach_step_environment() {
    let tmp = TempDir::new().unwrap();
    let scheduler = scheduler(&tmp, mac_agents());

    let graph = PipelineGraph::new()
        .with_node(
            BuildNode::new("arm64", "")
                .with_parameter("preset", "arm64-osx-debug")
                .with_parameter("env.CMAKE_PRESET", "%preset%")
                .with_step(StepSpec::script(
                    "configure",
                    "echo \"$CMAKE_PRESET\" > preset.txt",
                )),
        )
        .unwrap()
        .with_node(
            BuildNode::new("publish", "")
                .with_parameter("reverse.dep.arm64.preset", "arm64-osx-release")
                .with_step(StepSpec::script("x", "true")),
        )
        .unwrap()
        .with_edge(DependencyEdge::new("publish", "arm64"));

    let report = scheduler
        .schedule(
            TriggerEvent::manual("main").requesting("publish"),
            Arc::new(graph),
        )
        .await
        .unwrap();

    assert!(report.succeeded(), "{:?}", report.runs);
    let arm64 = report.run("arm64").unwrap();
    assert_eq!(arm64.resolved_parameters["env.CMAKE_PRESET"], "arm64-osx-release");
    assert_eq!(arm64.resolved_parameters["build.number"], "1");
    let written =
        std::fs::read_to_string(arm64.working_dir.as_ref().unwrap().join("preset.txt")).unwrap();
    assert_eq!(written.trim(), "arm64-osx-release");
}

#[tokio::test]
async fn test_unresolved_parameter_fails_before_steps() {
    let tmp = TempDir::new().unwrap();
    let scheduler = scheduler(&tmp, mac_agents());

    let graph = PipelineGraph::new()
        .with_node(
            BuildNode::new("n", "")
                .with_parameter("env.OUT", "%undefined_thing%")
                .with_step(StepSpec::script("x", "touch ran.txt")),
        )
        .unwrap();

    let report = scheduler
        .schedule(TriggerEvent::manual("main"), Arc::new(graph))
        .await
        .unwrap();

    let run = report.run("n").unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert!(matches!(run.reason, Some(FailureReason::Parameter { .. })));
    assert!(run.steps.is_empty());
}

#[tokio::test]
async fn test_cycle_creates_no_runs() {
    let tmp = TempDir::new().unwrap();
    let scheduler = scheduler(&tmp, mac_agents());

    let graph = PipelineGraph::new()
        .with_node(BuildNode::new("a", ""))
        .unwrap()
        .with_node(BuildNode::new("b", ""))
        .unwrap()
        .with_edge(DependencyEdge::new("a", "b"))
        .with_edge(DependencyEdge::new("b", "a"));

    let result = scheduler
        .start(TriggerEvent::manual("main"), Arc::new(graph))
        .await;
    assert!(matches!(result, Err(BuildgraphError::Cycle { .. })));
    assert!(!tmp.path().join("work").exists());
}

#[tokio::test]
async fn test_run_numbers_continue_across_schedulers() {
    let tmp = TempDir::new().unwrap();
    let graph = Arc::new(
        PipelineGraph::new()
            .with_node(
                BuildNode::new("pkg", "")
                    .with_step(StepSpec::script("x", "echo data > pkg.tar"))
                    .with_artifact_rule(ArtifactRule::preserve("pkg.tar", "")),
            )
            .unwrap(),
    );

    for expected in 1..=2u64 {
        let report = scheduler(&tmp, mac_agents())
            .schedule(TriggerEvent::manual("main"), Arc::clone(&graph))
            .await
            .unwrap();
        assert_eq!(report.run("pkg").unwrap().run_number, expected);
    }

    let store = FilesystemStore::new(tmp.path().join("store")).unwrap();
    assert_eq!(store.latest_run("pkg").await.unwrap(), Some(2));
    assert_eq!(store.prune(1).await.unwrap(), 1);
    assert!(store.manifest("pkg", 1).await.unwrap().is_none());
}
