// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 buildgraph contributors

//! Scheduler
//!
//! Turns a trigger into run instances for the requested node and everything
//! it depends on, and drives each run on its own tokio task. Runs wait for
//! their upstreams, the node's concurrency cap and a compatible agent, in
//! that order.

mod agents;
mod dispatch;
mod run;
mod trigger;

pub use agents::{Agent, AgentLease, AgentPool};
pub use run::{
    FailureReason, RunInstance, RunStatus, ScheduleReport, StepOutcome, StepRecord,
};
pub use trigger::{ReverseParameters, TriggerEvent};

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::artifacts::ArtifactStore;
use crate::errors::{BuildgraphError, BuildgraphResult};
use crate::executors::StepRunner;
use crate::pipeline::{PipelineGraph, SchedulerConfig};
use dispatch::{NodeOutcome, NodeRun, UpstreamLink};

/// Status change of a run
#[derive(Debug, Clone)]
pub struct RunEvent {
    pub node_id: String,
    pub run_number: u64,
    pub status: RunStatus,
    pub reason: Option<FailureReason>,
}

/// Build scheduler
///
/// Cheap to clone; clones share run numbering and concurrency caps.
#[derive(Clone)]
pub struct Scheduler {
    agents: Arc<AgentPool>,
    runner: Arc<dyn StepRunner>,
    store: Arc<dyn ArtifactStore>,
    config: Arc<SchedulerConfig>,
    environment: Arc<HashMap<String, String>>,
    run_numbers: Arc<tokio::sync::Mutex<HashMap<String, u64>>>,
    node_locks: Arc<Mutex<HashMap<String, Arc<Semaphore>>>>,
}

impl Scheduler {
    pub fn new(
        agents: AgentPool,
        runner: Arc<dyn StepRunner>,
        store: Arc<dyn ArtifactStore>,
        config: SchedulerConfig,
    ) -> Self {
        let agents = agents.with_timing(
            Duration::from_secs(config.agent_wait_timeout_secs),
            Duration::from_millis(config.agent_poll_interval_ms),
        );

        Self {
            agents: Arc::new(agents),
            runner,
            store,
            config: Arc::new(config),
            environment: Arc::new(std::env::vars().collect()),
            run_numbers: Arc::default(),
            node_locks: Arc::default(),
        }
    }

    /// Replace the environment used as the last parameter lookup
    pub fn with_environment(mut self, environment: HashMap<String, String>) -> Self {
        self.environment = Arc::new(environment);
        self
    }

    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.store
    }

    pub fn agents(&self) -> &AgentPool {
        &self.agents
    }

    /// Run a schedule to completion
    pub async fn schedule(
        &self,
        trigger: TriggerEvent,
        graph: Arc<PipelineGraph>,
    ) -> BuildgraphResult<ScheduleReport> {
        Ok(self.start(trigger, graph).await?.wait().await)
    }

    /// Start a schedule and return immediately.
    ///
    /// The graph is validated first; definition errors prevent any run from
    /// being created.
    pub async fn start(
        &self,
        trigger: TriggerEvent,
        graph: Arc<PipelineGraph>,
    ) -> BuildgraphResult<ScheduleHandle> {
        let target = Arc::new(prepare_graph(&graph, &trigger)?);
        let order = target.topological_order()?;

        info!(
            nodes = order.len(),
            source_ref = %trigger.source_ref,
            manual = trigger.is_manual,
            changes = trigger.change_set.len(),
            "Starting schedule"
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let mut senders = HashMap::new();
        let mut receivers = HashMap::new();
        for id in &order {
            let (tx, rx) = watch::channel(None::<Arc<NodeOutcome>>);
            senders.insert(id.clone(), tx);
            receivers.insert(id.clone(), rx);
        }

        let mut cancels = BTreeMap::new();
        let mut tasks = Vec::with_capacity(order.len());

        for id in &order {
            let node = target
                .node(id)
                .cloned()
                .ok_or_else(|| BuildgraphError::NodeNotFound { id: id.clone() })?;
            let outcome_tx = senders
                .remove(id)
                .ok_or_else(|| BuildgraphError::NodeNotFound { id: id.clone() })?;
            let run_number = self.next_run_number(id).await?;

            let upstream = target
                .upstream_edges(id)
                .into_iter()
                .filter_map(|edge| {
                    receivers.get(&edge.to).map(|rx| UpstreamLink {
                        edge: edge.clone(),
                        outcome: rx.clone(),
                    })
                })
                .collect();

            let (cancel_tx, cancel_rx) = watch::channel(false);
            cancels.insert(id.clone(), cancel_tx);

            let node_run = NodeRun {
                scheduler: self.clone(),
                node,
                run_number,
                source_ref: trigger.source_ref.clone(),
                upstream,
                cancel: cancel_rx,
                events: events_tx.clone(),
            };

            let task = tokio::spawn(async move {
                let run = node_run.execute().await;
                outcome_tx.send_replace(Some(Arc::new(NodeOutcome::from_run(&run))));
                run
            });
            tasks.push((id.clone(), run_number, task));
        }

        Ok(ScheduleHandle {
            tasks,
            canceller: Canceller {
                senders: Arc::new(cancels),
            },
            events: Some(events_rx),
        })
    }

    /// Semaphore bounding concurrent runs of one node, shared across schedules
    fn node_semaphore(&self, id: &str, cap: usize) -> Arc<Semaphore> {
        let mut locks = self.node_locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            locks
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(cap.max(1)))),
        )
    }

    /// Next run number of a node, continuing after runs of earlier sessions
    async fn next_run_number(&self, id: &str) -> BuildgraphResult<u64> {
        let mut numbers = self.run_numbers.lock().await;
        let last = match numbers.get(id) {
            Some(last) => *last,
            None => {
                let stored = self.store.latest_run(id).await?.unwrap_or(0);
                stored.max(latest_workspace_run(&self.config.workspace_dir.join(id)).await)
            }
        };
        let next = last + 1;
        numbers.insert(id.to_string(), next);
        Ok(next)
    }
}

/// Highest numbered run directory below a node's workspace
async fn latest_workspace_run(dir: &Path) -> u64 {
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return 0;
    };

    let mut latest = 0;
    while let Ok(Some(entry)) = entries.next_entry().await {
        if let Some(number) = entry.file_name().to_str().and_then(|n| n.parse::<u64>().ok()) {
            latest = latest.max(number);
        }
    }
    latest
}

/// Restrict the graph to the requested closure and apply reverse and
/// trigger parameter overrides.
///
/// Each node's `reverse.dep.*` parameters reach its transitive upstreams,
/// never the node itself. On conflicts the closest downstream wins, ties
/// going to the one earlier in execution order. The trigger's reverse
/// overrides apply last, to every node except the requested one.
fn prepare_graph(graph: &PipelineGraph, trigger: &TriggerEvent) -> BuildgraphResult<PipelineGraph> {
    graph.validate()?;

    let requested = trigger.requested_node_id.as_deref();
    let mut target = match requested {
        Some(id) => graph.subgraph(&graph.dependency_closure(id)?),
        None => graph.clone(),
    };
    let order = target.topological_order()?;

    let mut pushed: BTreeMap<String, BTreeMap<String, (usize, String)>> = BTreeMap::new();
    for source in &order {
        let Some(node) = target.node(source) else {
            continue;
        };
        let reverse = ReverseParameters::collect([&node.parameters]);
        if reverse.is_empty() {
            continue;
        }

        let upstreams = target.upstream_distances(source);
        for id in reverse.targets() {
            if !upstreams.contains_key(id) {
                warn!(
                    node = %source,
                    "Reverse parameters target '{}', which is not an upstream in this schedule",
                    id
                );
            }
        }

        for (upstream, distance) in upstreams {
            let params = pushed.entry(upstream.clone()).or_default();
            for (key, value) in reverse.for_node(&upstream) {
                match params.entry(key) {
                    Entry::Vacant(slot) => {
                        slot.insert((distance, value));
                    }
                    Entry::Occupied(mut slot) if distance < slot.get().0 => {
                        slot.insert((distance, value));
                    }
                    Entry::Occupied(_) => {}
                }
            }
        }
    }

    let from_trigger = ReverseParameters::collect([&trigger.parameters]);
    for id in from_trigger.targets() {
        if target.node(id).is_none() {
            warn!("Reverse parameters target '{}', which is not part of this schedule", id);
        }
    }

    for id in order {
        let requested_here = requested == Some(id.as_str());
        let Some(node) = target.node_mut(&id) else {
            continue;
        };

        if let Some(params) = pushed.remove(&id) {
            node.parameters
                .extend(params.into_iter().map(|(key, (_, value))| (key, value)));
        }
        if !requested_here {
            node.parameters.extend(from_trigger.for_node(&id));
        }
        if requested.is_none() || requested_here {
            for (key, value) in trigger.direct_parameters() {
                node.parameters.insert(key.clone(), value.clone());
            }
        }
    }

    Ok(target)
}

/// Cancels runs of a started schedule; cheap to clone
#[derive(Debug, Clone)]
pub struct Canceller {
    senders: Arc<BTreeMap<String, watch::Sender<bool>>>,
}

impl Canceller {
    /// Cancel one node's run.
    ///
    /// A queued run ends without side effects; a running one has its current
    /// step killed, skips the remaining normal steps and still runs its
    /// `always` steps.
    pub fn cancel(&self, node_id: &str) -> BuildgraphResult<()> {
        let sender = self
            .senders
            .get(node_id)
            .ok_or_else(|| BuildgraphError::NodeNotFound {
                id: node_id.to_string(),
            })?;
        sender.send_replace(true);
        Ok(())
    }

    pub fn cancel_all(&self) {
        for sender in self.senders.values() {
            sender.send_replace(true);
        }
    }
}

/// Handle to a running schedule
pub struct ScheduleHandle {
    tasks: Vec<(String, u64, JoinHandle<RunInstance>)>,
    canceller: Canceller,
    events: Option<mpsc::UnboundedReceiver<RunEvent>>,
}

impl ScheduleHandle {
    /// Node ids of the schedule in execution order
    pub fn nodes(&self) -> Vec<&str> {
        self.tasks.iter().map(|(id, _, _)| id.as_str()).collect()
    }

    pub fn cancel(&self, node_id: &str) -> BuildgraphResult<()> {
        self.canceller.cancel(node_id)
    }

    pub fn cancel_all(&self) {
        self.canceller.cancel_all()
    }

    /// Canceller usable while [`wait`](Self::wait) is pending
    pub fn canceller(&self) -> Canceller {
        self.canceller.clone()
    }

    /// Stream of status changes; available once
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<RunEvent>> {
        self.events.take()
    }

    /// Wait for every run to reach a terminal state
    pub async fn wait(self) -> ScheduleReport {
        let mut runs = Vec::with_capacity(self.tasks.len());

        for (id, run_number, task) in self.tasks {
            match task.await {
                Ok(run) => runs.push(run),
                Err(e) => {
                    let mut run = RunInstance::new(id, run_number);
                    let _ = run.fail(
                        RunStatus::Failed,
                        FailureReason::Workspace {
                            message: format!("run task aborted: {}", e),
                        },
                    );
                    runs.push(run);
                }
            }
        }

        let report = ScheduleReport { runs };
        info!(
            succeeded = report.count(RunStatus::Succeeded),
            failed = report.count(RunStatus::Failed),
            failed_to_start = report.count(RunStatus::FailedToStart),
            cancelled = report.count(RunStatus::Cancelled),
            "Schedule finished"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{BuildNode, DependencyEdge};

    fn graph() -> PipelineGraph {
        PipelineGraph::new()
            .with_node(
                BuildNode::new("arm64", "")
                    .with_parameter("reverse.dep.*.carbon_ref", "refs/heads/arm"),
            )
            .unwrap()
            .with_node(BuildNode::new("x64", ""))
            .unwrap()
            .with_node(
                BuildNode::new("publish", "")
                    .with_parameter("reverse.dep.*.carbon_ref", "refs/heads/main")
                    .with_parameter("reverse.dep.x64.env.CMAKE_PRESET", "x64-release"),
            )
            .unwrap()
            .with_node(BuildNode::new("docs", ""))
            .unwrap()
            .with_edge(DependencyEdge::new("publish", "arm64"))
            .with_edge(DependencyEdge::new("publish", "x64"))
    }

    #[test]
    fn test_prepare_graph_targets_closure() {
        let trigger = TriggerEvent::manual("refs/heads/main").requesting("publish");
        let target = prepare_graph(&graph(), &trigger).unwrap();

        assert_eq!(target.len(), 3);
        assert!(target.node("docs").is_none());

        let x64 = target.node("x64").unwrap();
        assert_eq!(x64.parameters["carbon_ref"], "refs/heads/main");
        assert_eq!(x64.parameters["env.CMAKE_PRESET"], "x64-release");
        // a downstream's reverse parameters win over the upstream's own
        assert_eq!(target.node("arm64").unwrap().parameters["carbon_ref"], "refs/heads/main");
        assert!(!target.node("publish").unwrap().parameters.contains_key("carbon_ref"));
    }

    fn chain() -> PipelineGraph {
        PipelineGraph::new()
            .with_node(BuildNode::new("x64", "").with_parameter("carbon_ref", "own"))
            .unwrap()
            .with_node(BuildNode::new("arm64", ""))
            .unwrap()
            .with_node(
                BuildNode::new("universal", "")
                    .with_parameter("reverse.dep.x64.carbon_ref", "from-universal"),
            )
            .unwrap()
            .with_node(
                BuildNode::new("publish", "")
                    .with_parameter("carbon_ref", "publish-own")
                    .with_parameter("reverse.dep.*.carbon_ref", "from-publish"),
            )
            .unwrap()
            .with_edge(DependencyEdge::new("universal", "x64"))
            .with_edge(DependencyEdge::new("universal", "arm64"))
            .with_edge(DependencyEdge::new("publish", "universal"))
    }

    fn carbon_ref<'a>(graph: &'a PipelineGraph, id: &str) -> Option<&'a str> {
        graph
            .node(id)
            .and_then(|n| n.parameters.get("carbon_ref"))
            .map(String::as_str)
    }

    #[test]
    fn test_reverse_parameters_apply_without_requested_node() {
        let target = prepare_graph(&chain(), &TriggerEvent::manual("main")).unwrap();

        assert_eq!(target.len(), 4);
        assert_eq!(carbon_ref(&target, "x64"), Some("from-universal"));
        assert_eq!(carbon_ref(&target, "arm64"), Some("from-publish"));
        assert_eq!(carbon_ref(&target, "universal"), Some("from-publish"));
        assert_eq!(carbon_ref(&target, "publish"), Some("publish-own"));
    }

    #[test]
    fn test_closest_downstream_wins() {
        let trigger = TriggerEvent::manual("main").requesting("publish");
        let target = prepare_graph(&chain(), &trigger).unwrap();

        // universal is one edge from x64, publish is two
        assert_eq!(carbon_ref(&target, "x64"), Some("from-universal"));
        assert_eq!(carbon_ref(&target, "universal"), Some("from-publish"));
        assert_eq!(carbon_ref(&target, "publish"), Some("publish-own"));

        let partial = prepare_graph(&chain(), &TriggerEvent::manual("main").requesting("universal"))
            .unwrap();
        assert!(partial.node("publish").is_none());
        assert_eq!(carbon_ref(&partial, "x64"), Some("from-universal"));
        assert_eq!(carbon_ref(&partial, "arm64"), None);
    }

    #[test]
    fn test_prepare_graph_trigger_parameters() {
        let trigger = TriggerEvent::manual("refs/heads/main")
            .requesting("publish")
            .with_parameter("perforce_path", "vendor/test")
            .with_parameter("reverse.dep.*.carbon_ref", "refs/tags/v2");
        let target = prepare_graph(&graph(), &trigger).unwrap();

        assert_eq!(target.node("publish").unwrap().parameters["perforce_path"], "vendor/test");
        assert!(!target.node("x64").unwrap().parameters.contains_key("perforce_path"));
        assert_eq!(target.node("x64").unwrap().parameters["carbon_ref"], "refs/tags/v2");
    }

    #[test]
    fn test_prepare_graph_unknown_node() {
        let trigger = TriggerEvent::manual("main").requesting("missing");
        assert!(matches!(
            prepare_graph(&graph(), &trigger),
            Err(BuildgraphError::NodeNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_latest_workspace_run() {
        let dir = tempfile::TempDir::new().unwrap();
        for name in ["1", "7", "notes", "3"] {
            std::fs::create_dir(dir.path().join(name)).unwrap();
        }
        assert_eq!(latest_workspace_run(dir.path()).await, 7);
        assert_eq!(latest_workspace_run(&dir.path().join("missing")).await, 0);
    }
}
