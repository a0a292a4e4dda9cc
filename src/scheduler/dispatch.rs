// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 buildgraph contributors

//! Execution of a single run: upstream wait, admission, artifact fetch,
//! steps and publish.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::run::{FailureReason, RunInstance, RunStatus, StepOutcome, StepRecord};
use super::{RunEvent, Scheduler};
use crate::errors::BuildgraphResult;
use crate::executors::{cancelled, StepInvocation};
use crate::pipeline::params::{exported_env, ParameterScope};
use crate::pipeline::{BuildNode, DependencyEdge, ExecutionMode, FailureAction, StepSpec};

/// What downstream nodes learn about a finished run
#[derive(Debug, Clone)]
pub(crate) struct NodeOutcome {
    pub status: RunStatus,
    pub run_number: u64,
    pub parameters: BTreeMap<String, String>,
}

impl NodeOutcome {
    pub fn from_run(run: &RunInstance) -> Self {
        Self {
            status: run.status,
            run_number: run.run_number,
            parameters: run.resolved_parameters.clone(),
        }
    }
}

pub(crate) type OutcomeReceiver = watch::Receiver<Option<Arc<NodeOutcome>>>;

/// An upstream edge together with the upstream's outcome channel
pub(crate) struct UpstreamLink {
    pub edge: DependencyEdge,
    pub outcome: OutcomeReceiver,
}

/// Parameters of a run, re-resolved whenever a step sets one
struct ParameterContext {
    node_id: String,
    local: BTreeMap<String, String>,
    builtins: BTreeMap<String, String>,
    upstream: HashMap<String, BTreeMap<String, String>>,
    environment: Arc<HashMap<String, String>>,
}

impl ParameterContext {
    fn scope(&self) -> ParameterScope<'_> {
        self.builtins.iter().fold(
            ParameterScope::new(&self.node_id, &self.local)
                .with_upstream(&self.upstream)
                .with_environment(&self.environment),
            |scope, (k, v)| scope.with_builtin(k, v),
        )
    }

    fn resolve(&self, text: &str) -> BuildgraphResult<String> {
        self.scope().resolve(text)
    }

    fn resolve_all(&self) -> BuildgraphResult<BTreeMap<String, String>> {
        self.scope().resolve_all()
    }

    /// Record a value emitted by a step; it is taken literally
    fn set(&mut self, name: String, value: &str) {
        self.local.insert(name, value.replace('%', "%%"));
    }
}

/// One node's run within a schedule
pub(crate) struct NodeRun {
    pub scheduler: Scheduler,
    pub node: BuildNode,
    pub run_number: u64,
    pub source_ref: String,
    pub upstream: Vec<UpstreamLink>,
    pub cancel: watch::Receiver<bool>,
    pub events: mpsc::UnboundedSender<RunEvent>,
}

impl NodeRun {
    fn emit(&self, run: &RunInstance) {
        let _ = self.events.send(RunEvent {
            node_id: run.node_id.clone(),
            run_number: run.run_number,
            status: run.status,
            reason: run.reason.clone(),
        });
    }

    fn advance(&self, run: &mut RunInstance, status: RunStatus) {
        if let Err(e) = run.transition(status) {
            warn!("{}", e);
        }
        self.emit(run);
    }

    fn finish(&self, run: &mut RunInstance, status: RunStatus, reason: FailureReason) {
        match status {
            RunStatus::Cancelled => info!(node = %run.node_id, run = run.run_number, "Run cancelled"),
            _ => warn!(node = %run.node_id, run = run.run_number, %reason, "Run {}", status),
        }
        if let Err(e) = run.fail(status, reason) {
            warn!("{}", e);
        }
        self.emit(run);
    }

    /// Drive the run to a terminal state
    pub async fn execute(self) -> RunInstance {
        let mut run = RunInstance::new(&self.node.id, self.run_number);
        let mut cancel = self.cancel.clone();
        self.emit(&run);

        // Upstream outcomes, in edge order
        let outcomes = tokio::select! {
            outcomes = wait_for_upstream(&self.upstream) => outcomes,
            _ = cancelled(&mut cancel) => {
                self.finish(&mut run, RunStatus::Cancelled, FailureReason::Cancelled);
                return run;
            }
        };

        let mut culprits: Vec<String> = self
            .upstream
            .iter()
            .zip(&outcomes)
            .filter(|(link, outcome)| {
                link.edge.on_failure == FailureAction::FailToStart && outcome.status.is_failure()
            })
            .map(|(link, _)| link.edge.to.clone())
            .collect();
        culprits.sort();
        culprits.dedup();
        if !culprits.is_empty() {
            self.finish(
                &mut run,
                RunStatus::FailedToStart,
                FailureReason::UpstreamFailed { upstream: culprits },
            );
            return run;
        }

        // Admission: concurrency cap, then an agent
        let _permit = match self.node.max_concurrent_runs {
            Some(cap) => {
                let semaphore = self.scheduler.node_semaphore(&self.node.id, cap);
                tokio::select! {
                    permit = semaphore.acquire_owned() => permit.ok(),
                    _ = cancelled(&mut cancel) => {
                        self.finish(&mut run, RunStatus::Cancelled, FailureReason::Cancelled);
                        return run;
                    }
                }
            }
            None => None,
        };

        let lease = tokio::select! {
            lease = self.scheduler.agents.acquire(&self.node.id, &self.node.requirements) => lease,
            _ = cancelled(&mut cancel) => {
                self.finish(&mut run, RunStatus::Cancelled, FailureReason::Cancelled);
                return run;
            }
        };
        let lease = match lease {
            Ok(lease) => lease,
            Err(e) => {
                self.finish(&mut run, RunStatus::Failed, FailureReason::from_error(&e));
                return run;
            }
        };

        run.agent = Some(lease.agent().name.clone());
        self.advance(&mut run, RunStatus::Running);
        info!(
            node = %self.node.id,
            run = self.run_number,
            agent = %lease.agent().name,
            "Run started"
        );

        match self.dispatch(&mut run, &outcomes, cancel).await {
            Ok(None) => self.advance(&mut run, RunStatus::Succeeded),
            Ok(Some(RunEnd::Cancelled)) => {
                self.finish(&mut run, RunStatus::Cancelled, FailureReason::Cancelled)
            }
            Ok(Some(RunEnd::Failed(reason))) => self.finish(&mut run, RunStatus::Failed, reason),
            Err(e) => self.finish(&mut run, RunStatus::Failed, FailureReason::from_error(&e)),
        }

        if run.status == RunStatus::Succeeded {
            info!(
                node = %self.node.id,
                run = self.run_number,
                duration_ms = run.duration().unwrap_or_default().as_millis() as u64,
                "Run succeeded"
            );
        }

        run
    }

    /// Everything after admission. `Ok(None)` means success.
    async fn dispatch(
        &self,
        run: &mut RunInstance,
        outcomes: &[Arc<NodeOutcome>],
        cancel: watch::Receiver<bool>,
    ) -> BuildgraphResult<Option<RunEnd>> {
        let work_dir = self.working_dir();
        tokio::fs::create_dir_all(&work_dir).await?;
        run.working_dir = Some(work_dir.clone());

        let mut params = ParameterContext {
            node_id: self.node.id.clone(),
            local: self.node.parameters.clone(),
            builtins: BTreeMap::from([
                ("build.number".to_string(), self.run_number.to_string()),
                ("build.workingDir".to_string(), work_dir.to_string_lossy().into_owned()),
                ("node.id".to_string(), self.node.id.clone()),
                ("node.name".to_string(), self.node.display_name().to_string()),
                ("trigger.sourceRef".to_string(), self.source_ref.clone()),
            ]),
            upstream: self
                .upstream
                .iter()
                .zip(outcomes)
                .map(|(link, outcome)| (link.edge.to.clone(), outcome.parameters.clone()))
                .collect(),
            environment: Arc::clone(&self.scheduler.environment),
        };

        run.resolved_parameters = params.resolve_all()?;

        if let Some(reason) = self.fetch_artifacts(outcomes, &params, &work_dir).await? {
            return Ok(Some(RunEnd::Failed(reason)));
        }

        let end = self.run_steps(run, &mut params, &work_dir, cancel).await;
        run.resolved_parameters = params
            .resolve_all()
            .unwrap_or_else(|_| run.resolved_parameters.clone());
        if end.is_some() {
            return Ok(end);
        }

        if !self.node.artifact_rules.is_empty() {
            let rules = self
                .node
                .artifact_rules
                .iter()
                .map(|r| r.try_map_text(|t| params.resolve(t)))
                .collect::<BuildgraphResult<Vec<_>>>()?;
            self.scheduler
                .store
                .publish(&self.node.id, self.run_number, &work_dir, &rules)
                .await?;
        }

        Ok(None)
    }

    fn working_dir(&self) -> PathBuf {
        let dir = self
            .scheduler
            .config
            .workspace_dir
            .join(&self.node.id)
            .join(self.run_number.to_string());
        if dir.is_absolute() {
            return dir;
        }
        std::env::current_dir()
            .map(|cwd| cwd.join(&dir))
            .unwrap_or(dir)
    }

    /// Copy upstream artifacts according to each edge's failure policy
    async fn fetch_artifacts(
        &self,
        outcomes: &[Arc<NodeOutcome>],
        params: &ParameterContext,
        work_dir: &Path,
    ) -> BuildgraphResult<Option<FailureReason>> {
        for (link, outcome) in self.upstream.iter().zip(outcomes) {
            let edge = &link.edge;
            if outcome.status != RunStatus::Succeeded {
                debug!(node = %self.node.id, upstream = %edge.to, "Upstream did not succeed, skipping its artifacts");
                continue;
            }

            for rule in &edge.artifact_rules {
                let fetched = match rule.try_map_text(|t| params.resolve(t)) {
                    Ok(resolved) => {
                        self.scheduler
                            .store
                            .fetch(&edge.to, outcome.run_number, &resolved, work_dir)
                            .await
                    }
                    Err(e) => Err(e),
                };

                match fetched {
                    Ok(files) => debug!(
                        node = %self.node.id,
                        upstream = %edge.to,
                        files = files.len(),
                        "Fetched upstream artifacts"
                    ),
                    Err(e) if edge.on_failure == FailureAction::Ignore => {
                        warn!(node = %self.node.id, upstream = %edge.to, "Ignoring artifact error: {}", e)
                    }
                    Err(e) => return Ok(Some(FailureReason::from_error(&e))),
                }
            }
        }

        Ok(None)
    }

    /// Run steps in order. `None` means every executed step succeeded.
    async fn run_steps(
        &self,
        run: &mut RunInstance,
        params: &mut ParameterContext,
        work_dir: &Path,
        cancel: watch::Receiver<bool>,
    ) -> Option<RunEnd> {
        let mut failure: Option<FailureReason> = None;
        let mut was_cancelled = false;

        for step in &self.node.steps {
            was_cancelled |= *cancel.borrow();

            if !step.enabled {
                run.steps.push(StepRecord::not_executed(&step.name, StepOutcome::Disabled));
                continue;
            }
            if !step.should_run(failure.is_some() || was_cancelled) {
                debug!(node = %self.node.id, step = %step.name, "Skipping step");
                run.steps.push(StepRecord::not_executed(&step.name, StepOutcome::Skipped));
                continue;
            }

            let invocation = match self.invocation(step, params, work_dir).await {
                Ok(invocation) => invocation,
                Err(e) => {
                    failure.get_or_insert(FailureReason::from_error(&e));
                    run.steps.push(StepRecord::not_executed(&step.name, StepOutcome::Skipped));
                    continue;
                }
            };

            // cleanup steps run to completion even when the run is cancelled
            let step_cancel = match step.mode {
                ExecutionMode::Normal => cancel.clone(),
                ExecutionMode::Always => watch::channel(false).1,
            };

            match self.scheduler.runner.run(&invocation, step_cancel).await {
                Ok(output) => {
                    run.steps.push(StepRecord {
                        name: step.name.clone(),
                        outcome: StepOutcome::Executed,
                        exit_code: output.exit_code,
                        duration: output.duration,
                    });
                    for (name, value) in &output.parameters {
                        params.set(name.clone(), value);
                    }

                    if output.cancelled {
                        was_cancelled = true;
                    } else if !output.success() {
                        failure.get_or_insert(FailureReason::StepFailure {
                            step: step.name.clone(),
                            exit_code: output.exit_code,
                        });
                    }
                }
                Err(e) => {
                    run.steps.push(StepRecord {
                        name: step.name.clone(),
                        outcome: StepOutcome::Executed,
                        exit_code: None,
                        duration: Duration::ZERO,
                    });
                    failure.get_or_insert(FailureReason::from_error(&e));
                }
            }
        }

        if was_cancelled || *cancel.borrow() {
            Some(RunEnd::Cancelled)
        } else {
            failure.map(RunEnd::Failed)
        }
    }

    async fn invocation(
        &self,
        step: &StepSpec,
        params: &ParameterContext,
        work_dir: &Path,
    ) -> BuildgraphResult<StepInvocation> {
        let program = params.resolve(&step.command)?;
        let args = step
            .args
            .iter()
            .map(|a| params.resolve(a))
            .collect::<BuildgraphResult<Vec<_>>>()?;

        let dir = match &step.working_dir {
            Some(dir) => {
                let dir = work_dir.join(params.resolve(dir)?);
                tokio::fs::create_dir_all(&dir).await?;
                dir
            }
            None => work_dir.to_path_buf(),
        };

        let mut env = exported_env(&params.resolve_all()?);
        for (key, value) in &step.env {
            env.insert(key.clone(), params.resolve(value)?);
        }

        let timeout = step
            .timeout_secs
            .or(self.scheduler.config.default_step_timeout_secs)
            .map(Duration::from_secs);

        Ok(StepInvocation {
            node_id: self.node.id.clone(),
            step_name: step.name.clone(),
            program,
            args,
            working_dir: dir,
            env,
            timeout,
        })
    }
}

/// Non-successful end of a dispatched run
enum RunEnd {
    Failed(FailureReason),
    Cancelled,
}

/// Wait until every upstream has a terminal outcome.
///
/// An upstream whose task vanished without reporting counts as failed.
async fn wait_for_upstream(links: &[UpstreamLink]) -> Vec<Arc<NodeOutcome>> {
    let mut outcomes = Vec::with_capacity(links.len());
    for link in links {
        let mut rx = link.outcome.clone();
        let outcome = loop {
            let current = rx.borrow_and_update().clone();
            if let Some(outcome) = current {
                break outcome;
            }
            if rx.changed().await.is_err() {
                break Arc::new(NodeOutcome {
                    status: RunStatus::Failed,
                    run_number: 0,
                    parameters: BTreeMap::new(),
                });
            }
        };
        outcomes.push(outcome);
    }
    outcomes
}
