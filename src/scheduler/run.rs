// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 buildgraph contributors

//! Run instances and their lifecycle

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use crate::errors::{BuildgraphError, BuildgraphResult};

/// Lifecycle state of a run
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    FailedToStart,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Queued | Self::Running)
    }

    /// Terminal and not successful
    pub fn is_failure(self) -> bool {
        matches!(self, Self::Failed | Self::FailedToStart | Self::Cancelled)
    }

    pub fn can_transition_to(self, next: RunStatus) -> bool {
        match self {
            Self::Queued => matches!(
                next,
                Self::Running | Self::Failed | Self::FailedToStart | Self::Cancelled
            ),
            Self::Running => matches!(next, Self::Succeeded | Self::Failed | Self::Cancelled),
            _ => false,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::FailedToStart => "failed to start",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Why a run did not succeed
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum FailureReason {
    StepFailure { step: String, exit_code: Option<i32> },
    StepTimeout { step: String, timeout_secs: u64 },
    StepLaunch { step: String, error: String },
    NoAgentAvailable { waited_secs: u64 },
    ArtifactNotFound { node: String, run_number: u64, pattern: String },
    Artifact { message: String },
    Parameter { message: String },
    Workspace { message: String },
    UpstreamFailed { upstream: Vec<String> },
    Cancelled,
}

impl FailureReason {
    /// Classify an error raised while a run executes
    pub fn from_error(error: &BuildgraphError) -> Self {
        match error {
            BuildgraphError::StepLaunch { step, error, .. } => Self::StepLaunch {
                step: step.clone(),
                error: error.clone(),
            },
            BuildgraphError::StepTimeout { step, timeout_secs } => Self::StepTimeout {
                step: step.clone(),
                timeout_secs: *timeout_secs,
            },
            BuildgraphError::NoAgentAvailable { waited_secs, .. } => Self::NoAgentAvailable {
                waited_secs: *waited_secs,
            },
            BuildgraphError::ArtifactNotFound {
                node,
                run_number,
                pattern,
            } => Self::ArtifactNotFound {
                node: node.clone(),
                run_number: *run_number,
                pattern: pattern.clone(),
            },
            BuildgraphError::ArtifactConflict { .. }
            | BuildgraphError::ArtifactCorrupted { .. }
            | BuildgraphError::InvalidArtifactRule { .. }
            | BuildgraphError::GlobPattern { .. } => Self::Artifact {
                message: error.to_string(),
            },
            BuildgraphError::UnresolvedParameter { .. }
            | BuildgraphError::ParameterRecursion { .. } => Self::Parameter {
                message: error.to_string(),
            },
            other => Self::Workspace {
                message: other.to_string(),
            },
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StepFailure {
                step,
                exit_code: Some(code),
            } => write!(f, "step '{}' exited with code {}", step, code),
            Self::StepFailure {
                step,
                exit_code: None,
            } => write!(f, "step '{}' was terminated by a signal", step),
            Self::StepTimeout { step, timeout_secs } => {
                write!(f, "step '{}' timed out after {}s", step, timeout_secs)
            }
            Self::StepLaunch { step, error } => write!(f, "step '{}' could not start: {}", step, error),
            Self::NoAgentAvailable { waited_secs } => {
                write!(f, "no compatible agent after {}s", waited_secs)
            }
            Self::ArtifactNotFound {
                node,
                run_number,
                pattern,
            } => write!(f, "no artifacts of '{}' #{} matched '{}'", node, run_number, pattern),
            Self::Artifact { message } | Self::Parameter { message } | Self::Workspace { message } => {
                write!(f, "{}", message)
            }
            Self::UpstreamFailed { upstream } => {
                write!(f, "upstream failed: {}", upstream.join(", "))
            }
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// What happened to a step
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Executed,
    /// Skipped after an earlier failure or cancellation
    Skipped,
    Disabled,
}

/// Per-step record of a run
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StepRecord {
    pub name: String,
    pub outcome: StepOutcome,
    pub exit_code: Option<i32>,
    pub duration: Duration,
}

impl StepRecord {
    pub fn not_executed(name: impl Into<String>, outcome: StepOutcome) -> Self {
        Self {
            name: name.into(),
            outcome,
            exit_code: None,
            duration: Duration::ZERO,
        }
    }
}

/// One execution of a node
#[derive(Debug, Clone, Serialize)]
pub struct RunInstance {
    pub node_id: String,
    pub run_number: u64,
    pub status: RunStatus,
    pub queued_at: SystemTime,
    pub started_at: Option<SystemTime>,
    pub finished_at: Option<SystemTime>,
    pub resolved_parameters: BTreeMap<String, String>,
    pub agent: Option<String>,
    pub working_dir: Option<PathBuf>,
    pub reason: Option<FailureReason>,
    pub steps: Vec<StepRecord>,
}

impl RunInstance {
    pub fn new(node_id: impl Into<String>, run_number: u64) -> Self {
        Self {
            node_id: node_id.into(),
            run_number,
            status: RunStatus::Queued,
            queued_at: SystemTime::now(),
            started_at: None,
            finished_at: None,
            resolved_parameters: BTreeMap::new(),
            agent: None,
            working_dir: None,
            reason: None,
            steps: vec![],
        }
    }

    /// Move to `next`, rejecting transitions out of terminal states
    pub fn transition(&mut self, next: RunStatus) -> BuildgraphResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(BuildgraphError::InvalidTransition {
                node: self.node_id.clone(),
                run_number: self.run_number,
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }

        let now = SystemTime::now();
        if next == RunStatus::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.finished_at = Some(now);
        }
        self.status = next;
        Ok(())
    }

    /// Move to a failing terminal state with a reason
    pub fn fail(&mut self, status: RunStatus, reason: FailureReason) -> BuildgraphResult<()> {
        self.transition(status)?;
        self.reason = Some(reason);
        Ok(())
    }

    /// Time spent running, when the run started and finished
    pub fn duration(&self) -> Option<Duration> {
        let started = self.started_at?;
        self.finished_at?.duration_since(started).ok()
    }
}

/// Outcome of one schedule
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScheduleReport {
    /// Runs in topological order
    pub runs: Vec<RunInstance>,
}

impl ScheduleReport {
    pub fn run(&self, node_id: &str) -> Option<&RunInstance> {
        self.runs.iter().find(|r| r.node_id == node_id)
    }

    pub fn status(&self, node_id: &str) -> Option<RunStatus> {
        self.run(node_id).map(|r| r.status)
    }

    /// Every run succeeded
    pub fn succeeded(&self) -> bool {
        self.runs.iter().all(|r| r.status == RunStatus::Succeeded)
    }

    pub fn count(&self, status: RunStatus) -> usize {
        self.runs.iter().filter(|r| r.status == status).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &RunInstance> {
        self.runs.iter().filter(|r| r.status.is_failure())
    }
}
