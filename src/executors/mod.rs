// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 buildgraph contributors

//! Step execution
//!
//! This module provides the step runner trait and the process-based
//! implementation used on agents.

mod messages;
mod process;

pub use messages::{parse_service_message, ServiceMessage};
pub use process::ProcessRunner;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;

use crate::errors::BuildgraphResult;

/// One fully resolved external command
#[derive(Debug, Clone)]
pub struct StepInvocation {
    /// Node the step belongs to
    pub node_id: String,

    /// Step name, used in logs and errors
    pub step_name: String,

    /// Program to execute
    pub program: String,

    /// Program arguments
    pub args: Vec<String>,

    /// Working directory
    pub working_dir: PathBuf,

    /// Environment added on top of the inherited one
    pub env: BTreeMap<String, String>,

    /// Kill the process after this long
    pub timeout: Option<Duration>,
}

impl StepInvocation {
    pub fn new(
        node_id: impl Into<String>,
        step_name: impl Into<String>,
        program: impl Into<String>,
        working_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            step_name: step_name.into(),
            program: program.into(),
            args: vec![],
            working_dir: working_dir.into(),
            env: BTreeMap::new(),
            timeout: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Result of a step that was launched
#[derive(Debug, Clone, Default)]
pub struct StepOutput {
    /// Exit code; `None` when the process was killed
    pub exit_code: Option<i32>,

    /// Standard output
    pub stdout: String,

    /// Standard error
    pub stderr: String,

    /// Wall-clock duration
    pub duration: Duration,

    /// Parameters set through service messages
    pub parameters: BTreeMap<String, String>,

    /// The step was interrupted by a cancellation request
    pub cancelled: bool,
}

impl StepOutput {
    pub fn success(&self) -> bool {
        !self.cancelled && self.exit_code == Some(0)
    }
}

/// Trait for step runners
#[async_trait]
pub trait StepRunner: Send + Sync {
    /// Run one step to completion.
    ///
    /// Fails with `StepLaunch` when the program cannot be started and
    /// `StepTimeout` when it outlives `invocation.timeout`. Setting `cancel`
    /// to `true` kills the process; the output is then marked cancelled.
    async fn run(
        &self,
        invocation: &StepInvocation,
        cancel: watch::Receiver<bool>,
    ) -> BuildgraphResult<StepOutput>;
}

/// Resolve once `cancel` becomes `true`; never resolves if the sender is
/// dropped first.
pub async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancelled_resolves_on_signal() {
        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move { cancelled(&mut rx).await });

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_pending_when_sender_dropped() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);

        let result = tokio::time::timeout(Duration::from_millis(50), cancelled(&mut rx)).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_output_success() {
        let ok = StepOutput {
            exit_code: Some(0),
            ..Default::default()
        };
        assert!(ok.success());

        let killed = StepOutput {
            exit_code: Some(0),
            cancelled: true,
            ..Default::default()
        };
        assert!(!killed.success());
    }
}
