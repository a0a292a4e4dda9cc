// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 buildgraph contributors

//! Process step runner
//!
//! Spawns the step program directly (no shell), streams its output into the
//! log and collects it for the run record.

use async_trait::async_trait;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::messages::{parse_service_message, ServiceMessage};
use super::{cancelled, StepInvocation, StepOutput, StepRunner};
use crate::errors::{BuildgraphError, BuildgraphResult};

/// How long output readers may lag behind an exited process
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Runs steps as child processes of the current host
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

enum Outcome {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

#[async_trait]
impl StepRunner for ProcessRunner {
    async fn run(
        &self,
        invocation: &StepInvocation,
        mut cancel: watch::Receiver<bool>,
    ) -> BuildgraphResult<StepOutput> {
        let start = Instant::now();

        info!(
            node = %invocation.node_id,
            step = %invocation.step_name,
            program = %invocation.program,
            "Starting step"
        );

        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .current_dir(&invocation.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd.envs(&invocation.env);

        let mut child = cmd.spawn().map_err(|e| {
            BuildgraphError::step_launch(&invocation.step_name, &invocation.program, e)
        })?;

        let stdout = child
            .stdout
            .take()
            .map(|s| spawn_reader(s, invocation.step_name.clone(), false));
        let stderr = child
            .stderr
            .take()
            .map(|s| spawn_reader(s, invocation.step_name.clone(), true));

        let deadline = async {
            match invocation.timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };

        let outcome = tokio::select! {
            status = child.wait() => Outcome::Exited(status),
            _ = deadline => Outcome::TimedOut,
            _ = cancelled(&mut cancel) => Outcome::Cancelled,
        };

        let mut output = StepOutput::default();
        match outcome {
            Outcome::Exited(status) => {
                let status = status.map_err(|e| {
                    BuildgraphError::step_launch(&invocation.step_name, &invocation.program, e)
                })?;
                output.exit_code = status.code();
            }
            Outcome::TimedOut => {
                let limit = invocation.timeout.unwrap_or_default();
                warn!(
                    step = %invocation.step_name,
                    timeout_secs = limit.as_secs(),
                    "Step timed out, killing process"
                );
                let _ = child.kill().await;
                drain(stdout).await;
                drain(stderr).await;
                return Err(BuildgraphError::StepTimeout {
                    step: invocation.step_name.clone(),
                    timeout_secs: limit.as_secs(),
                });
            }
            Outcome::Cancelled => {
                warn!(step = %invocation.step_name, "Step cancelled, killing process");
                let _ = child.kill().await;
                output.cancelled = true;
            }
        }

        output.stdout = drain(stdout).await;
        output.stderr = drain(stderr).await;
        output.duration = start.elapsed();

        if !output.cancelled {
            for message in output.stdout.lines().filter_map(parse_service_message) {
                let ServiceMessage::SetParameter { name, value } = message;
                debug!(step = %invocation.step_name, %name, %value, "Step set parameter");
                output.parameters.insert(name, value);
            }
        }

        debug!(
            step = %invocation.step_name,
            exit_code = ?output.exit_code,
            duration_ms = output.duration.as_millis() as u64,
            "Step finished"
        );

        Ok(output)
    }
}

fn spawn_reader<R>(stream: R, step: String, is_stderr: bool) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        let mut collected = String::new();
        while let Ok(Some(line)) = lines.next_line().await {
            if is_stderr {
                debug!(step = %step, "stderr: {}", line);
            } else {
                debug!(step = %step, "{}", line);
            }
            collected.push_str(&line);
            collected.push('\n');
        }
        collected
    })
}

/// Collect a reader's output; give up if a lingering grandchild keeps the
/// pipe open
async fn drain(reader: Option<JoinHandle<String>>) -> String {
    let Some(mut handle) = reader else {
        return String::new();
    };

    match tokio::time::timeout(DRAIN_GRACE, &mut handle).await {
        Ok(Ok(text)) => text,
        Ok(Err(_)) => String::new(),
        Err(_) => {
            handle.abort();
            String::new()
        }
    }
}
