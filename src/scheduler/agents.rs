// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 buildgraph contributors

//! Agents and requirement matching
//!
//! An agent runs one node at a time. Nodes lease a compatible idle agent
//! from the pool and hand it back when the lease is dropped.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::errors::{BuildgraphError, BuildgraphResult};
use crate::pipeline::{AgentAttribute, Requirement};

/// Execution host description
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Agent {
    pub name: String,

    /// Operating system name, e.g. `Mac OS X`, `Windows 10`, `Linux`
    pub os_name: String,

    /// CPU architecture, e.g. `aarch64`, `x86_64`
    pub os_arch: String,

    /// Free disk space in bytes, when known
    #[serde(default)]
    pub available_disk_space: Option<u64>,
}

impl Agent {
    pub fn new(
        name: impl Into<String>,
        os_name: impl Into<String>,
        os_arch: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            os_name: os_name.into(),
            os_arch: os_arch.into(),
            available_disk_space: None,
        }
    }

    pub fn with_disk_space(mut self, bytes: u64) -> Self {
        self.available_disk_space = Some(bytes);
        self
    }

    /// The machine buildgraph is running on
    pub fn local() -> Self {
        let os_name = match std::env::consts::OS {
            "macos" => "Mac OS X",
            "windows" => "Windows",
            "linux" => "Linux",
            other => other,
        };
        let name = std::env::var("HOSTNAME")
            .or_else(|_| std::env::var("COMPUTERNAME"))
            .unwrap_or_else(|_| "local".to_string());

        Self::new(name, os_name, std::env::consts::ARCH)
    }

    fn attribute(&self, attribute: AgentAttribute) -> &str {
        match attribute {
            AgentAttribute::OsName => &self.os_name,
            AgentAttribute::OsArch => &self.os_arch,
            AgentAttribute::Name => &self.name,
        }
    }

    /// Whether every requirement holds for this agent
    pub fn satisfies(&self, requirements: &[Requirement]) -> bool {
        requirements.iter().all(|r| r.matches(self))
    }
}

impl Requirement {
    /// Evaluate the predicate against an agent.
    ///
    /// An agent that does not report its disk space satisfies disk
    /// requirements.
    pub fn matches(&self, agent: &Agent) -> bool {
        match self {
            Self::StartsWith { attribute, value } => agent.attribute(*attribute).starts_with(value),
            Self::Contains { attribute, value } => agent.attribute(*attribute).contains(value),
            Self::DoesNotContain { attribute, value } => {
                !agent.attribute(*attribute).contains(value)
            }
            Self::Equals { attribute, value } => agent.attribute(*attribute) == value,
            Self::MinDiskSpace { bytes } => agent
                .available_disk_space
                .map_or(true, |free| free >= *bytes),
        }
    }
}

/// Fixed set of agents shared by every node of a schedule
#[derive(Debug)]
pub struct AgentPool {
    agents: Vec<Agent>,
    busy: Mutex<Vec<bool>>,
    released: Notify,
    wait_timeout: Duration,
    poll_interval: Duration,
}

impl AgentPool {
    pub fn new(agents: Vec<Agent>) -> Self {
        let busy = vec![false; agents.len()];
        Self {
            agents,
            busy: Mutex::new(busy),
            released: Notify::new(),
            wait_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_millis(500),
        }
    }

    /// Pool containing only the local machine
    pub fn local() -> Self {
        Self::new(vec![Agent::local()])
    }

    pub fn with_timing(mut self, wait_timeout: Duration, poll_interval: Duration) -> Self {
        self.wait_timeout = wait_timeout;
        self.poll_interval = poll_interval;
        self
    }

    pub fn agents(&self) -> &[Agent] {
        &self.agents
    }

    /// Agents satisfying the requirements, busy or not
    pub fn compatible(&self, requirements: &[Requirement]) -> Vec<&Agent> {
        self.agents
            .iter()
            .filter(|a| a.satisfies(requirements))
            .collect()
    }

    fn busy(&self) -> MutexGuard<'_, Vec<bool>> {
        self.busy.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Lease the first idle compatible agent, if any
    pub fn try_acquire(self: &Arc<Self>, requirements: &[Requirement]) -> Option<AgentLease> {
        let mut busy = self.busy();
        let index = self
            .agents
            .iter()
            .enumerate()
            .position(|(i, a)| !busy[i] && a.satisfies(requirements))?;
        busy[index] = true;

        Some(AgentLease {
            pool: Arc::clone(self),
            index,
        })
    }

    /// Wait for a compatible agent.
    ///
    /// Fails immediately when no agent in the pool could ever satisfy the
    /// requirements, and after the wait timeout otherwise.
    pub async fn acquire(
        self: &Arc<Self>,
        node: &str,
        requirements: &[Requirement],
    ) -> BuildgraphResult<AgentLease> {
        let no_agent = |waited: Duration| BuildgraphError::NoAgentAvailable {
            node: node.to_string(),
            waited_secs: waited.as_secs(),
        };

        if self.compatible(requirements).is_empty() {
            return Err(no_agent(Duration::ZERO));
        }

        let started = Instant::now();
        let deadline = started + self.wait_timeout;

        loop {
            let released = self.released.notified();

            if let Some(lease) = self.try_acquire(requirements) {
                debug!("Node '{}' leased agent '{}'", node, lease.agent().name);
                return Ok(lease);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(no_agent(now - started));
            }

            let nap = self.poll_interval.min(deadline - now);
            tokio::select! {
                _ = released => {}
                _ = tokio::time::sleep(nap) => {}
            }
        }
    }
}

/// Exclusive use of one agent, returned to the pool on drop
#[derive(Debug)]
pub struct AgentLease {
    pool: Arc<AgentPool>,
    index: usize,
}

impl AgentLease {
    pub fn agent(&self) -> &Agent {
        &self.pool.agents[self.index]
    }
}

impl Drop for AgentLease {
    fn drop(&mut self) {
        self.pool.busy()[self.index] = false;
        self.pool.released.notify_waiters();
    }
}
