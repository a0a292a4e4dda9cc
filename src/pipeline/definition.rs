// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 buildgraph contributors

//! Pipeline definition structures
//!
//! Defines the schema for `buildgraph.yaml` (or `.toml`) files and the
//! builders used to construct nodes and edges programmatically.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use super::template::NodeTemplate;
use super::PipelineGraph;
use crate::errors::{BuildgraphError, BuildgraphResult};
use crate::scheduler::Agent;

/// Pipeline definition loaded from a file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Pipeline version (for future compatibility)
    #[serde(default = "default_version")]
    pub version: String,

    /// Pipeline name
    pub name: String,

    /// Pipeline description
    #[serde(default)]
    pub description: Option<String>,

    /// Project-level parameters, inherited by every node
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,

    /// Explicit node definitions
    #[serde(default)]
    pub nodes: Vec<BuildNode>,

    /// Parametrized node templates
    #[serde(default)]
    pub templates: Vec<NodeTemplate>,

    /// Dependency edges
    #[serde(default)]
    pub edges: Vec<DependencyEdge>,

    /// Environment-specific overlays
    #[serde(default)]
    pub environments: BTreeMap<String, EnvironmentOverlay>,

    /// Scheduler settings
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Artifact store settings
    #[serde(default)]
    pub store: StoreConfig,

    /// Agents available to this pipeline (the local host when empty)
    #[serde(default)]
    pub agents: Vec<Agent>,
}

fn default_version() -> String {
    "1".to_string()
}

impl PipelineConfig {
    /// Load a pipeline from a YAML or TOML file, chosen by extension
    pub fn from_file(path: &Path) -> BuildgraphResult<Self> {
        if !path.exists() {
            return Err(BuildgraphError::PipelineNotFound {
                path: path.to_path_buf(),
            });
        }

        let content =
            std::fs::read_to_string(path).map_err(|e| BuildgraphError::FileReadError {
                path: path.to_path_buf(),
                error: e.to_string(),
            })?;

        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml(&content),
            _ => Self::from_yaml(&content),
        }
    }

    /// Parse a pipeline from a YAML string
    pub fn from_yaml(yaml: &str) -> BuildgraphResult<Self> {
        serde_yaml::from_str(yaml).map_err(Into::into)
    }

    /// Parse a pipeline from a TOML string
    pub fn from_toml(content: &str) -> BuildgraphResult<Self> {
        toml::from_str(content).map_err(Into::into)
    }

    /// Names of the declared environment overlays
    pub fn environment_names(&self) -> Vec<&str> {
        self.environments.keys().map(String::as_str).collect()
    }

    /// Expand templates, apply an optional overlay and build the graph.
    ///
    /// The returned graph is validated.
    pub fn build_graph(&self, environment: Option<&str>) -> BuildgraphResult<PipelineGraph> {
        let mut nodes = self.nodes.clone();
        let mut edges = Vec::new();

        for template in &self.templates {
            nodes.extend(template.expand()?);
        }

        for edge in &self.edges {
            edges.extend(self.expand_edge(edge)?);
        }

        if let Some(name) = environment {
            let overlay =
                self.environments
                    .get(name)
                    .ok_or_else(|| BuildgraphError::UnknownEnvironment {
                        name: name.to_string(),
                    })?;
            overlay.apply_parameters(&mut nodes)?;

            edges.retain(|e| {
                !overlay
                    .drop_edges
                    .iter()
                    .any(|d| d.from == e.from && d.to == e.to)
            });
            for edge in &overlay.edges {
                edges.extend(self.expand_edge(edge)?);
            }
        }

        let mut graph = PipelineGraph::new();
        for mut node in nodes {
            for (key, value) in &self.parameters {
                node.parameters
                    .entry(key.clone())
                    .or_insert_with(|| value.clone());
            }
            graph.add_node(node)?;
        }
        for edge in edges {
            graph.add_edge(edge);
        }

        graph.validate()?;
        Ok(graph)
    }

    /// Expand `@template` edge targets into one edge per template instance
    fn expand_edge(&self, edge: &DependencyEdge) -> BuildgraphResult<Vec<DependencyEdge>> {
        let Some(group) = edge.to.strip_prefix('@') else {
            return Ok(vec![edge.clone()]);
        };

        let template = self
            .templates
            .iter()
            .find(|t| t.id == group)
            .ok_or_else(|| BuildgraphError::InvalidPipeline {
                reason: format!("Edge from '{}' targets unknown template '{}'", edge.from, group),
                help: Some("Group edges must name a template id after '@'".into()),
            })?;

        Ok(template
            .instance_ids()
            .into_iter()
            .map(|id| {
                let rules = edge
                    .artifact_rules
                    .iter()
                    .map(|r| r.map_text(|s| s.replace("%upstream.", &format!("%dep.{}.", id))))
                    .collect();
                DependencyEdge {
                    from: edge.from.clone(),
                    to: id,
                    artifact_rules: rules,
                    on_failure: edge.on_failure,
                }
            })
            .collect())
    }
}

/// A named unit of work
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BuildNode {
    /// Unique, stable identifier
    pub id: String,

    /// Human-readable label
    #[serde(default)]
    pub name: String,

    /// Declared parameters (values may contain placeholders)
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,

    /// Constraints on the agent that may run this node
    #[serde(default)]
    pub requirements: Vec<Requirement>,

    /// Steps, executed in order
    #[serde(default)]
    pub steps: Vec<StepSpec>,

    /// What this node publishes on success
    #[serde(default)]
    pub artifact_rules: Vec<ArtifactRule>,

    /// Maximum number of simultaneously running instances
    #[serde(default)]
    pub max_concurrent_runs: Option<usize>,
}

impl BuildNode {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            parameters: BTreeMap::new(),
            requirements: vec![],
            steps: vec![],
            artifact_rules: vec![],
            max_concurrent_runs: None,
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_requirement(mut self, requirement: Requirement) -> Self {
        self.requirements.push(requirement);
        self
    }

    pub fn with_step(mut self, step: StepSpec) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_artifact_rule(mut self, rule: ArtifactRule) -> Self {
        self.artifact_rules.push(rule);
        self
    }

    pub fn with_max_concurrent_runs(mut self, cap: usize) -> Self {
        self.max_concurrent_runs = Some(cap);
        self
    }

    /// Label for display, falling back to the id
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

/// Step execution mode
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Skipped once a prior step has failed
    #[default]
    Normal,
    /// Run regardless of prior failures (cleanup)
    Always,
}

/// A single external command
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepSpec {
    /// Step name
    pub name: String,

    /// Optional stable id
    #[serde(default)]
    pub id: Option<String>,

    /// Program to execute
    pub command: String,

    /// Program arguments
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory relative to the run directory
    #[serde(default)]
    pub working_dir: Option<String>,

    /// Disabled steps are skipped entirely
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Execution mode
    #[serde(default)]
    pub mode: ExecutionMode,

    /// Timeout in seconds
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Step-local environment variables
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_true() -> bool {
    true
}

impl StepSpec {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: None,
            command: command.into(),
            args: vec![],
            working_dir: None,
            enabled: true,
            mode: ExecutionMode::Normal,
            timeout_secs: None,
            env: BTreeMap::new(),
        }
    }

    /// Shell script step, run with `sh -c`
    pub fn script(name: impl Into<String>, script: impl Into<String>) -> Self {
        Self::new(name, "sh").with_args(["-c".to_string(), script.into()])
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn in_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn always(mut self) -> Self {
        self.mode = ExecutionMode::Always;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Whether the step executes given the failure state of earlier steps
    pub fn should_run(&self, prior_failure: bool) -> bool {
        self.enabled && (!prior_failure || self.mode == ExecutionMode::Always)
    }
}

/// How matched files are laid out at the destination
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CopyLayout {
    /// Keep paths relative to the pattern's literal base directory
    #[default]
    Preserve,
    /// Place every file directly in the destination
    Flatten,
}

/// A (source pattern, destination) pair
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "ArtifactRuleDef")]
pub struct ArtifactRule {
    pub source: String,
    pub destination: String,
    pub layout: CopyLayout,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ArtifactRuleDef {
    Short(String),
    Full {
        source: String,
        #[serde(default)]
        destination: String,
        #[serde(default)]
        layout: CopyLayout,
    },
}

impl TryFrom<ArtifactRuleDef> for ArtifactRule {
    type Error = BuildgraphError;

    fn try_from(def: ArtifactRuleDef) -> Result<Self, Self::Error> {
        match def {
            ArtifactRuleDef::Short(s) => s.parse(),
            ArtifactRuleDef::Full {
                source,
                destination,
                layout,
            } => {
                if source.trim().is_empty() {
                    return Err(BuildgraphError::InvalidArtifactRule {
                        rule: source,
                        reason: "source pattern is empty".into(),
                    });
                }
                Ok(Self {
                    source,
                    destination,
                    layout,
                })
            }
        }
    }
}

impl ArtifactRule {
    /// Rule preserving relative paths
    pub fn preserve(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            layout: CopyLayout::Preserve,
        }
    }

    /// Rule flattening matches into the destination
    pub fn flatten(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            layout: CopyLayout::Flatten,
        }
    }

    /// Apply a text transformation to both source and destination
    pub fn map_text(&self, mut f: impl FnMut(&str) -> String) -> Self {
        Self {
            source: f(&self.source),
            destination: f(&self.destination),
            layout: self.layout,
        }
    }

    /// Apply a fallible text transformation to both source and destination
    pub fn try_map_text(
        &self,
        mut f: impl FnMut(&str) -> BuildgraphResult<String>,
    ) -> BuildgraphResult<Self> {
        Ok(Self {
            source: f(&self.source)?,
            destination: f(&self.destination)?,
            layout: self.layout,
        })
    }
}

impl FromStr for ArtifactRule {
    type Err = BuildgraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| BuildgraphError::InvalidArtifactRule {
            rule: s.to_string(),
            reason: reason.to_string(),
        };

        let rule = if let Some((source, dest)) = s.split_once("=>") {
            Self::preserve(source.trim(), dest.trim())
        } else if let Some((source, dest)) = s
            .split_once(':')
            .filter(|(src, _)| !is_drive_letter(src.trim()))
        {
            Self::flatten(source.trim(), dest.trim())
        } else {
            Self::preserve(s.trim(), "")
        };

        if rule.source.is_empty() {
            return Err(invalid("source pattern is empty"));
        }

        Ok(rule)
    }
}

fn is_drive_letter(s: &str) -> bool {
    s.len() == 1 && s.chars().all(|c| c.is_ascii_alphabetic())
}

impl fmt::Display for ArtifactRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.layout {
            CopyLayout::Preserve if self.destination.is_empty() => write!(f, "{}", self.source),
            CopyLayout::Preserve => write!(f, "{}=>{}", self.source, self.destination),
            CopyLayout::Flatten => write!(f, "{}:{}", self.source, self.destination),
        }
    }
}

/// Agent attribute a requirement inspects
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentAttribute {
    OsName,
    OsArch,
    Name,
}

impl fmt::Display for AgentAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OsName => write!(f, "os_name"),
            Self::OsArch => write!(f, "os_arch"),
            Self::Name => write!(f, "name"),
        }
    }
}

/// Predicate on agent attributes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Requirement {
    StartsWith {
        attribute: AgentAttribute,
        value: String,
    },
    Contains {
        attribute: AgentAttribute,
        value: String,
    },
    DoesNotContain {
        attribute: AgentAttribute,
        value: String,
    },
    Equals {
        attribute: AgentAttribute,
        value: String,
    },
    MinDiskSpace {
        bytes: u64,
    },
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StartsWith { attribute, value } => write!(f, "{} starts with '{}'", attribute, value),
            Self::Contains { attribute, value } => write!(f, "{} contains '{}'", attribute, value),
            Self::DoesNotContain { attribute, value } => {
                write!(f, "{} does not contain '{}'", attribute, value)
            }
            Self::Equals { attribute, value } => write!(f, "{} equals '{}'", attribute, value),
            Self::MinDiskSpace { bytes } => write!(f, "at least {} bytes free", bytes),
        }
    }
}

/// What happens to a downstream node when its upstream does not succeed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureAction {
    /// Downstream is never started
    #[default]
    FailToStart,
    /// Downstream proceeds without the upstream's artifacts
    Ignore,
    /// Downstream waits for the upstream and then proceeds
    Wait,
}

impl fmt::Display for FailureAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FailToStart => write!(f, "fail_to_start"),
            Self::Ignore => write!(f, "ignore"),
            Self::Wait => write!(f, "wait"),
        }
    }
}

/// Directed edge from a downstream node to the upstream it depends on
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DependencyEdge {
    /// Downstream node id
    pub from: String,

    /// Upstream node id
    pub to: String,

    /// Artifacts copied from the upstream into the downstream working dir
    #[serde(default)]
    pub artifact_rules: Vec<ArtifactRule>,

    /// Failure policy
    #[serde(default)]
    pub on_failure: FailureAction,
}

impl DependencyEdge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            artifact_rules: vec![],
            on_failure: FailureAction::FailToStart,
        }
    }

    pub fn with_rule(mut self, rule: ArtifactRule) -> Self {
        self.artifact_rules.push(rule);
        self
    }

    pub fn on_failure(mut self, action: FailureAction) -> Self {
        self.on_failure = action;
        self
    }
}

/// Reference to an edge by its endpoints
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EdgeRef {
    pub from: String,
    pub to: String,
}

/// Environment-specific overrides on top of the base graph
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvironmentOverlay {
    /// Parameter overrides keyed by node id, or `*` for every node
    #[serde(default)]
    pub parameters: BTreeMap<String, BTreeMap<String, String>>,

    /// Additional edges
    #[serde(default)]
    pub edges: Vec<DependencyEdge>,

    /// Edges removed from the base graph
    #[serde(default)]
    pub drop_edges: Vec<EdgeRef>,
}

impl EnvironmentOverlay {
    fn apply_parameters(&self, nodes: &mut [BuildNode]) -> BuildgraphResult<()> {
        if let Some(all) = self.parameters.get("*") {
            for node in nodes.iter_mut() {
                node.parameters.extend(all.clone());
            }
        }

        for (id, overrides) in self.parameters.iter().filter(|(k, _)| *k != "*") {
            let node = nodes
                .iter_mut()
                .find(|n| &n.id == id)
                .ok_or_else(|| BuildgraphError::NodeNotFound { id: id.clone() })?;
            node.parameters.extend(overrides.clone());
        }

        Ok(())
    }
}

/// Scheduler settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// How long a node may wait for a matching agent
    #[serde(default = "default_agent_wait")]
    pub agent_wait_timeout_secs: u64,

    /// Agent availability poll interval
    #[serde(default = "default_poll_interval")]
    pub agent_poll_interval_ms: u64,

    /// Root of per-run working directories
    #[serde(default = "default_workspace_dir")]
    pub workspace_dir: PathBuf,

    /// Timeout applied to steps that do not declare one
    #[serde(default)]
    pub default_step_timeout_secs: Option<u64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            agent_wait_timeout_secs: default_agent_wait(),
            agent_poll_interval_ms: default_poll_interval(),
            workspace_dir: default_workspace_dir(),
            default_step_timeout_secs: None,
        }
    }
}

fn default_agent_wait() -> u64 {
    300
}

fn default_poll_interval() -> u64 {
    500
}

fn default_workspace_dir() -> PathBuf {
    PathBuf::from(".buildgraph/work")
}

/// Artifact store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store directory
    #[serde(default = "default_store_dir")]
    pub directory: PathBuf,

    /// Runs retained per node; older runs are pruned after a schedule
    #[serde(default)]
    pub keep_runs: Option<usize>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            directory: default_store_dir(),
            keep_runs: None,
        }
    }
}

fn default_store_dir() -> PathBuf {
    PathBuf::from(".buildgraph/artifacts")
}
