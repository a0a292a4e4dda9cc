// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 buildgraph contributors

//! Trigger events

use std::collections::{BTreeMap, BTreeSet};

use crate::pipeline::params::REVERSE_PREFIX;

/// Event that starts a schedule
#[derive(Debug, Clone, Default)]
pub struct TriggerEvent {
    /// Source revision, e.g. `refs/heads/main`
    pub source_ref: String,

    /// Changed paths
    pub change_set: Vec<String>,

    /// Started by a person rather than a VCS event
    pub is_manual: bool,

    /// Node to build, with everything it depends on; the whole graph if unset
    pub requested_node_id: Option<String>,

    /// Parameter overrides, including `reverse.dep.*` ones
    pub parameters: BTreeMap<String, String>,
}

impl TriggerEvent {
    /// Manual trigger on a ref
    pub fn manual(source_ref: impl Into<String>) -> Self {
        Self {
            source_ref: source_ref.into(),
            is_manual: true,
            ..Default::default()
        }
    }

    /// VCS trigger carrying the changed paths
    pub fn vcs<I, S>(source_ref: impl Into<String>, change_set: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            source_ref: source_ref.into(),
            change_set: change_set.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn requesting(mut self, node_id: impl Into<String>) -> Self {
        self.requested_node_id = Some(node_id.into());
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Overrides that are not `reverse.dep.*`
    pub fn direct_parameters(&self) -> impl Iterator<Item = (&String, &String)> {
        self.parameters
            .iter()
            .filter(|(k, _)| !k.starts_with(REVERSE_PREFIX))
    }
}

/// Parameter overrides pushed onto the nodes of a schedule by
/// `reverse.dep.<target>.<name>` parameters, where target is a node id or `*`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReverseParameters {
    all: BTreeMap<String, String>,
    by_node: BTreeMap<String, BTreeMap<String, String>>,
}

impl ReverseParameters {
    /// Collect overrides from parameter maps; later sources win
    pub fn collect<'a, I>(sources: I) -> Self
    where
        I: IntoIterator<Item = &'a BTreeMap<String, String>>,
    {
        let mut reverse = Self::default();
        for params in sources {
            for (key, value) in params {
                let Some((target, name)) = key
                    .strip_prefix(REVERSE_PREFIX)
                    .and_then(|rest| rest.split_once('.'))
                else {
                    continue;
                };
                if name.is_empty() {
                    continue;
                }

                if target == "*" {
                    reverse.all.insert(name.to_string(), value.clone());
                } else {
                    reverse
                        .by_node
                        .entry(target.to_string())
                        .or_default()
                        .insert(name.to_string(), value.clone());
                }
            }
        }
        reverse
    }

    pub fn is_empty(&self) -> bool {
        self.all.is_empty() && self.by_node.is_empty()
    }

    /// Overrides for one node; node-specific ones take precedence
    pub fn for_node(&self, node_id: &str) -> BTreeMap<String, String> {
        let mut overrides = self.all.clone();
        if let Some(specific) = self.by_node.get(node_id) {
            overrides.extend(specific.clone());
        }
        overrides
    }

    /// Node ids targeted explicitly
    pub fn targets(&self) -> BTreeSet<&str> {
        self.by_node.keys().map(String::as_str).collect()
    }
}
