// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 buildgraph contributors

//! `%token%` placeholder resolution
//!
//! Tokens are looked up in node-local parameters, built-ins, upstream
//! references (`dep.<node>.<param>`) and finally the process environment.
//! `%%` is a literal percent sign. A token that resolves nowhere is an error,
//! never an empty string.

use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;

use crate::errors::{BuildgraphError, BuildgraphResult};

/// Maximum nesting of parameters referencing parameters
const MAX_DEPTH: usize = 16;

/// Prefix of parameters pushed onto upstream nodes
pub const REVERSE_PREFIX: &str = "reverse.dep.";

/// Prefix of upstream parameter references
pub const DEP_PREFIX: &str = "dep.";

/// Parameters the scheduler defines for every run
pub const BUILTIN_PARAMETERS: &[&str] = &[
    "build.number",
    "build.workingDir",
    "node.id",
    "node.name",
    "trigger.sourceRef",
];

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"%([^%\s]*)%").expect("placeholder regex is valid"))
}

/// Tokens referenced by a string, in order of appearance
pub fn placeholders(text: &str) -> Vec<String> {
    placeholder_regex()
        .captures_iter(text)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Split a `dep.<node>.<param>` token into its parts
pub fn split_dep_reference(token: &str) -> Option<(&str, &str)> {
    token.strip_prefix(DEP_PREFIX)?.split_once('.')
}

/// Lookup context for one node
#[derive(Debug, Clone)]
pub struct ParameterScope<'a> {
    node_id: &'a str,
    local: &'a BTreeMap<String, String>,
    builtins: BTreeMap<String, String>,
    upstream: Option<&'a HashMap<String, BTreeMap<String, String>>>,
    environment: Option<&'a HashMap<String, String>>,
}

impl<'a> ParameterScope<'a> {
    pub fn new(node_id: &'a str, local: &'a BTreeMap<String, String>) -> Self {
        Self {
            node_id,
            local,
            builtins: BTreeMap::new(),
            upstream: None,
            environment: None,
        }
    }

    pub fn with_builtin(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.builtins.insert(key.into(), value.into());
        self
    }

    /// Resolved parameters of upstream nodes, keyed by node id
    pub fn with_upstream(mut self, upstream: &'a HashMap<String, BTreeMap<String, String>>) -> Self {
        self.upstream = Some(upstream);
        self
    }

    pub fn with_environment(mut self, environment: &'a HashMap<String, String>) -> Self {
        self.environment = Some(environment);
        self
    }

    /// Substitute every placeholder in `text`
    pub fn resolve(&self, text: &str) -> BuildgraphResult<String> {
        self.resolve_at(text, 0)
    }

    /// Resolve every local parameter except `reverse.dep.*` ones, which
    /// belong to the context of the nodes they target
    pub fn resolve_all(&self) -> BuildgraphResult<BTreeMap<String, String>> {
        self.local
            .iter()
            .filter(|(k, _)| !k.starts_with(REVERSE_PREFIX))
            .map(|(k, v)| Ok((k.clone(), self.resolve(v)?)))
            .collect()
    }

    fn resolve_at(&self, text: &str, depth: usize) -> BuildgraphResult<String> {
        let mut out = String::with_capacity(text.len());
        let mut last = 0;

        for caps in placeholder_regex().captures_iter(text) {
            let (Some(whole), Some(token)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            out.push_str(&text[last..whole.start()]);
            last = whole.end();

            let token = token.as_str();
            if token.is_empty() {
                out.push('%');
                continue;
            }

            out.push_str(&self.lookup(token, depth)?);
        }

        out.push_str(&text[last..]);
        Ok(out)
    }

    fn lookup(&self, token: &str, depth: usize) -> BuildgraphResult<String> {
        if depth >= MAX_DEPTH {
            return Err(BuildgraphError::ParameterRecursion {
                node: self.node_id.to_string(),
                token: token.to_string(),
            });
        }

        if let Some(value) = self.local.get(token) {
            return self.resolve_at(value, depth + 1);
        }

        if let Some(value) = self.builtins.get(token) {
            return Ok(value.clone());
        }

        if let Some((node, param)) = split_dep_reference(token) {
            if let Some(value) = self
                .upstream
                .and_then(|u| u.get(node))
                .and_then(|params| params.get(param))
            {
                return Ok(value.clone());
            }
        }

        let var = token.strip_prefix("env.").unwrap_or(token);
        if let Some(value) = self.environment.and_then(|env| env.get(var)) {
            return Ok(value.clone());
        }

        Err(BuildgraphError::UnresolvedParameter {
            node: self.node_id.to_string(),
            token: token.to_string(),
        })
    }
}

/// Environment variables exported for parameters named `env.X`
pub fn exported_env(resolved: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    resolved
        .iter()
        .filter_map(|(k, v)| k.strip_prefix("env.").map(|name| (name.to_string(), v.clone())))
        .collect()
}
