// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 buildgraph contributors

//! Parametrized node templates
//!
//! A template is one node body instantiated once per variant record, so the
//! configuration × architecture build matrix is declared once.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use super::BuildNode;
use crate::errors::{BuildgraphError, BuildgraphResult};

/// One entry of a template's variant matrix
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Variant {
    /// Build configuration (Debug, Release, ...)
    #[serde(default)]
    pub config_type: String,

    /// Build preset name
    #[serde(default)]
    pub preset: String,

    /// Target architecture
    #[serde(default)]
    pub architecture: String,

    /// Additional variant fields
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

impl Variant {
    pub fn new(
        config_type: impl Into<String>,
        preset: impl Into<String>,
        architecture: impl Into<String>,
    ) -> Self {
        Self {
            config_type: config_type.into(),
            preset: preset.into(),
            architecture: architecture.into(),
            extra: BTreeMap::new(),
        }
    }

    /// All fields as `variant.<field>` pairs
    pub fn fields(&self) -> BTreeMap<String, String> {
        let mut fields = BTreeMap::new();
        fields.insert("variant.config_type".to_string(), self.config_type.clone());
        fields.insert("variant.preset".to_string(), self.preset.clone());
        fields.insert("variant.architecture".to_string(), self.architecture.clone());
        for (key, value) in &self.extra {
            fields.insert(format!("variant.{}", key), value.clone());
        }
        fields
    }
}

/// Node template instantiated once per variant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeTemplate {
    /// Template id, used by `@id` edge targets
    pub id: String,

    /// Id pattern of each instance, e.g. `%variant.architecture%-%variant.config_type%`
    pub node_id: String,

    /// Name pattern of each instance
    #[serde(default)]
    pub node_name: String,

    /// Variant matrix
    pub variants: Vec<Variant>,

    /// Node body shared by all instances
    #[serde(default = "empty_body")]
    pub node: serde_json::Value,
}

fn empty_body() -> serde_json::Value {
    serde_json::Value::Object(Default::default())
}

impl NodeTemplate {
    /// Instantiate every variant
    pub fn expand(&self) -> BuildgraphResult<Vec<BuildNode>> {
        if self.variants.is_empty() {
            return Err(self.invalid("template declares no variants"));
        }

        let mut seen = HashSet::new();
        let mut nodes = Vec::with_capacity(self.variants.len());

        for variant in &self.variants {
            let fields = variant.fields();

            let mut body = self.node.clone();
            if !body.is_object() {
                return Err(self.invalid("node body must be a mapping"));
            }
            substitute_strings(&mut body, &fields);

            body["id"] = serde_json::Value::String(substitute(&self.node_id, &fields));
            body["name"] = serde_json::Value::String(substitute(&self.node_name, &fields));

            let mut node: BuildNode = serde_json::from_value(body)
                .map_err(|e| self.invalid(&format!("node body does not parse: {}", e)))?;

            for (key, value) in fields {
                node.parameters.entry(key).or_insert(value);
            }

            if !seen.insert(node.id.clone()) {
                return Err(self.invalid(&format!(
                    "variants produce the same node id '{}'",
                    node.id
                )));
            }

            nodes.push(node);
        }

        Ok(nodes)
    }

    /// Ids of every instance, in variant order
    pub fn instance_ids(&self) -> Vec<String> {
        self.variants
            .iter()
            .map(|v| substitute(&self.node_id, &v.fields()))
            .collect()
    }

    fn invalid(&self, reason: &str) -> BuildgraphError {
        BuildgraphError::InvalidTemplate {
            template: self.id.clone(),
            reason: reason.to_string(),
        }
    }
}

/// Replace `%variant.*%` tokens, leaving every other placeholder untouched
fn substitute(text: &str, fields: &BTreeMap<String, String>) -> String {
    fields.iter().fold(text.to_string(), |acc, (key, value)| {
        acc.replace(&format!("%{}%", key), value)
    })
}

fn substitute_strings(value: &mut serde_json::Value, fields: &BTreeMap<String, String>) {
    match value {
        serde_json::Value::String(s) => *s = substitute(s, fields),
        serde_json::Value::Array(items) => {
            for item in items {
                substitute_strings(item, fields);
            }
        }
        serde_json::Value::Object(map) => {
            for item in map.values_mut() {
                substitute_strings(item, fields);
            }
        }
        _ => {}
    }
}
