use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ProvisionError, Result};

static EMBEDDING_REF: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)embedding:\s*([A-Za-z0-9_.\-]+)").expect("valid regex"));

/// Node key in the API-format workflow. Numeric ids sort numerically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Ord for NodeId {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.0.parse::<u64>(), other.0.parse::<u64>()) {
            (Ok(a), Ok(b)) => a.cmp(&b).then_with(|| self.0.cmp(&other.0)),
            (Ok(_), Err(_)) => Ordering::Less,
            (Err(_), Ok(_)) => Ordering::Greater,
            (Err(_), Err(_)) => self.0.cmp(&other.0),
        }
    }
}

impl PartialOrd for NodeId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Output `index` of another node, serialized as `["<id>", index]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeLink(pub NodeId, pub u32);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputValue {
    Bool(bool),
    Integer(i64),
    /// Seeds above `i64::MAX`.
    Unsigned(u64),
    Float(f64),
    Text(String),
    Link(NodeLink),
    Other(Value),
}

impl InputValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            InputValue::Text(text) => Some(text),
            _ => None,
        }
    }
}

impl From<&str> for InputValue {
    fn from(value: &str) -> Self {
        InputValue::Text(value.to_string())
    }
}

impl From<String> for InputValue {
    fn from(value: String) -> Self {
        InputValue::Text(value)
    }
}

impl From<i64> for InputValue {
    fn from(value: i64) -> Self {
        InputValue::Integer(value)
    }
}

impl From<u64> for InputValue {
    fn from(value: u64) -> Self {
        InputValue::Unsigned(value)
    }
}

impl From<f64> for InputValue {
    fn from(value: f64) -> Self {
        InputValue::Float(value)
    }
}

impl From<bool> for InputValue {
    fn from(value: bool) -> Self {
        InputValue::Bool(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowNode {
    pub class_type: String,
    #[serde(default)]
    pub inputs: BTreeMap<String, InputValue>,
    #[serde(rename = "_meta", default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowGraph {
    nodes: BTreeMap<NodeId, WorkflowNode>,
}

impl WorkflowGraph {
    pub fn from_json_str(source: &str) -> Result<Self> {
        serde_json::from_str(source).map_err(|err| ProvisionError::Workflow(err.to_string()))
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|err| ProvisionError::io(path, err))?;
        Self::from_json_str(&raw)
    }

    /// Fails on the first id with no matching node.
    pub fn require_nodes(&self, ids: &[&str]) -> Result<()> {
        match ids.iter().find(|id| self.node(id).is_none()) {
            Some(missing) => Err(ProvisionError::Workflow(format!(
                "required node {missing} is missing"
            ))),
            None => Ok(()),
        }
    }

    pub fn node(&self, id: &str) -> Option<&WorkflowNode> {
        self.nodes.get(&NodeId::new(id))
    }

    pub fn nodes(&self) -> impl Iterator<Item = (&NodeId, &WorkflowNode)> {
        self.nodes.iter()
    }

    pub fn text_input(&self, id: &str, field: &str) -> Option<&str> {
        self.node(id)?.inputs.get(field)?.as_text()
    }

    pub fn set_input(&mut self, id: &str, field: &str, value: impl Into<InputValue>) -> Result<()> {
        let node = self
            .nodes
            .get_mut(&NodeId::new(id))
            .ok_or_else(|| ProvisionError::Workflow(format!("node {id} is missing")))?;
        node.inputs.insert(field.to_string(), value.into());
        Ok(())
    }

    /// String inputs across all nodes, in node order.
    pub fn text_inputs(&self) -> impl Iterator<Item = &str> {
        self.nodes
            .values()
            .flat_map(|node| node.inputs.values())
            .filter_map(InputValue::as_text)
    }

    /// Weight identifiers the graph refers to, first occurrence first.
    ///
    /// Inputs ending in one of `extensions` are taken verbatim; prompt text
    /// containing `embedding:<name>` resolves `<name>` against the stems of
    /// `embeddings`.
    pub fn weight_references(&self, extensions: &[&str], embeddings: &[&str]) -> Vec<String> {
        let stems: BTreeMap<&str, &str> = embeddings
            .iter()
            .map(|full| (full.split('.').next().unwrap_or(full), *full))
            .collect();

        let mut found: Vec<String> = Vec::new();
        let mut push = |identifier: &str| {
            if !found.iter().any(|existing| existing == identifier) {
                found.push(identifier.to_string());
            }
        };

        for text in self.text_inputs() {
            if extensions.iter().any(|ext| text.ends_with(ext)) {
                push(text);
                continue;
            }
            for caps in EMBEDDING_REF.captures_iter(text) {
                let name = caps[1].trim_end_matches(['.', ',']);
                let stem = name.split('.').next().unwrap_or(name);
                if let Some(full) = stems.get(stem) {
                    push(full);
                }
            }
        }
        found
    }
}
