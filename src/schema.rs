//! Schema-document types. One document describes one search index: the
//! target index name, optional engine settings, and the node tree mapping
//! source tables into the emitted document shape.

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

use crate::constants::{NODE_ATTRIBUTES, RELATIONSHIP_ATTRIBUTES};
use crate::errors::SchemaError;

#[derive(Debug, Clone, Deserialize)]
pub struct SchemaDocument {
    /// Source database; defaults to the index name.
    pub database: Option<String>,
    pub index: String,
    #[serde(default)]
    pub plugins: Vec<String>,
    /// Top-level document field to use as `_routing`.
    pub routing: Option<String>,
    pub setting: Option<Value>,
    pub mapping: Option<Value>,
    /// Ingest pipeline attached to every index action.
    pub pipeline: Option<String>,
    pub nodes: Value,
}

impl SchemaDocument {
    pub fn database(&self) -> &str {
        self.database.as_deref().unwrap_or(&self.index)
    }

    /// Sanitized `{database}_{index}` used to derive the slot, queue and
    /// checkpoint names.
    pub fn name(&self) -> String {
        format!("{}_{}", self.database().to_lowercase(), self.index)
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
            .collect()
    }

    /// Parse the raw `nodes` value into a typed definition, validating the
    /// attribute vocabulary on the way down.
    pub fn node_defs(&self) -> Result<NodeDef, SchemaError> {
        validate_node_keys(&self.nodes)?;
        serde_json::from_value(self.nodes.clone())
            .map_err(|e| SchemaError::Malformed(e.to_string()))
    }
}

/// Load one or many schema documents from a JSON config file.
pub fn load_documents(path: &Path) -> Result<Vec<SchemaDocument>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read schema config {}", path.display()))?;
    let value: Value = serde_json::from_str(&contents)
        .with_context(|| format!("invalid JSON in {}", path.display()))?;
    let documents = match value {
        Value::Array(items) => items
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<Vec<_>, _>>()?,
        other => vec![serde_json::from_value(other)?],
    };
    Ok(documents)
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeDef {
    pub table: Option<String>,
    pub schema: Option<String>,
    #[serde(default)]
    pub columns: Vec<String>,
    pub label: Option<String>,
    #[serde(default)]
    pub primary_key: Vec<String>,
    #[serde(default)]
    pub transform: TransformDef,
    pub relationship: Option<RelationshipDef>,
    #[serde(default)]
    pub children: Vec<NodeDef>,
    #[serde(default)]
    pub watched_columns: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelationshipDef {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub variant: Option<String>,
    #[serde(default)]
    pub through_tables: Vec<String>,
    pub foreign_key: Option<ForeignKeyDef>,
    /// Maximum nesting of a table under itself; bounds cyclic trees.
    pub join_depth: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ForeignKeyDef {
    #[serde(default)]
    pub parent: Vec<String>,
    #[serde(default)]
    pub child: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TransformDef {
    #[serde(default)]
    pub rename: BTreeMap<String, String>,
    pub concat: Option<ConcatDef>,
    #[serde(default)]
    pub mapping: BTreeMap<String, Value>,
}

impl TransformDef {
    pub fn is_empty(&self) -> bool {
        self.rename.is_empty() && self.concat.is_none() && self.mapping.is_empty()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConcatDef {
    pub columns: Vec<String>,
    pub delimiter: Option<String>,
    pub destination: String,
}

/// Reject node and relationship keys outside the documented vocabulary
/// before typed deserialization, so the operator sees which attribute is
/// wrong rather than a generic serde message.
fn validate_node_keys(node: &Value) -> Result<(), SchemaError> {
    let Some(object) = node.as_object() else {
        return Err(SchemaError::Malformed(format!(
            "node must be an object, got: {node}"
        )));
    };

    let unknown: Vec<&String> = object
        .keys()
        .filter(|key| !NODE_ATTRIBUTES.contains(&key.as_str()))
        .collect();
    if !unknown.is_empty() {
        return Err(SchemaError::NodeAttribute(
            unknown
                .iter()
                .map(|k| format!("\"{k}\""))
                .collect::<Vec<_>>()
                .join(", "),
        ));
    }

    if let Some(relationship) = object.get("relationship") {
        let Some(relationship) = relationship.as_object() else {
            return Err(SchemaError::Malformed(format!(
                "relationship must be an object, got: {relationship}"
            )));
        };
        let unknown: Vec<&String> = relationship
            .keys()
            .filter(|key| !RELATIONSHIP_ATTRIBUTES.contains(&key.as_str()))
            .collect();
        if !unknown.is_empty() {
            return Err(SchemaError::RelationshipAttribute(
                unknown
                    .iter()
                    .map(|k| format!("\"{k}\""))
                    .collect::<Vec<_>>()
                    .join(", "),
            ));
        }
    }

    if let Some(children) = object.get("children").and_then(Value::as_array) {
        for child in children {
            validate_node_keys(child)?;
        }
    }

    Ok(())
}
