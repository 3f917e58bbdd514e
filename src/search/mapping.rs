//! Index mapping derived from the tree. Each node's `transform.mapping`
//! declares per-column type overrides; they are merged bottom-up under the
//! declared labels. Every type and parameter is validated against the
//! engine vocabulary, and a conflicting merge is an error rather than
//! last-writer-wins.

use serde_json::{Map, Value, json};

use crate::constants::{SEARCH_MAPPING_PARAMETERS, SEARCH_TYPES};
use crate::errors::MappingError;
use crate::tree::{Node, Tree};

/// Build the `mappings` body for index creation, or `None` when no node
/// declares a mapping and routing is not required.
pub fn build_mapping(tree: &Tree, routing: Option<&str>) -> Result<Option<Value>, MappingError> {
    let properties = node_properties(&tree.root)?;

    let mut mappings = Map::new();
    if let Some(properties) = properties {
        mappings.insert("properties".to_string(), Value::Object(properties));
    }
    if routing.is_some() {
        mappings.insert("_routing".to_string(), json!({"required": true}));
    }

    if mappings.is_empty() {
        return Ok(None);
    }
    Ok(Some(Value::Object(mappings)))
}

fn node_properties(node: &Node) -> Result<Option<Map<String, Value>>, MappingError> {
    let mut properties = Map::new();

    for (column, body) in &node.transform.mapping {
        let column = node
            .transform
            .rename
            .get(column)
            .cloned()
            .unwrap_or_else(|| column.clone());
        let body = validate_field(&column, body)?;
        insert_merged(&mut properties, &column, body)?;
    }

    for child in &node.children {
        if let Some(child_properties) = node_properties(child)? {
            let nested = Value::Object(Map::from_iter([(
                "properties".to_string(),
                Value::Object(child_properties),
            )]));
            insert_merged(&mut properties, &child.label, nested)?;
        }
    }

    if properties.is_empty() {
        Ok(None)
    } else {
        Ok(Some(properties))
    }
}

fn insert_merged(
    properties: &mut Map<String, Value>,
    key: &str,
    body: Value,
) -> Result<(), MappingError> {
    match properties.get(key) {
        None => {
            properties.insert(key.to_string(), body);
            Ok(())
        }
        Some(existing) if *existing == body => Ok(()),
        Some(_) => Err(MappingError::Conflict(key.to_string())),
    }
}

fn validate_field(column: &str, body: &Value) -> Result<Value, MappingError> {
    let Some(entries) = body.as_object() else {
        return Err(MappingError::InvalidParameter(format!(
            "{column}: mapping body must be an object"
        )));
    };

    let field_type = entries
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| MappingError::InvalidType(format!("{column}: missing type")))?;
    if !SEARCH_TYPES.contains(&field_type) {
        return Err(MappingError::InvalidType(field_type.to_string()));
    }

    for parameter in entries.keys() {
        if parameter == "type" {
            continue;
        }
        if !SEARCH_MAPPING_PARAMETERS.contains(&parameter.as_str()) {
            return Err(MappingError::InvalidParameter(parameter.clone()));
        }
    }

    Ok(body.clone())
}
