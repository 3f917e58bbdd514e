//! Row transforms applied after fetch, before `_meta` injection: `rename`
//! rewrites field names, `concat` joins column values into a destination
//! field. Mapping overrides are handled by the sink when the index is
//! created.

use serde_json::{Map, Value};

use crate::tree::Node;

/// Apply the tree's transforms to one fetched document body, in place.
pub fn apply(source: &mut Value, node: &Node) {
    apply_concat(source, node);
    apply_rename(source, node);
}

fn apply_concat(value: &mut Value, node: &Node) {
    match value {
        Value::Object(object) => {
            if let Some(concat) = &node.transform.concat {
                let delimiter = concat.delimiter.as_deref().unwrap_or("");
                let joined = concat
                    .columns
                    .iter()
                    .filter_map(|column| object.get(column))
                    .filter(|value| !value.is_null())
                    .map(value_to_string)
                    .collect::<Vec<_>>()
                    .join(delimiter);
                object.insert(concat.destination.clone(), Value::String(joined));
            }
            for child in &node.children {
                if let Some(nested) = object.get_mut(&child.label) {
                    apply_concat(nested, child);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                apply_concat(item, node);
            }
        }
        _ => {}
    }
}

fn apply_rename(value: &mut Value, node: &Node) {
    match value {
        Value::Object(object) => {
            // descend before renaming so child labels still match
            for child in &node.children {
                if let Some(nested) = object.get_mut(&child.label) {
                    apply_rename(nested, child);
                }
            }
            if !node.transform.rename.is_empty() {
                let mut renamed = Map::new();
                for (key, item) in std::mem::take(object) {
                    let key = node
                        .transform
                        .rename
                        .get(&key)
                        .cloned()
                        .unwrap_or(key);
                    renamed.insert(key, item);
                }
                *object = renamed;
            }
        }
        Value::Array(items) => {
            for item in items {
                apply_rename(item, node);
            }
        }
        _ => {}
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ConcatDef, TransformDef};
    use crate::tree::{ColumnRef, Node, Relationship, RelationshipType, RelationshipVariant};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn node(table: &str, label: &str, transform: TransformDef, children: Vec<Node>) -> Node {
        Node {
            table: table.into(),
            schema: "public".into(),
            label: label.into(),
            columns: vec![ColumnRef::parse("id")],
            primary_keys: vec!["id".into()],
            relationship: Some(Relationship {
                kind: RelationshipType::OneToOne,
                variant: RelationshipVariant::Object,
                through_table: None,
                foreign_key: None,
                join_depth: None,
            }),
            transform,
            watched_columns: vec![],
            children,
        }
    }

    #[test]
    fn test_rename_top_level() {
        let transform = TransformDef {
            rename: BTreeMap::from([("isbn".to_string(), "book_id".to_string())]),
            ..Default::default()
        };
        let root = node("book", "book", transform, vec![]);
        let mut source = json!({"isbn": "abc", "title": "t"});
        apply(&mut source, &root);
        assert_eq!(source, json!({"book_id": "abc", "title": "t"}));
    }

    #[test]
    fn test_rename_nested_child() {
        let child_transform = TransformDef {
            rename: BTreeMap::from([("name".to_string(), "publisher_name".to_string())]),
            ..Default::default()
        };
        let child = node("publisher", "publisher", child_transform, vec![]);
        let root = node("book", "book", TransformDef::default(), vec![child]);
        let mut source = json!({"isbn": "abc", "publisher": {"id": 1, "name": "Tiger"}});
        apply(&mut source, &root);
        assert_eq!(
            source,
            json!({"isbn": "abc", "publisher": {"id": 1, "publisher_name": "Tiger"}})
        );
    }

    #[test]
    fn test_rename_inside_array_of_children() {
        let child_transform = TransformDef {
            rename: BTreeMap::from([("name".to_string(), "author_name".to_string())]),
            ..Default::default()
        };
        let child = node("author", "authors", child_transform, vec![]);
        let root = node("book", "book", TransformDef::default(), vec![child]);
        let mut source = json!({"authors": [{"id": 1, "name": "A"}, {"id": 2, "name": "B"}]});
        apply(&mut source, &root);
        assert_eq!(
            source,
            json!({"authors": [{"id": 1, "author_name": "A"}, {"id": 2, "author_name": "B"}]})
        );
    }

    #[test]
    fn test_concat_with_delimiter() {
        let transform = TransformDef {
            concat: Some(ConcatDef {
                columns: vec!["first".into(), "last".into()],
                delimiter: Some(" ".into()),
                destination: "full_name".into(),
            }),
            ..Default::default()
        };
        let root = node("person", "person", transform, vec![]);
        let mut source = json!({"first": "Ada", "last": "Lovelace"});
        apply(&mut source, &root);
        assert_eq!(source["full_name"], json!("Ada Lovelace"));
    }

    #[test]
    fn test_concat_skips_nulls() {
        let transform = TransformDef {
            concat: Some(ConcatDef {
                columns: vec!["first".into(), "middle".into(), "last".into()],
                delimiter: Some("-".into()),
                destination: "full".into(),
            }),
            ..Default::default()
        };
        let root = node("person", "person", transform, vec![]);
        let mut source = json!({"first": "Ada", "middle": null, "last": "Lovelace"});
        apply(&mut source, &root);
        assert_eq!(source["full"], json!("Ada-Lovelace"));
    }
}
