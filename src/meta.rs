//! Squash of the nested `_keys` column into the `_meta` reverse index:
//! `table -> column -> sorted, de-duplicated primary-key values`. `_meta`
//! enumerates every row in every descendant table that contributed to a
//! document and is what the change translator queries to locate affected
//! roots when a descendant row changes.

use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::BTreeMap;

pub type PrivateKeys = BTreeMap<String, BTreeMap<String, Vec<Value>>>;

/// Flatten the `_keys` tree the query emits into the `_meta` mapping.
pub fn private_keys(keys: &Value) -> PrivateKeys {
    let mut target = PrivateKeys::new();
    collect(keys, &mut target);
    for columns in target.values_mut() {
        for values in columns.values_mut() {
            values.sort_by(compare_values);
            values.dedup();
        }
    }
    target
}

fn collect(value: &Value, target: &mut PrivateKeys) {
    match value {
        Value::Array(items) => {
            for item in items {
                collect(item, target);
            }
        }
        Value::Object(entries) => {
            for (table, payload) in entries {
                collect_table(table, payload, target);
            }
        }
        _ => {}
    }
}

fn collect_table(table: &str, payload: &Value, target: &mut PrivateKeys) {
    match payload {
        // {"table": {"col": [v, ...]}} or {"table": {"col": v}}
        Value::Object(columns) => {
            let entry = target.entry(table.to_string()).or_default();
            merge_columns(columns, entry);
        }
        // {"table": [{"col": [v]}, ...]}
        Value::Array(items) => {
            let entry = target.entry(table.to_string()).or_default();
            for item in items {
                if let Value::Object(columns) = item {
                    merge_columns(columns, entry);
                }
            }
        }
        _ => {}
    }
}

fn merge_columns(columns: &Map<String, Value>, entry: &mut BTreeMap<String, Vec<Value>>) {
    for (column, values) in columns {
        let slot = entry.entry(column.clone()).or_default();
        match values {
            Value::Array(values) => {
                slot.extend(values.iter().filter(|v| !v.is_null()).cloned());
            }
            Value::Null => {}
            scalar => slot.push(scalar.clone()),
        }
    }
}

fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => a
            .as_f64()
            .partial_cmp(&b.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(a), Value::String(b)) => a.cmp(b),
        _ => a.to_string().cmp(&b.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_single_child_contribution() {
        // root with one one_to_one child, as the query emits it
        let keys = json!([{"publisher": {"id": [1]}}]);
        let meta = private_keys(&keys);
        assert_eq!(meta["publisher"]["id"], vec![json!(1)]);
    }

    #[test]
    fn test_aggregated_child_rows() {
        let keys = json!([
            {"book": [{"isbn": ["abc"]}, {"isbn": ["def"]}, {"isbn": ["abc"]}]}
        ]);
        let meta = private_keys(&keys);
        assert_eq!(meta["book"]["isbn"], vec![json!("abc"), json!("def")]);
    }

    #[test]
    fn test_through_contribution() {
        // through children concatenate the through-table keys onto each row
        let keys = json!([
            [
                {"author": [{"id": [1]}], "book_author": [{"id": [7]}]},
                {"author": [{"id": [2]}], "book_author": [{"id": [8]}]}
            ]
        ]);
        let meta = private_keys(&keys);
        assert_eq!(meta["author"]["id"], vec![json!(1), json!(2)]);
        assert_eq!(meta["book_author"]["id"], vec![json!(7), json!(8)]);
    }

    #[test]
    fn test_absent_child_is_skipped() {
        // LEFT OUTER JOIN with no child row leaves a null in the array
        let keys = json!([null]);
        let meta = private_keys(&keys);
        assert!(meta.is_empty());
    }

    #[test]
    fn test_values_sorted_and_deduplicated() {
        let keys = json!([{"tag": {"id": [3, 1, 2, 1]}}]);
        let meta = private_keys(&keys);
        assert_eq!(meta["tag"]["id"], vec![json!(1), json!(2), json!(3)]);
    }

    #[test]
    fn test_nested_grandchild_keys() {
        let keys = json!([
            {"publisher": {"id": [1]}},
            [{"city": {"id": 5}}]
        ]);
        let meta = private_keys(&keys);
        assert_eq!(meta["publisher"]["id"], vec![json!(1)]);
        assert_eq!(meta["city"]["id"], vec![json!(5)]);
    }
}
