//! Logical replication slot management and the `test_decoding` line parser.
//!
//! Slot output is textual, one row change per line:
//!
//! ```text
//! table public.book: UPDATE: old-key: isbn[character varying]:'abc' new-tuple: isbn[character varying]:'xyz' ...
//! ```
//!
//! A line that does not match the grammar aborts the batch; the slot is not
//! advanced past it so the operator can diagnose and re-run.

use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use sqlx::PgPool;

use crate::constants::PLUGIN;
use crate::errors::SlotParseError;
use crate::sync::event::{ChangeEvent, TgOp};

// pattern literals; Regex::new cannot fail on them
static PREFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"table\s+(?P<schema>\w+)\."?(?P<table>\w+)"?:\s+(?P<tg_op>[A-Z]+):"#).unwrap()
});

static SUFFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#""?(?P<key>\w+)"?\[(?P<data_type>[^\]]+)\]:(?P<value>'(?:[^']|'')*'|\S+)"#)
        .unwrap()
});

#[derive(Debug, Clone)]
pub struct SlotRow {
    pub xid: i64,
    pub data: String,
}

pub async fn slot_exists(pool: &PgPool, slot_name: &str) -> Result<bool> {
    let row: Option<(i32,)> = sqlx::query_as(
        "SELECT 1 FROM PG_REPLICATION_SLOTS \
         WHERE slot_name = $1 AND slot_type = 'logical' AND plugin = $2",
    )
    .bind(slot_name)
    .bind(PLUGIN)
    .fetch_optional(pool)
    .await?;
    Ok(row.is_some())
}

pub async fn create_replication_slot(pool: &PgPool, slot_name: &str) -> Result<()> {
    tracing::debug!(slot_name, "creating replication slot");
    sqlx::query("SELECT * FROM PG_CREATE_LOGICAL_REPLICATION_SLOT($1, $2)")
        .bind(slot_name)
        .bind(PLUGIN)
        .fetch_one(pool)
        .await?;
    Ok(())
}

pub async fn drop_replication_slot(pool: &PgPool, slot_name: &str) -> Result<()> {
    if slot_exists(pool, slot_name).await? {
        tracing::debug!(slot_name, "dropping replication slot");
        sqlx::query("SELECT PG_DROP_REPLICATION_SLOT($1)")
            .bind(slot_name)
            .fetch_one(pool)
            .await?;
    }
    Ok(())
}

/// Last committed transaction id on the server.
pub async fn txid_current(pool: &PgPool) -> Result<i64> {
    let txid: i64 = sqlx::query_scalar("SELECT CAST(txid_current() AS BIGINT)")
        .fetch_one(pool)
        .await?;
    Ok(txid)
}

/// Non-destructive read of the slot, optionally restricted to an xid range.
pub async fn peek_slot(
    pool: &PgPool,
    slot_name: &str,
    txmin: Option<i64>,
    txmax: Option<i64>,
    upto_nchanges: Option<i64>,
) -> Result<Vec<SlotRow>> {
    slot_changes(pool, "PG_LOGICAL_SLOT_PEEK_CHANGES", slot_name, txmin, txmax, upto_nchanges)
        .await
}

/// Destructive read of the slot; returns the number of rows consumed.
pub async fn consume_slot(
    pool: &PgPool,
    slot_name: &str,
    txmin: Option<i64>,
    txmax: Option<i64>,
    upto_nchanges: Option<i64>,
) -> Result<usize> {
    let rows = slot_changes(
        pool,
        "PG_LOGICAL_SLOT_GET_CHANGES",
        slot_name,
        txmin,
        txmax,
        upto_nchanges,
    )
    .await?;
    Ok(rows.len())
}

async fn slot_changes(
    pool: &PgPool,
    function: &str,
    slot_name: &str,
    txmin: Option<i64>,
    txmax: Option<i64>,
    upto_nchanges: Option<i64>,
) -> Result<Vec<SlotRow>> {
    let mut sql = format!(
        "SELECT CAST(xid::TEXT AS BIGINT) AS xid, data FROM {function}($1, NULL, $2)"
    );
    let mut clauses: Vec<String> = Vec::new();
    let mut placeholder = 3;
    if txmin.is_some() {
        clauses.push(format!("CAST(xid::TEXT AS BIGINT) >= ${placeholder}"));
        placeholder += 1;
    }
    if txmax.is_some() {
        clauses.push(format!("CAST(xid::TEXT AS BIGINT) < ${placeholder}"));
    }
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }

    let mut query = sqlx::query_as::<_, (i64, String)>(&sql)
        .bind(slot_name)
        .bind(upto_nchanges);
    if let Some(txmin) = txmin {
        query = query.bind(txmin);
    }
    if let Some(txmax) = txmax {
        query = query.bind(txmax);
    }

    let rows = query.fetch_all(pool).await?;
    Ok(rows
        .into_iter()
        .map(|(xid, data)| SlotRow { xid, data })
        .collect())
}

/// Transaction boundary lines carry no row data and are skipped wholesale.
pub fn is_transaction_marker(data: &str) -> bool {
    data.starts_with("BEGIN") || data.starts_with("COMMIT")
}

/// Parse one `test_decoding` line into a [`ChangeEvent`].
pub fn parse_slot_line(row: &str) -> Result<ChangeEvent, SlotParseError> {
    let prefix = PREFIX
        .captures(row)
        .ok_or_else(|| SlotParseError::Prefix(row.to_string()))?;

    let tg_op_raw = &prefix["tg_op"];
    let tg_op = tg_op_raw
        .parse::<TgOp>()
        .map_err(|_| SlotParseError::UnknownOp {
            tg_op: tg_op_raw.to_string(),
            row: row.to_string(),
        })?;

    let mut event = ChangeEvent {
        tg_op,
        schema: Some(prefix["schema"].to_string()),
        table: prefix["table"].to_string(),
        old: Map::new(),
        new: Map::new(),
        xmin: None,
        indices: Vec::new(),
    };

    // group 0 is the whole match and always present on a successful capture
    let suffix = &row[prefix.get(0).unwrap().end()..];

    match (suffix.find("old-key:"), suffix.find("new-tuple:")) {
        (Some(old_start), Some(new_start)) => {
            // only UPDATE lines carry an old-key/new-tuple split
            if tg_op != TgOp::Update {
                return Err(SlotParseError::UnknownOp {
                    tg_op: tg_op_raw.to_string(),
                    row: row.to_string(),
                });
            }
            let old_segment = &suffix[old_start + "old-key:".len()..new_start];
            let new_segment = &suffix[new_start + "new-tuple:".len()..];
            event.old = parse_pairs(old_segment)?;
            event.new = parse_pairs(new_segment)?;
        }
        _ => {
            event.new = parse_pairs(suffix)?;
        }
    }

    Ok(event)
}

fn parse_pairs(segment: &str) -> Result<Map<String, Value>, SlotParseError> {
    let mut values = Map::new();
    for captures in SUFFIX.captures_iter(segment) {
        let key = captures["key"].to_string();
        let value = parse_value(&captures["data_type"], &captures["value"])?;
        values.insert(key, value);
    }
    Ok(values)
}

/// Map a declared column type to a scalar JSON value.
pub fn parse_value(data_type: &str, raw: &str) -> Result<Value, SlotParseError> {
    if raw.eq_ignore_ascii_case("null") {
        return Ok(Value::Null);
    }

    // strip any precision/length modifier before family matching
    let base_type = data_type.split('(').next().unwrap_or(data_type).trim();

    const INTEGER_TYPES: &[&str] = &[
        "bigint",
        "bigserial",
        "int",
        "int2",
        "int4",
        "int8",
        "integer",
        "serial",
        "serial2",
        "serial4",
        "serial8",
        "smallint",
        "smallserial",
    ];
    const TEXT_TYPES: &[&str] = &["char", "character", "character varying", "text", "uuid", "varchar"];
    const FLOAT_TYPES: &[&str] = &["double precision", "float4", "float8", "numeric", "real"];

    let invalid = || SlotParseError::Value {
        data_type: data_type.to_string(),
        value: raw.to_string(),
    };

    if INTEGER_TYPES.contains(&base_type) {
        let parsed: i64 = raw.parse().map_err(|_| invalid())?;
        return Ok(Value::from(parsed));
    }
    if TEXT_TYPES.contains(&base_type) {
        return Ok(Value::from(unquote(raw)));
    }
    if base_type == "boolean" {
        return match raw {
            "t" | "true" => Ok(Value::Bool(true)),
            "f" | "false" => Ok(Value::Bool(false)),
            _ => Err(invalid()),
        };
    }
    if FLOAT_TYPES.contains(&base_type) {
        let parsed: f64 = raw.parse().map_err(|_| invalid())?;
        return Ok(Value::from(parsed));
    }

    // any other type is carried through as its textual representation
    Ok(Value::from(unquote(raw)))
}

fn unquote(raw: &str) -> String {
    if raw.len() >= 2 && raw.starts_with('\'') && raw.ends_with('\'') {
        raw[1..raw.len() - 1].replace("''", "'")
    } else {
        raw.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    #[test]
    fn test_parse_insert() {
        let event = parse_slot_line(
            "table public.book: INSERT: isbn[character varying]:'abc' title[character varying]:'The Tiger Club' publisher_id[integer]:1",
        )
        .unwrap();
        assert_eq!(event.tg_op, TgOp::Insert);
        assert_eq!(event.schema.as_deref(), Some("public"));
        assert_eq!(event.table, "book");
        assert_eq!(event.new["isbn"], json!("abc"));
        assert_eq!(event.new["title"], json!("The Tiger Club"));
        assert_eq!(event.new["publisher_id"], json!(1));
        assert!(event.old.is_empty());
    }

    #[test]
    fn test_parse_update_with_old_key() {
        let event = parse_slot_line(
            "table public.book: UPDATE: old-key: isbn[character varying]:'abc' new-tuple: isbn[character varying]:'xyz' publisher_id[integer]:1",
        )
        .unwrap();
        assert_eq!(event.tg_op, TgOp::Update);
        assert_eq!(event.old["isbn"], json!("abc"));
        assert_eq!(event.new["isbn"], json!("xyz"));
        assert_eq!(event.new["publisher_id"], json!(1));
    }

    #[test]
    fn test_parse_delete_keys_only() {
        let event =
            parse_slot_line("table public.publisher: DELETE: id[integer]:1").unwrap();
        assert_eq!(event.tg_op, TgOp::Delete);
        assert_eq!(event.new["id"], json!(1));
    }

    #[test]
    fn test_parse_null_and_boolean() {
        let event = parse_slot_line(
            "table public.book: INSERT: isbn[character varying]:'a' publisher_id[integer]:null active[boolean]:t",
        )
        .unwrap();
        assert_eq!(event.new["publisher_id"], Value::Null);
        assert_eq!(event.new["active"], json!(true));
    }

    #[test]
    fn test_parse_quoted_table() {
        let event = parse_slot_line("table public.\"user\": INSERT: id[bigint]:7").unwrap();
        assert_eq!(event.table, "user");
        assert_eq!(event.new["id"], json!(7));
    }

    #[test]
    fn test_unknown_tg_op_is_an_error() {
        let err = parse_slot_line("table public.book: MERGE: id[integer]:1").unwrap_err();
        assert!(matches!(err, SlotParseError::UnknownOp { .. }), "{err}");
    }

    #[test]
    fn test_unparsable_prefix_is_an_error() {
        let err = parse_slot_line("BEGIN 1234").unwrap_err();
        assert!(matches!(err, SlotParseError::Prefix(_)), "{err}");
    }

    #[test]
    fn test_old_key_outside_update_is_an_error() {
        let err = parse_slot_line(
            "table public.book: INSERT: old-key: id[integer]:1 new-tuple: id[integer]:2",
        )
        .unwrap_err();
        assert!(matches!(err, SlotParseError::UnknownOp { .. }), "{err}");
    }

    #[rstest]
    #[case("bigint", "42", json!(42))]
    #[case("character varying(64)", "'a''b'", json!("a'b"))]
    #[case("text", "'plain'", json!("plain"))]
    #[case("double precision", "1.5", json!(1.5))]
    #[case("boolean", "t", json!(true))]
    #[case("boolean", "false", json!(false))]
    #[case("integer", "null", Value::Null)]
    #[case("timestamp without time zone", "'2024-01-01 00:00:00'", json!("2024-01-01 00:00:00"))]
    fn test_parse_value_families(
        #[case] data_type: &str,
        #[case] raw: &str,
        #[case] expected: Value,
    ) {
        assert_eq!(parse_value(data_type, raw).unwrap(), expected);
    }

    #[test]
    fn test_parse_value_invalid_number() {
        assert!(parse_value("integer", "abc").is_err());
        assert!(parse_value("real", "abc").is_err());
    }

    #[test]
    fn test_transaction_markers() {
        assert!(is_transaction_marker("BEGIN 1234"));
        assert!(is_transaction_marker("COMMIT 1234"));
        assert!(!is_transaction_marker("table public.book: INSERT: id[integer]:1"));
    }
}
