//! The `_view` manifest: a per-schema materialized view with one row per
//! in-tree table listing its primary keys, foreign keys, owning indices and
//! the columns whose changes are worth notifying about. The trigger
//! function reads this instead of re-deriving key sets per row. The view is
//! rebuilt whenever bootstrap runs so watched-column changes take effect.

use anyhow::Result;
use itertools::Itertools;
use sqlx::PgPool;
use tracing::debug;

use crate::constants::MATERIALIZED_VIEW;
use crate::query::sql::{quote_ident, quote_literal};

#[derive(Debug, Clone)]
pub struct ManifestRow {
    pub table_name: String,
    pub primary_keys: Vec<String>,
    pub foreign_keys: Vec<String>,
    pub indices: Vec<String>,
    /// Columns whose UPDATEs should notify; the trigger drops everything
    /// else before it reaches the channel.
    pub columns: Vec<String>,
}

fn text_array(values: &[String]) -> String {
    if values.is_empty() {
        return "ARRAY[]::TEXT[]".to_string();
    }
    format!(
        "ARRAY[{}]::TEXT[]",
        values.iter().map(|value| quote_literal(value)).join(", ")
    )
}

pub fn create_view_sql(schema: &str, rows: &[ManifestRow]) -> String {
    let values = rows
        .iter()
        .map(|row| {
            format!(
                "({}, {}, {}, {}, {})",
                quote_literal(&row.table_name),
                text_array(&row.primary_keys),
                text_array(&row.foreign_keys),
                text_array(&row.indices),
                text_array(&row.columns),
            )
        })
        .join(",\n       ");
    format!(
        "CREATE MATERIALIZED VIEW {}.{} AS\nSELECT * FROM (\nVALUES {}\n) AS t (table_name, primary_keys, foreign_keys, indices, columns)",
        quote_ident(schema),
        quote_ident(MATERIALIZED_VIEW),
        values,
    )
}

pub async fn create_view(pool: &PgPool, schema: &str, rows: &[ManifestRow]) -> Result<()> {
    drop_view(pool, schema).await?;
    debug!(schema, rows = rows.len(), "creating manifest view");
    sqlx::raw_sql(&create_view_sql(schema, rows)).execute(pool).await?;
    Ok(())
}

pub async fn drop_view(pool: &PgPool, schema: &str) -> Result<()> {
    let sql = format!(
        "DROP MATERIALIZED VIEW IF EXISTS {}.{} CASCADE",
        quote_ident(schema),
        quote_ident(MATERIALIZED_VIEW),
    );
    sqlx::raw_sql(&sql).execute(pool).await?;
    Ok(())
}
