//! Catalog reflection. Each `(schema, table)` referenced by a tree is
//! materialized once into a [`TableModel`] carrying ordered columns, SQL
//! types and primary keys, together with the foreign-key edges between the
//! reflected tables. Models are read-only after warm-up.

use anyhow::Result;
use sqlx::{PgPool, Row};
use std::collections::{BTreeMap, BTreeSet};

use crate::errors::{ForeignKeyError, SchemaError};

/// Synthetic columns that participate in queries but are never emitted in
/// documents.
pub const SYNTHETIC_COLUMNS: &[&str] = &["xmin", "ctid", "oid"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnModel {
    pub name: String,
    pub data_type: String,
}

#[derive(Debug, Clone)]
pub struct TableModel {
    pub schema: String,
    pub name: String,
    pub columns: Vec<ColumnModel>,
    pub primary_keys: Vec<String>,
}

impl TableModel {
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|column| column.name == name)
    }

    /// Column names excluding the synthetic `xmin`/`ctid` pair.
    pub fn user_columns(&self) -> Vec<&str> {
        self.columns
            .iter()
            .map(|column| column.name.as_str())
            .filter(|name| !SYNTHETIC_COLUMNS.contains(name))
            .collect()
    }
}

/// A foreign-key edge discovered in the catalog: `child_table.child_columns`
/// references `parent_table.parent_columns`.
#[derive(Debug, Clone)]
pub struct ForeignKeyEdge {
    pub child_schema: String,
    pub child_table: String,
    pub child_columns: Vec<String>,
    pub parent_schema: String,
    pub parent_table: String,
    pub parent_columns: Vec<String>,
}

/// Join columns between a parent node table and a child node table,
/// whichever side of the edge each happens to be on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinKeys {
    /// Columns on the parent node's table.
    pub parent_columns: Vec<String>,
    /// Columns on the child node's table.
    pub child_columns: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    schemas: BTreeSet<String>,
    models: BTreeMap<String, TableModel>,
    edges: Vec<ForeignKeyEdge>,
}

impl ModelRegistry {
    /// Reflect every non-system schema in the connected database.
    pub async fn reflect(pool: &PgPool) -> Result<Self> {
        let schemas = fetch_schemas(pool).await?;
        let models = fetch_tables(pool).await?;
        let edges = fetch_foreign_keys(pool).await?;
        Ok(Self {
            schemas,
            models: models
                .into_iter()
                .map(|model| (model.qualified_name(), model))
                .collect(),
            edges,
        })
    }

    /// Registry from pre-built models; used by tests.
    pub fn from_models(models: Vec<TableModel>, edges: Vec<ForeignKeyEdge>) -> Self {
        let schemas = models.iter().map(|m| m.schema.clone()).collect();
        Self {
            schemas,
            models: models
                .into_iter()
                .map(|model| (model.qualified_name(), model))
                .collect(),
            edges,
        }
    }

    pub fn has_schema(&self, schema: &str) -> bool {
        self.schemas.contains(schema)
    }

    pub fn model(&self, schema: &str, table: &str) -> Result<&TableModel, SchemaError> {
        self.models
            .get(&format!("{schema}.{table}"))
            .ok_or_else(|| SchemaError::TableNotFound(format!("{schema}.{table}")))
    }

    /// Resolve the join columns between a parent table and a child table,
    /// looking for a foreign-key edge in either direction.
    pub fn foreign_keys(
        &self,
        parent: &TableModel,
        child: &TableModel,
    ) -> Result<JoinKeys, ForeignKeyError> {
        for edge in &self.edges {
            if edge.child_schema == child.schema
                && edge.child_table == child.name
                && edge.parent_schema == parent.schema
                && edge.parent_table == parent.name
            {
                return Ok(JoinKeys {
                    parent_columns: edge.parent_columns.clone(),
                    child_columns: edge.child_columns.clone(),
                });
            }
            if edge.child_schema == parent.schema
                && edge.child_table == parent.name
                && edge.parent_schema == child.schema
                && edge.parent_table == child.name
            {
                return Ok(JoinKeys {
                    parent_columns: edge.child_columns.clone(),
                    child_columns: edge.parent_columns.clone(),
                });
            }
        }
        Err(ForeignKeyError {
            parent: parent.qualified_name(),
            child: child.qualified_name(),
        })
    }

    /// All foreign-key columns on `table` that take part in an edge with
    /// another reflected table; used to build the trigger manifest.
    pub fn foreign_key_columns(&self, schema: &str, table: &str) -> Vec<String> {
        let mut columns = BTreeSet::new();
        for edge in &self.edges {
            if edge.child_schema == schema && edge.child_table == table {
                columns.extend(edge.child_columns.iter().cloned());
            }
            if edge.parent_schema == schema && edge.parent_table == table {
                columns.extend(edge.parent_columns.iter().cloned());
            }
        }
        columns.into_iter().collect()
    }
}

async fn fetch_schemas(pool: &PgPool) -> Result<BTreeSet<String>> {
    let rows = sqlx::query(
        r#"
        SELECT nspname
        FROM pg_namespace
        WHERE nspname NOT IN ('pg_catalog', 'information_schema')
          AND nspname NOT LIKE 'pg_%'
        ORDER BY nspname
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| row.get::<String, _>("nspname"))
        .collect())
}

async fn fetch_tables(pool: &PgPool) -> Result<Vec<TableModel>> {
    let column_rows = sqlx::query(
        r#"
        SELECT
            n.nspname AS table_schema,
            c.relname AS table_name,
            a.attname AS column_name,
            pg_catalog.format_type(a.atttypid, a.atttypmod) AS data_type
        FROM pg_attribute a
        JOIN pg_class c ON a.attrelid = c.oid
        JOIN pg_namespace n ON c.relnamespace = n.oid
        WHERE c.relkind IN ('r', 'v', 'm')
          AND a.attnum > 0
          AND NOT a.attisdropped
          AND n.nspname NOT IN ('pg_catalog', 'information_schema')
          AND n.nspname NOT LIKE 'pg_%'
        ORDER BY n.nspname, c.relname, a.attnum
        "#,
    )
    .fetch_all(pool)
    .await?;

    let pk_rows = sqlx::query(
        r#"
        SELECT
            n.nspname AS table_schema,
            c.relname AS table_name,
            a.attname AS column_name
        FROM pg_index i
        JOIN pg_class c ON c.oid = i.indrelid
        JOIN pg_namespace n ON c.relnamespace = n.oid
        JOIN pg_attribute a ON a.attrelid = c.oid AND a.attnum = ANY(i.indkey)
        WHERE i.indisprimary
          AND n.nspname NOT IN ('pg_catalog', 'information_schema')
          AND n.nspname NOT LIKE 'pg_%'
        ORDER BY n.nspname, c.relname, array_position(i.indkey, a.attnum)
        "#,
    )
    .fetch_all(pool)
    .await?;

    let mut models: BTreeMap<(String, String), TableModel> = BTreeMap::new();
    for row in column_rows {
        let schema: String = row.get("table_schema");
        let table: String = row.get("table_name");
        let model = models
            .entry((schema.clone(), table.clone()))
            .or_insert_with(|| TableModel {
                schema,
                name: table,
                columns: Vec::new(),
                primary_keys: Vec::new(),
            });
        model.columns.push(ColumnModel {
            name: row.get("column_name"),
            data_type: row.get("data_type"),
        });
    }
    for row in pk_rows {
        let key: (String, String) = (row.get("table_schema"), row.get("table_name"));
        if let Some(model) = models.get_mut(&key) {
            model.primary_keys.push(row.get("column_name"));
        }
    }

    Ok(models.into_values().collect())
}

async fn fetch_foreign_keys(pool: &PgPool) -> Result<Vec<ForeignKeyEdge>> {
    let rows = sqlx::query(
        r#"
        SELECT
            child_ns.nspname AS child_schema,
            child.relname AS child_table,
            parent_ns.nspname AS parent_schema,
            parent.relname AS parent_table,
            ARRAY(
                SELECT a.attname
                FROM unnest(con.conkey) WITH ORDINALITY AS k(attnum, ord)
                JOIN pg_attribute a ON a.attrelid = con.conrelid AND a.attnum = k.attnum
                ORDER BY k.ord
            ) AS child_columns,
            ARRAY(
                SELECT a.attname
                FROM unnest(con.confkey) WITH ORDINALITY AS k(attnum, ord)
                JOIN pg_attribute a ON a.attrelid = con.confrelid AND a.attnum = k.attnum
                ORDER BY k.ord
            ) AS parent_columns
        FROM pg_constraint con
        JOIN pg_class child ON con.conrelid = child.oid
        JOIN pg_namespace child_ns ON child.relnamespace = child_ns.oid
        JOIN pg_class parent ON con.confrelid = parent.oid
        JOIN pg_namespace parent_ns ON parent.relnamespace = parent_ns.oid
        WHERE con.contype = 'f'
        ORDER BY child_ns.nspname, child.relname, con.conname
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| ForeignKeyEdge {
            child_schema: row.get("child_schema"),
            child_table: row.get("child_table"),
            child_columns: row.get("child_columns"),
            parent_schema: row.get("parent_schema"),
            parent_table: row.get("parent_table"),
            parent_columns: row.get("parent_columns"),
        })
        .collect())
}
