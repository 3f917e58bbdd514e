//! Compiles a schema tree into one SQL statement per root. For every row
//! selected by the root's filters the statement emits three columns:
//!
//! - `_keys`: the nested primary-key manifest, squashed into `_meta` by
//!   [`crate::meta::private_keys`] after fetch;
//! - `_source`: the tree-shaped document body;
//! - `_pks`: the root primary-key values, joined into the `_id`.
//!
//! Children become grouped subqueries joined on their foreign-key columns;
//! a child carrying filters turns its parent join INNER so targeted resyncs
//! restrict the statement to the affected roots.

use anyhow::Result;
use itertools::Itertools;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::db::model::{JoinKeys, ModelRegistry, TableModel};
use crate::errors::ForeignKeyError;
use crate::query::sql::{literal, quote_ident, quote_literal};
use crate::schema::ForeignKeyDef;
use crate::tree::{ColumnRef, Node, RelationshipType, RelationshipVariant, Tree};

/// One AND-ed restriction; entries in a list are OR-ed together.
pub type FilterEntry = BTreeMap<String, Value>;

/// Per-table restrictions applied wherever the table appears in the tree.
pub type Filters = BTreeMap<String, Vec<FilterEntry>>;

/// Extra root-level restrictions for forward-pass and tuple-scoped resyncs.
#[derive(Debug, Clone, Default)]
pub struct RootScope {
    pub txmin: Option<i64>,
    pub txmax: Option<i64>,
    /// Physical tuple restriction: page number to row offsets.
    pub ctid: Option<BTreeMap<i64, Vec<i64>>>,
}

/// Resolve the join columns between a parent and child table, preferring
/// columns declared on the relationship over catalog discovery.
pub fn join_keys(
    registry: &ModelRegistry,
    parent: &TableModel,
    child: &TableModel,
    declared: Option<&ForeignKeyDef>,
) -> Result<JoinKeys, ForeignKeyError> {
    if let Some(declared) = declared {
        if !declared.parent.is_empty() && !declared.child.is_empty() {
            return Ok(JoinKeys {
                parent_columns: declared.parent.clone(),
                child_columns: declared.child.clone(),
            });
        }
    }
    registry.foreign_keys(parent, child)
}

pub struct QueryBuilder<'a> {
    registry: &'a ModelRegistry,
}

struct CompiledChild {
    alias: String,
    label: String,
    sql: String,
    join_clause: String,
    inner: bool,
}

impl<'a> QueryBuilder<'a> {
    pub fn new(registry: &'a ModelRegistry) -> Self {
        Self { registry }
    }

    /// Build the root document statement.
    pub fn build(&self, tree: &Tree, filters: &Filters, scope: &RootScope) -> Result<String> {
        let root = &tree.root;
        let mut counter = 0usize;
        let root_alias = next_alias(&root.table, &mut counter);

        let children = root
            .children
            .iter()
            .map(|child| self.compile_child(root, &root_alias, child, filters, &mut counter))
            .collect::<Result<Vec<_>>>()?;

        let keys = format!(
            "JSON_BUILD_ARRAY({})",
            children
                .iter()
                .map(|child| format!("{}.\"_keys\"", child.alias))
                .join(", ")
        );

        let mut source_pairs: Vec<String> = Vec::new();
        for column in &root.columns {
            source_pairs.push(quote_literal(&column.alias()));
            source_pairs.push(column_expr(&root_alias, column));
        }
        for child in &children {
            source_pairs.push(quote_literal(&child.label));
            source_pairs.push(format!("{}.{}", child.alias, quote_ident(&child.label)));
        }
        let source = format!("JSON_BUILD_OBJECT({})", source_pairs.join(", "));

        let pks = format!(
            "JSON_BUILD_ARRAY({})",
            root.primary_keys
                .iter()
                .map(|pk| format!("{root_alias}.{}", quote_ident(pk)))
                .join(", ")
        );

        let mut sql = format!(
            "SELECT {keys} AS \"_keys\", {source} AS \"_source\", {pks} AS \"_pks\"\nFROM {}.{} AS {root_alias}",
            quote_ident(&root.schema),
            quote_ident(&root.table),
        );
        for child in &children {
            sql.push_str(&format!(
                "\n{} JOIN (\n{}\n) AS {} ON {}",
                if child.inner { "INNER" } else { "LEFT OUTER" },
                child.sql,
                child.alias,
                child.join_clause,
            ));
        }

        let mut clauses: Vec<String> = Vec::new();
        if let Some(entries) = filters.get(&root.table) {
            if !entries.is_empty() {
                clauses.push(render_filters(&root_alias, entries));
            }
        }
        if let Some(txmin) = scope.txmin {
            clauses.push(format!(
                "CAST(CAST({root_alias}.\"xmin\" AS TEXT) AS BIGINT) >= {txmin}"
            ));
        }
        if let Some(txmax) = scope.txmax {
            clauses.push(format!(
                "CAST(CAST({root_alias}.\"xmin\" AS TEXT) AS BIGINT) < {txmax}"
            ));
        }
        if let Some(ctid) = &scope.ctid {
            let tids = ctid
                .iter()
                .flat_map(|(page, offsets)| {
                    offsets
                        .iter()
                        .map(move |offset| quote_literal(&format!("({page},{offset})")))
                })
                .join(", ");
            clauses.push(format!("{root_alias}.\"ctid\" = ANY (ARRAY[{tids}]::TID[])"));
        }
        if !clauses.is_empty() {
            sql.push_str("\nWHERE ");
            sql.push_str(&clauses.join(" AND "));
        }

        Ok(sql)
    }

    fn compile_child(
        &self,
        parent: &Node,
        parent_alias: &str,
        child: &Node,
        filters: &Filters,
        counter: &mut usize,
    ) -> Result<CompiledChild> {
        match child.through_table() {
            Some(through) => {
                self.compile_through(parent, parent_alias, child, through, filters, counter)
            }
            None => self.compile_non_through(parent, parent_alias, child, filters, counter),
        }
    }

    fn compile_non_through(
        &self,
        parent: &Node,
        parent_alias: &str,
        child: &Node,
        filters: &Filters,
        counter: &mut usize,
    ) -> Result<CompiledChild> {
        let relationship = child
            .relationship
            .as_ref()
            .expect("non-root node carries a relationship");
        let alias = next_alias(&child.table, counter);

        let parent_model = self.registry.model(&parent.schema, &parent.table)?;
        let child_model = self.registry.model(&child.schema, &child.table)?;
        let join = join_keys(
            self.registry,
            parent_model,
            child_model,
            relationship.foreign_key.as_ref(),
        )?;

        let grandchildren = child
            .children
            .iter()
            .map(|grandchild| self.compile_child(child, &alias, grandchild, filters, counter))
            .collect::<Result<Vec<_>>>()?;

        // the node's own `_keys` contribution
        let pk_pairs = child
            .primary_keys
            .iter()
            .map(|pk| {
                let column = format!("{alias}.{}", quote_ident(pk));
                if parent.relationship.is_none() {
                    // values under the root are wrapped so they squash into lists
                    format!("{}, JSON_BUILD_ARRAY({column})", quote_literal(pk))
                } else {
                    format!("{}, {column}", quote_literal(pk))
                }
            })
            .join(", ");
        let params = format!("JSON_BUILD_OBJECT({pk_pairs})");
        let mut keys = match relationship.kind {
            RelationshipType::OneToOne => format!(
                "CAST(JSON_BUILD_OBJECT({}, {params}) AS JSONB)",
                quote_literal(&child.table)
            ),
            RelationshipType::OneToMany => format!(
                "CAST(JSON_BUILD_OBJECT({}, JSON_AGG({params})) AS JSONB)",
                quote_literal(&child.table)
            ),
        };
        for grandchild in &grandchildren {
            let piece = match relationship.kind {
                RelationshipType::OneToMany => {
                    format!("CAST(JSON_AGG({}.\"_keys\") AS JSONB)", grandchild.alias)
                }
                RelationshipType::OneToOne => {
                    format!(
                        "CAST(JSON_BUILD_ARRAY({}.\"_keys\") AS JSONB)",
                        grandchild.alias
                    )
                }
            };
            keys = format!("{keys} || {piece}");
        }

        let payload = render_payload(&alias, child, &grandchildren, relationship.kind);

        let mut select = vec![
            format!("{keys} AS \"_keys\""),
            format!("{payload} AS {}", quote_ident(&child.label)),
        ];
        for column in &join.child_columns {
            select.push(format!("{alias}.{}", quote_ident(column)));
        }

        let mut sql = format!(
            "SELECT {}\nFROM {}.{} AS {alias}",
            select.join(", "),
            quote_ident(&child.schema),
            quote_ident(&child.table),
        );
        for grandchild in &grandchildren {
            sql.push_str(&format!(
                "\n{} JOIN (\n{}\n) AS {} ON {}",
                if grandchild.inner { "INNER" } else { "LEFT OUTER" },
                grandchild.sql,
                grandchild.alias,
                grandchild.join_clause,
            ));
        }
        if let Some(entries) = filters.get(&child.table) {
            if !entries.is_empty() {
                sql.push_str("\nWHERE ");
                sql.push_str(&render_filters(&alias, entries));
            }
        }
        if relationship.kind == RelationshipType::OneToMany {
            sql.push_str("\nGROUP BY ");
            sql.push_str(
                &join
                    .child_columns
                    .iter()
                    .map(|column| format!("{alias}.{}", quote_ident(column)))
                    .join(", "),
            );
        }

        let join_clause = render_join(
            &alias,
            &join.child_columns,
            parent_alias,
            &join.parent_columns,
            child.table == parent.table,
        );

        Ok(CompiledChild {
            alias,
            label: child.label.clone(),
            sql,
            join_clause,
            inner: subtree_has_filters(child, filters),
        })
    }

    /// A through child joins twice: the child subquery hangs off the
    /// through-table rows, and the aggregate of those rows hangs off the
    /// parent, grouped by the through-table's parent-facing columns.
    fn compile_through(
        &self,
        parent: &Node,
        parent_alias: &str,
        child: &Node,
        through_table: &str,
        filters: &Filters,
        counter: &mut usize,
    ) -> Result<CompiledChild> {
        let outer_alias = next_alias(&child.table, counter);
        let through_alias = next_alias(through_table, counter);
        let inner_alias = next_alias(&child.label, counter);

        let parent_model = self.registry.model(&parent.schema, &parent.table)?;
        let child_model = self.registry.model(&child.schema, &child.table)?;
        let through_model = self.registry.model(&child.schema, through_table)?;

        // through-to-child and parent-to-through edges
        let child_join = join_keys(self.registry, through_model, child_model, None)?;
        let through_join = join_keys(self.registry, parent_model, through_model, None)?;

        let grandchildren = child
            .children
            .iter()
            .map(|grandchild| self.compile_child(child, &outer_alias, grandchild, filters, counter))
            .collect::<Result<Vec<_>>>()?;

        // the child rows, keyed by the columns the through-table points at
        let key_params = child_join
            .child_columns
            .iter()
            .map(|column| {
                format!(
                    "JSON_BUILD_OBJECT({}, JSON_BUILD_ARRAY({outer_alias}.{}))",
                    quote_literal(column),
                    quote_ident(column)
                )
            })
            .join(", ");
        let mut keys = format!(
            "CAST(JSON_BUILD_OBJECT({}, JSON_BUILD_ARRAY({key_params})) AS JSONB)",
            quote_literal(&child.table)
        );
        for grandchild in &grandchildren {
            keys = format!(
                "{keys} || CAST(JSON_BUILD_ARRAY({}.\"_keys\") AS JSONB)",
                grandchild.alias
            );
        }

        let payload = render_payload(&outer_alias, child, &grandchildren, RelationshipType::OneToOne);

        let mut select = vec![
            format!("{keys} AS \"_keys\""),
            format!("{payload} AS \"anon\""),
        ];
        for column in &child_join.child_columns {
            select.push(format!("{outer_alias}.{}", quote_ident(column)));
        }

        let mut outer_sql = format!(
            "SELECT {}\nFROM {}.{} AS {outer_alias}",
            select.join(", "),
            quote_ident(&child.schema),
            quote_ident(&child.table),
        );
        for grandchild in &grandchildren {
            outer_sql.push_str(&format!(
                "\n{} JOIN (\n{}\n) AS {} ON {}",
                if grandchild.inner { "INNER" } else { "LEFT OUTER" },
                grandchild.sql,
                grandchild.alias,
                grandchild.join_clause,
            ));
        }
        if let Some(entries) = filters.get(&child.table) {
            if !entries.is_empty() {
                outer_sql.push_str("\nWHERE ");
                outer_sql.push_str(&render_filters(&outer_alias, entries));
            }
        }

        // the through-table's own `_meta` contribution rides along with
        // every aggregated child row
        let through_pk_params = through_model
            .primary_keys
            .iter()
            .map(|pk| {
                format!(
                    "JSON_BUILD_OBJECT({}, JSON_BUILD_ARRAY({through_alias}.{}))",
                    quote_literal(pk),
                    quote_ident(pk)
                )
            })
            .join(", ");
        let through_keys = format!(
            "CAST(JSON_BUILD_OBJECT({}, JSON_BUILD_ARRAY({through_pk_params})) AS JSONB)",
            quote_literal(through_table)
        );

        let mut inner_select = vec![
            format!(
                "JSON_AGG(CAST({outer_alias}.\"_keys\" AS JSONB) || {through_keys}) AS \"_keys\""
            ),
            format!("JSON_AGG({outer_alias}.\"anon\") AS {}", quote_ident(&child.label)),
        ];
        for column in &through_join.child_columns {
            inner_select.push(format!("{through_alias}.{}", quote_ident(column)));
        }

        let outer_join_clause = child_join
            .child_columns
            .iter()
            .zip(&child_join.parent_columns)
            .map(|(child_column, through_column)| {
                format!(
                    "{outer_alias}.{} = {through_alias}.{}",
                    quote_ident(child_column),
                    quote_ident(through_column)
                )
            })
            .join(" AND ");

        let child_filtered = subtree_has_filters(child, filters)
            || filters.get(through_table).is_some_and(|entries| !entries.is_empty());
        let mut inner_sql = format!(
            "SELECT {}\nFROM {}.{} AS {through_alias}\n{} JOIN (\n{outer_sql}\n) AS {outer_alias} ON {outer_join_clause}",
            inner_select.join(", "),
            quote_ident(&child.schema),
            quote_ident(through_table),
            if child_filtered { "INNER" } else { "LEFT OUTER" },
        );
        if let Some(entries) = filters.get(through_table) {
            if !entries.is_empty() {
                inner_sql.push_str("\nWHERE ");
                inner_sql.push_str(&render_filters(&through_alias, entries));
            }
        }
        inner_sql.push_str("\nGROUP BY ");
        inner_sql.push_str(
            &through_join
                .child_columns
                .iter()
                .map(|column| format!("{through_alias}.{}", quote_ident(column)))
                .join(", "),
        );

        let join_clause = render_join(
            &inner_alias,
            &through_join.child_columns,
            parent_alias,
            &through_join.parent_columns,
            child.table == parent.table,
        );

        Ok(CompiledChild {
            alias: inner_alias,
            label: child.label.clone(),
            sql: inner_sql,
            join_clause,
            inner: child_filtered,
        })
    }
}

fn next_alias(name: &str, counter: &mut usize) -> String {
    let alias: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();
    let alias = format!("{}_{}", alias.to_lowercase(), counter);
    *counter += 1;
    alias
}

fn column_expr(alias: &str, column: &ColumnRef) -> String {
    let mut expr = format!("{alias}.{}", quote_ident(&column.name));
    for segment in &column.path {
        expr.push_str(&format!("->{}", quote_literal(segment)));
    }
    expr
}

fn render_payload(
    alias: &str,
    node: &Node,
    grandchildren: &[CompiledChild],
    kind: RelationshipType,
) -> String {
    let relationship = node
        .relationship
        .as_ref()
        .expect("non-root node carries a relationship");
    match relationship.variant {
        RelationshipVariant::Scalar => {
            let expr = column_expr(alias, &node.columns[0]);
            match kind {
                RelationshipType::OneToOne => expr,
                RelationshipType::OneToMany => format!("JSON_AGG({expr})"),
            }
        }
        RelationshipVariant::Object => {
            let mut pairs: Vec<String> = Vec::new();
            for column in &node.columns {
                pairs.push(quote_literal(&column.alias()));
                pairs.push(column_expr(alias, column));
            }
            for grandchild in grandchildren {
                pairs.push(quote_literal(&grandchild.label));
                pairs.push(format!(
                    "{}.{}",
                    grandchild.alias,
                    quote_ident(&grandchild.label)
                ));
            }
            let object = format!("JSON_BUILD_OBJECT({})", pairs.join(", "));
            match kind {
                RelationshipType::OneToOne => object,
                RelationshipType::OneToMany => format!("JSON_AGG({object})"),
            }
        }
    }
}

fn render_join(
    child_alias: &str,
    child_columns: &[String],
    parent_alias: &str,
    parent_columns: &[String],
    self_referential: bool,
) -> String {
    let clauses = child_columns
        .iter()
        .zip(parent_columns)
        .map(|(child_column, parent_column)| {
            format!(
                "{child_alias}.{} = {parent_alias}.{}",
                quote_ident(child_column),
                quote_ident(parent_column)
            )
        });
    // cyclic trees of the same entity join on either side of the edge
    if self_referential {
        clauses.collect::<Vec<_>>().join(" OR ")
    } else {
        clauses.collect::<Vec<_>>().join(" AND ")
    }
}

fn render_filters(alias: &str, entries: &[FilterEntry]) -> String {
    let rendered = entries
        .iter()
        .map(|entry| {
            let conjunction = entry
                .iter()
                .map(|(column, value)| {
                    format!("{alias}.{} = {}", quote_ident(column), literal(value))
                })
                .join(" AND ");
            format!("({conjunction})")
        })
        .join(" OR ");
    format!("({rendered})")
}

/// Whether the node or anything beneath it (including its through-table)
/// carries a filter; such joins must be INNER to restrict the root set.
fn subtree_has_filters(node: &Node, filters: &Filters) -> bool {
    node.pre_order().into_iter().any(|descendant| {
        let filtered = |table: &str| filters.get(table).is_some_and(|entries| !entries.is_empty());
        filtered(&descendant.table)
            || descendant.through_table().is_some_and(filtered)
    })
}
