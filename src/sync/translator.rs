//! Change-to-document translation: given a homogeneous batch of events
//! sharing `(tg_op, table)`, decide which root documents must be
//! re-materialized (as filters for the query builder) and which must be
//! deleted outright. Descendant changes are located through the `_meta`
//! reverse index stored in the search engine; it is never maintained
//! in-process.

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::constants::PRIMARY_KEY_DELIMITER;
use crate::db::model::ModelRegistry;
use crate::query::{FilterEntry, Filters, join_keys};
use crate::search::{BulkAction, SearchClient};
use crate::sync::event::{ChangeEvent, TgOp};
use crate::tree::{Node, Tree};

/// The sink-side lookups the translator needs; faked in tests.
#[allow(async_fn_in_trait)]
pub trait MetaLookup {
    async fn search_meta(
        &self,
        index: &str,
        table: &str,
        fields: &BTreeMap<String, Vec<Value>>,
    ) -> Result<Vec<String>>;

    async fn meta_table_ids(&self, index: &str, table: &str) -> Result<Vec<String>>;

    async fn all_doc_ids(&self, index: &str) -> Result<Vec<String>>;
}

impl MetaLookup for SearchClient {
    async fn search_meta(
        &self,
        index: &str,
        table: &str,
        fields: &BTreeMap<String, Vec<Value>>,
    ) -> Result<Vec<String>> {
        Ok(SearchClient::search_meta(self, index, table, fields).await?)
    }

    async fn meta_table_ids(&self, index: &str, table: &str) -> Result<Vec<String>> {
        Ok(SearchClient::meta_table_ids(self, index, table).await?)
    }

    async fn all_doc_ids(&self, index: &str) -> Result<Vec<String>> {
        Ok(SearchClient::all_doc_ids(self, index).await?)
    }
}

/// What a batch translates to: resync filters for the query builder and/or
/// direct delete actions for the sink.
#[derive(Debug, Default)]
pub struct Translation {
    pub filters: Filters,
    pub deletes: Vec<BulkAction>,
}

impl Translation {
    pub fn is_empty(&self) -> bool {
        self.filters.values().all(Vec::is_empty) && self.deletes.is_empty()
    }
}

/// Join primary-key values into a document `_id`.
pub fn doc_id(values: &[Value]) -> String {
    values
        .iter()
        .map(|value| match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join(&PRIMARY_KEY_DELIMITER.to_string())
}

pub struct ChangeTranslator<'a> {
    pub tree: &'a Tree,
    pub registry: &'a ModelRegistry,
    pub index: &'a str,
    pub routing: Option<&'a str>,
}

impl ChangeTranslator<'_> {
    /// Translate a batch of events sharing `(tg_op, table)`. Events for
    /// tables outside the tree are dropped.
    pub async fn translate<L: MetaLookup>(
        &self,
        lookup: &L,
        events: &[ChangeEvent],
    ) -> Result<Translation> {
        let mut translation = Translation::default();
        let Some(first) = events.first() else {
            return Ok(translation);
        };
        let table = first.table.as_str();

        if !self.tree.contains(table) {
            return Ok(translation);
        }

        self.validate_primary_keys(first.schema.as_deref(), table, events)?;

        let root = &self.tree.root;
        translation.filters.insert(root.table.clone(), Vec::new());

        match first.tg_op {
            TgOp::Insert => self.insert_op(table, events, &mut translation)?,
            TgOp::Update => self.update_op(lookup, table, events, &mut translation).await?,
            TgOp::Delete => self.delete_op(lookup, table, events, &mut translation).await?,
            TgOp::Truncate => self.truncate_op(lookup, table, &mut translation).await?,
        }

        Ok(translation)
    }

    /// Every non-truncate event must carry the table's primary keys; a
    /// trigger or slot line missing them cannot be translated safely.
    fn validate_primary_keys(
        &self,
        schema: Option<&str>,
        table: &str,
        events: &[ChangeEvent],
    ) -> Result<()> {
        let schema = schema.unwrap_or_else(|| self.node_schema(table));
        let model = self.registry.model(schema, table)?;
        for event in events {
            let data = event.data();
            if data.is_empty() {
                continue;
            }
            for pk in &model.primary_keys {
                anyhow::ensure!(
                    data.contains_key(pk),
                    "primary key \"{pk}\" missing from payload for table {schema}.{table}"
                );
            }
        }
        Ok(())
    }

    fn node_schema(&self, table: &str) -> &str {
        self.tree
            .node_for_table(table)
            .map(|node| node.schema.as_str())
            .unwrap_or(self.tree.root.schema.as_str())
    }

    fn insert_op(
        &self,
        table: &str,
        events: &[ChangeEvent],
        translation: &mut Translation,
    ) -> Result<()> {
        let root = &self.tree.root;

        if table == root.table {
            for event in events {
                translation
                    .filters
                    .get_mut(&root.table)
                    .expect("translate seeds the root filter entry")
                    .push(primary_key_filter(root, event.data()));
            }
            return Ok(());
        }

        // a change below the root re-materializes its parent's documents:
        // map the changed rows' FK values onto the parent's columns
        let (parent, join) = if self.tree.tables.contains(table) {
            let node = self.tree.node_for_table(table).context("node not in tree")?;
            let parent = self
                .tree
                .parent_of(table)
                .with_context(|| format!("could not get parent of node: {table}"))?;
            let parent_model = self.registry.model(&parent.schema, &parent.table)?;
            let node_model = self.registry.model(&node.schema, &node.table)?;
            let declared = node
                .relationship
                .as_ref()
                .and_then(|relationship| relationship.foreign_key.as_ref());
            (parent, join_keys(self.registry, parent_model, node_model, declared)?)
        } else {
            // through-table: react on behalf of the child it links in
            let (parent, _child) = self
                .tree
                .through_endpoints(table)
                .with_context(|| format!("could not get parent of through table: {table}"))?;
            let parent_model = self.registry.model(&parent.schema, &parent.table)?;
            let through_model = self.registry.model(&parent.schema, table)?;
            (parent, join_keys(self.registry, parent_model, through_model, None)?)
        };

        let entries = translation.filters.entry(parent.table.clone()).or_default();
        for event in events {
            let data = event.data();
            for (child_column, parent_column) in
                join.child_columns.iter().zip(&join.parent_columns)
            {
                if let Some(value) = data.get(child_column) {
                    if !value.is_null() {
                        entries.push(FilterEntry::from([(parent_column.clone(), value.clone())]));
                    }
                }
            }
        }
        Ok(())
    }

    async fn update_op<L: MetaLookup>(
        &self,
        lookup: &L,
        table: &str,
        events: &[ChangeEvent],
        translation: &mut Translation,
    ) -> Result<()> {
        let root = &self.tree.root;

        if table == root.table {
            for event in events {
                translation
                    .filters
                    .get_mut(&root.table)
                    .expect("translate seeds the root filter entry")
                    .push(primary_key_filter(root, event.data()));

                // a primary-key rename leaves the old document behind;
                // delete it so both versions never coexist
                let old_values: Vec<Value> = root
                    .primary_keys
                    .iter()
                    .filter_map(|pk| event.old.get(pk).cloned())
                    .collect();
                let new_values: Vec<Value> = root
                    .primary_keys
                    .iter()
                    .filter_map(|pk| event.new.get(pk).cloned())
                    .collect();
                if old_values.len() == new_values.len()
                    && !old_values.is_empty()
                    && old_values != new_values
                {
                    translation.deletes.push(BulkAction::Delete {
                        id: doc_id(&old_values),
                        routing: self.routing_value(&event.old),
                    });
                }
            }
            return Ok(());
        }

        let node = self.tree.node_for_table(table).context("node not in tree")?;
        for event in events {
            // locate the documents this row contributed to
            let mut fields: BTreeMap<String, Vec<Value>> = BTreeMap::new();
            for pk in &node.primary_keys {
                let mut values = Vec::new();
                if let Some(value) = event.old.get(pk) {
                    if !value.is_null() {
                        values.push(value.clone());
                    }
                }
                if let Some(value) = event.new.get(pk) {
                    if !value.is_null() && !values.contains(value) {
                        values.push(value.clone());
                    }
                }
                if !values.is_empty() {
                    fields.insert(pk.clone(), values);
                }
            }
            for id in lookup.search_meta(self.index, table, &fields).await? {
                self.push_root_filter(translation, &id);
            }

            // walk both the old and the new parent so orphaned and newly
            // adopted rows re-materialize too
            if let Some(parent) = self.tree.parent_of(table) {
                let parent_model = self.registry.model(&parent.schema, &parent.table)?;
                let node_model = self.registry.model(&node.schema, &node.table)?;
                let declared = node
                    .relationship
                    .as_ref()
                    .and_then(|relationship| relationship.foreign_key.as_ref());
                let join = join_keys(self.registry, parent_model, node_model, declared)?;

                let mut parent_fields: BTreeMap<String, Vec<Value>> = BTreeMap::new();
                for (child_column, parent_column) in
                    join.child_columns.iter().zip(&join.parent_columns)
                {
                    let mut values = Vec::new();
                    for image in [&event.old, &event.new] {
                        if let Some(value) = image.get(child_column) {
                            if !value.is_null() && !values.contains(value) {
                                values.push(value.clone());
                            }
                        }
                    }
                    if !values.is_empty() {
                        parent_fields.insert(parent_column.clone(), values);
                    }
                }
                if !parent_fields.is_empty() {
                    for id in lookup
                        .search_meta(self.index, &parent.table, &parent_fields)
                        .await?
                    {
                        self.push_root_filter(translation, &id);
                    }
                    if parent.table == root.table {
                        // the parent rows themselves are roots
                        for values in &parent_fields {
                            let (column, candidates) = values;
                            for candidate in candidates {
                                self.push_root_filter_entry(
                                    translation,
                                    FilterEntry::from([(column.clone(), candidate.clone())]),
                                );
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn delete_op<L: MetaLookup>(
        &self,
        lookup: &L,
        table: &str,
        events: &[ChangeEvent],
        translation: &mut Translation,
    ) -> Result<()> {
        let root = &self.tree.root;

        if table == root.table {
            for event in events {
                let data = event.data();
                let values: Vec<Value> = root
                    .primary_keys
                    .iter()
                    .filter_map(|pk| data.get(pk).cloned())
                    .collect();
                translation.deletes.push(BulkAction::Delete {
                    id: doc_id(&values),
                    routing: self.routing_value(data),
                });
            }
            return Ok(());
        }

        let node = self.tree.node_for_table(table).context("node not in tree")?;
        for event in events {
            let data = event.data();
            let mut fields: BTreeMap<String, Vec<Value>> = BTreeMap::new();
            for pk in &node.primary_keys {
                if let Some(value) = data.get(pk) {
                    if !value.is_null() {
                        fields.entry(pk.clone()).or_default().push(value.clone());
                    }
                }
            }
            for id in lookup.search_meta(self.index, table, &fields).await? {
                self.push_root_filter(translation, &id);
            }
        }
        Ok(())
    }

    async fn truncate_op<L: MetaLookup>(
        &self,
        lookup: &L,
        table: &str,
        translation: &mut Translation,
    ) -> Result<()> {
        let root = &self.tree.root;

        if table == root.table {
            for id in lookup.all_doc_ids(self.index).await? {
                translation.deletes.push(BulkAction::Delete { id, routing: None });
            }
            return Ok(());
        }

        for id in lookup.meta_table_ids(self.index, table).await? {
            self.push_root_filter(translation, &id);
        }
        Ok(())
    }

    /// Split a document `_id` back into root primary-key restrictions.
    fn push_root_filter(&self, translation: &mut Translation, id: &str) {
        let root = &self.tree.root;
        let parts: Vec<&str> = id.split(PRIMARY_KEY_DELIMITER).collect();
        let entry: FilterEntry = root
            .primary_keys
            .iter()
            .zip(parts)
            .map(|(pk, part)| (pk.clone(), Value::String(part.to_string())))
            .collect();
        self.push_root_filter_entry(translation, entry);
    }

    fn push_root_filter_entry(&self, translation: &mut Translation, entry: FilterEntry) {
        let entries = translation
            .filters
            .entry(self.tree.root.table.clone())
            .or_default();
        if !entries.contains(&entry) {
            entries.push(entry);
        }
    }

    fn routing_value(&self, data: &Map<String, Value>) -> Option<String> {
        let column = self.routing?;
        data.get(column).map(|value| match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }
}

fn primary_key_filter(node: &Node, data: &Map<String, Value>) -> FilterEntry {
    node.primary_keys
        .iter()
        .filter_map(|pk| data.get(pk).map(|value| (pk.clone(), value.clone())))
        .collect()
}
