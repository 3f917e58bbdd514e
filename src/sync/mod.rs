//! Ties the tree, the source-database adapter, the query builder and the
//! search sink together for one schema document: bootstrap/teardown of the
//! replication plumbing, full and targeted materialization, and the
//! translation of change batches into index writes.

pub mod event;
pub mod pipeline;
pub mod translator;

use anyhow::{Context, Result};
use futures_util::TryStreamExt;
use serde_json::Value;
use sqlx::{PgPool, Row};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::checkpoint::{self, Checkpoint};
use crate::constants::META;
use crate::db::model::ModelRegistry;
use crate::db::{connection, slot, trigger, view};
use crate::meta;
use crate::query::{Filters, QueryBuilder, RootScope, join_keys};
use crate::schema::SchemaDocument;
use crate::search::{BulkAction, SearchClient};
use crate::settings::Settings;
use crate::transform;
use crate::tree::Tree;
use event::{ChangeEvent, TgOp};
use translator::{ChangeTranslator, doc_id};

/// Throughput counters reported by the status task.
#[derive(Debug, Default)]
pub struct Counters {
    /// Rows seen on the replication slot.
    pub xlog: AtomicU64,
    /// Notifications received from the database.
    pub db: AtomicU64,
    /// Events popped from the durable queue.
    pub queue: AtomicU64,
}

pub struct Sync {
    pub document: SchemaDocument,
    pub database: String,
    pub index: String,
    /// Sanitized `{database}_{index}`; names the slot, queue and checkpoint.
    pub name: String,
    pub settings: Settings,
    pub pool: PgPool,
    pub registry: ModelRegistry,
    pub tree: Tree,
    pub search: SearchClient,
    pub checkpoint: Mutex<Checkpoint>,
    pub counters: Counters,
    /// Set once the initial pull has completed; gates the slot compactor.
    pub pulled: AtomicBool,
}

impl Sync {
    pub async fn new(document: SchemaDocument, settings: Settings) -> Result<Self> {
        let database = document.database().to_string();
        let index = document.index.clone();
        let name = document.name();

        let pool = connection::connect_with_retry(&settings.postgres.url(&database)).await?;
        let registry = ModelRegistry::reflect(&pool).await?;
        let tree = Tree::build(&document, &registry)?;
        analyze(&tree, &registry)?;

        let search = SearchClient::new(&settings.search)?;
        let checkpoint = Checkpoint::new(&settings.checkpoint_path, &name)?;

        Ok(Self {
            document,
            database,
            index,
            name,
            settings,
            pool,
            registry,
            tree,
            search,
            checkpoint: Mutex::new(checkpoint),
            counters: Counters::default(),
            pulled: AtomicBool::new(false),
        })
    }

    /// Startup validation: server settings, permissions, the replication
    /// slot (unless bootstrap is about to create it) and the checkpoint
    /// directory.
    pub async fn validate(&self, repl_slots: bool) -> Result<()> {
        let max_slots = connection::pg_setting(&self.pool, "max_replication_slots")
            .await?
            .and_then(|value| value.parse::<i64>().ok())
            .unwrap_or(0);
        anyhow::ensure!(
            max_slots >= 1,
            "ensure there is at least one replication slot defined by setting max_replication_slots = 1"
        );

        let wal_level = connection::pg_setting(&self.pool, "wal_level").await?;
        anyhow::ensure!(
            wal_level.as_deref().is_some_and(|level| level.eq_ignore_ascii_case("logical")),
            "enable logical decoding by setting wal_level = logical"
        );

        // RDS exposes a boolean instead of role flags
        match connection::pg_setting(&self.pool, "rds.logical_replication").await? {
            Some(rds) => anyhow::ensure!(
                !rds.eq_ignore_ascii_case("off"),
                "rds.logical_replication is not enabled"
            ),
            None => {
                let allowed = connection::has_permissions(
                    &self.pool,
                    &self.settings.postgres.user,
                    &["usesuper", "userepl"],
                )
                .await?;
                anyhow::ensure!(
                    allowed,
                    "user \"{}\" needs to be superuser or have the replication role to perform this action",
                    self.settings.postgres.user
                );
            }
        }

        if repl_slots {
            anyhow::ensure!(
                slot::slot_exists(&self.pool, &self.name).await?,
                "replication slot \"{}\" does not exist; run the \"bootstrap\" command first",
                self.name
            );
        }

        checkpoint::validate_directory(&self.settings.checkpoint_path)?;
        Ok(())
    }

    /// Create the manifest view, triggers, trigger function, replication
    /// slot and the target index.
    pub async fn bootstrap(&self) -> Result<()> {
        for schema in self.tree.schemas() {
            let tables = self.schema_tables(&schema);
            view::create_view(&self.pool, &schema, &self.manifest_rows(&schema)?).await?;
            trigger::create_function(&self.pool, &schema).await?;
            trigger::create_triggers(&self.pool, &schema, &tables).await?;
        }
        if !slot::slot_exists(&self.pool, &self.name).await? {
            slot::create_replication_slot(&self.pool, &self.name).await?;
        }
        self.search
            .create_index(
                &self.index,
                self.document.setting.as_ref(),
                self.document.mapping.as_ref(),
                self.document.routing.as_deref(),
                &self.tree,
            )
            .await?;
        info!(index = %self.index, slot = %self.name, "bootstrap complete");
        Ok(())
    }

    /// Drop everything bootstrap created, plus the checkpoint and queue.
    pub async fn teardown(&self) -> Result<()> {
        self.checkpoint.lock().await.remove()?;

        let mut queue = self.queue().await?;
        queue.delete().await?;

        for schema in self.tree.schemas() {
            let tables = self.schema_tables(&schema);
            trigger::drop_triggers(&self.pool, &schema, &tables).await?;
            trigger::drop_function(&self.pool, &schema).await?;
            view::drop_view(&self.pool, &schema).await?;
        }
        slot::drop_replication_slot(&self.pool, &self.name).await?;
        self.search.teardown(&self.index).await?;
        info!(index = %self.index, "teardown complete");
        Ok(())
    }

    pub async fn queue(&self) -> Result<crate::queue::EventQueue> {
        crate::queue::EventQueue::connect(
            &self.settings.redis.url,
            &self.name,
            self.settings.redis.read_chunk_size,
        )
        .await
    }

    /// In-tree tables (nodes and through-tables) living in `schema`.
    fn schema_tables(&self, schema: &str) -> BTreeSet<String> {
        let mut tables = BTreeSet::new();
        for node in self.tree.root.pre_order() {
            if node.schema == schema {
                tables.insert(node.table.clone());
                if let Some(through) = node.through_table() {
                    tables.insert(through.to_string());
                }
            }
        }
        tables
    }

    /// Rows for the `_view` manifest the trigger function reads.
    fn manifest_rows(&self, schema: &str) -> Result<Vec<view::ManifestRow>> {
        let mut rows = Vec::new();
        for table in self.schema_tables(schema) {
            let model = self.registry.model(schema, &table)?;
            let node = self.tree.node_for_table(&table);

            let mut foreign_keys: BTreeSet<String> =
                self.registry.foreign_key_columns(schema, &table).into_iter().collect();
            if let Some(declared) = node
                .and_then(|node| node.relationship.as_ref())
                .and_then(|relationship| relationship.foreign_key.as_ref())
            {
                // both sides are listed; the document does not say which
                // table owns the key
                foreign_keys.extend(declared.parent.iter().cloned());
                foreign_keys.extend(declared.child.iter().cloned());
            }

            let primary_keys = match node {
                Some(node) => node.primary_keys.clone(),
                None => model.primary_keys.clone(),
            };

            // watched columns gate UPDATE notifications; without them any
            // selected column counts
            let columns = match node {
                Some(node) if !node.watched_columns.is_empty() => node.watched_columns.clone(),
                Some(node) => {
                    let mut columns: BTreeSet<String> =
                        node.columns.iter().map(|column| column.name.clone()).collect();
                    columns.extend(primary_keys.iter().cloned());
                    columns.extend(foreign_keys.iter().cloned());
                    columns.into_iter().collect()
                }
                None => model.user_columns().into_iter().map(str::to_string).collect(),
            };

            rows.push(view::ManifestRow {
                table_name: table,
                primary_keys,
                foreign_keys: foreign_keys.into_iter().collect(),
                indices: vec![self.index.clone()],
                columns,
            });
        }
        Ok(rows)
    }

    /// Materialize documents for the given filters and scope, streaming
    /// them into the index in chunks. Returns the number of documents
    /// written.
    pub async fn sync_to_index(&self, filters: &Filters, scope: &RootScope) -> Result<usize> {
        let builder = QueryBuilder::new(&self.registry);
        let sql = builder.build(&self.tree, filters, scope)?;
        debug!(index = %self.index, "document query:\n{sql}");

        let mut written = 0usize;
        let mut actions: Vec<BulkAction> = Vec::new();
        let mut rows = sqlx::query(&sql).fetch(&self.pool);
        while let Some(row) = rows.try_next().await? {
            actions.push(self.row_to_action(&row)?);
            if actions.len() >= self.settings.query_chunk_size {
                written += self.search.bulk(self.index.as_str(), &actions).await?;
                actions.clear();
            }
        }
        if !actions.is_empty() {
            written += self.search.bulk(self.index.as_str(), &actions).await?;
        }
        Ok(written)
    }

    fn row_to_action(&self, row: &sqlx::postgres::PgRow) -> Result<BulkAction> {
        let keys: Value = row.try_get("_keys")?;
        let mut source: Value = row.try_get("_source")?;
        let pks: Value = row.try_get("_pks")?;

        transform::apply(&mut source, &self.tree.root);

        let private = meta::private_keys(&keys);
        if let Some(object) = source.as_object_mut() {
            object.insert(META.to_string(), serde_json::to_value(&private)?);
        }

        let pk_values = pks.as_array().cloned().unwrap_or_default();
        anyhow::ensure!(!pk_values.is_empty(), "no primary key found on root table");
        let id = doc_id(&pk_values);

        let routing = self.document.routing.as_deref().and_then(|column| {
            source.get(column).map(|value| match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
        });

        Ok(BulkAction::Index {
            id,
            routing,
            pipeline: self.document.pipeline.clone(),
            source,
        })
    }

    /// Translate one homogeneous batch and apply the outcome: direct
    /// deletes first, then the targeted resync.
    pub async fn on_batch(&self, events: &[ChangeEvent]) -> Result<()> {
        let translator = ChangeTranslator {
            tree: &self.tree,
            registry: &self.registry,
            index: &self.index,
            routing: self.document.routing.as_deref(),
        };
        let translation = translator.translate(&self.search, events).await?;

        if !translation.deletes.is_empty() {
            self.search.bulk(self.index.as_str(), &translation.deletes).await?;
        }
        if translation.filters.values().any(|entries| !entries.is_empty()) {
            self.sync_to_index(&translation.filters, &RootScope::default()).await?;
        }
        Ok(())
    }

    /// Replay the slot over `[txmin, txmax)`: peek, translate in
    /// homogeneous runs, then consume what was processed.
    pub async fn logical_slot_changes(
        &self,
        txmin: Option<i64>,
        txmax: Option<i64>,
    ) -> Result<()> {
        let rows = slot::peek_slot(&self.pool, &self.name, txmin, txmax, None).await?;
        if rows.is_empty() {
            return Ok(());
        }

        let mut events: Vec<ChangeEvent> = Vec::new();
        for row in &rows {
            if slot::is_transaction_marker(&row.data) {
                continue;
            }
            let mut event = slot::parse_slot_line(&row.data)
                .with_context(|| format!("error parsing slot row: {}", row.data))?;
            event.xmin = Some(row.xid);
            events.push(event);
        }

        for run in chunk_runs(&events) {
            self.on_batch(run).await?;
        }

        slot::consume_slot(&self.pool, &self.name, txmin, txmax, Some(rows.len() as i64)).await?;
        self.counters.xlog.fetch_add(rows.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// One-shot catch-up: forward-pass resync over `[checkpoint,
    /// txid_current)`, then a slot replay over the same range for anything
    /// the forward pass missed. The checkpoint advances only once the
    /// replay has landed, so a crash mid-pull re-peeks the same range on
    /// the next startup.
    pub async fn pull(&self) -> Result<()> {
        let txmin = self.checkpoint.lock().await.get();
        let txmax = slot::txid_current(&self.pool).await?;
        debug!(?txmin, txmax, "pull");

        let scope = RootScope { txmin, txmax: Some(txmax), ctid: None };
        let written = self.sync_to_index(&Filters::new(), &scope).await?;
        info!(written, index = %self.index, "forward pass complete");

        self.logical_slot_changes(txmin, Some(txmax)).await?;
        self.checkpoint.lock().await.advance(txmax)?;
        self.pulled.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Consumer-side checkpointing: never past an unacked event.
    pub async fn advance_checkpoint(&self, events: &[ChangeEvent]) -> Result<()> {
        let txids: Vec<i64> = events.iter().filter_map(|event| event.xmin).collect();
        // TRUNCATE payloads carry no xmin; skip the checkpoint move
        if txids.is_empty() {
            return Ok(());
        }
        let min_txid = txids.iter().copied().min().unwrap_or(i64::MAX);
        let current = slot::txid_current(&self.pool).await?;
        self.checkpoint
            .lock()
            .await
            .advance(min_txid.min(current) - 1)?;
        Ok(())
    }
}

/// Eagerly resolve every join in the tree so a missing foreign-key path
/// fails at startup, not mid-resync.
fn analyze(tree: &Tree, registry: &ModelRegistry) -> Result<()> {
    for parent in tree.root.breadth_first() {
        for child in &parent.children {
            let parent_model = registry.model(&parent.schema, &parent.table)?;
            let child_model = registry.model(&child.schema, &child.table)?;
            let declared = child
                .relationship
                .as_ref()
                .and_then(|relationship| relationship.foreign_key.as_ref());
            match child.through_table() {
                Some(through) => {
                    let through_model = registry.model(&child.schema, through)?;
                    join_keys(registry, parent_model, through_model, None)?;
                    join_keys(registry, through_model, child_model, None)?;
                }
                None => {
                    join_keys(registry, parent_model, child_model, declared)?;
                }
            }
        }
    }
    Ok(())
}

/// Split a stream of events into consecutive runs sharing `(tg_op, table)`,
/// preserving source order.
pub fn chunk_runs(events: &[ChangeEvent]) -> Vec<&[ChangeEvent]> {
    let mut runs = Vec::new();
    let mut start = 0usize;
    for i in 1..=events.len() {
        let boundary = i == events.len()
            || events[i].tg_op != events[start].tg_op
            || events[i].table != events[start].table;
        if boundary && i <= events.len() {
            if i > start {
                runs.push(&events[start..i]);
            }
            start = i;
        }
    }
    runs
}

/// When a whole batch is INSERTs, events may be grouped by table and each
/// group processed independently; all other mixes keep source order.
pub fn insert_fast_path(events: &[ChangeEvent]) -> Option<Vec<Vec<ChangeEvent>>> {
    if events.is_empty() || !events.iter().all(|event| event.tg_op == TgOp::Insert) {
        return None;
    }
    let mut groups: Vec<(String, Vec<ChangeEvent>)> = Vec::new();
    for event in events {
        match groups.iter_mut().find(|(table, _)| *table == event.table) {
            Some((_, group)) => group.push(event.clone()),
            None => groups.push((event.table.clone(), vec![event.clone()])),
        }
    }
    Some(groups.into_iter().map(|(_, group)| group).collect())
}
