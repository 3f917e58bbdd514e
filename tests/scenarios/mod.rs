//! End-to-end scenarios at the translation layer: slot lines or trigger
//! payloads in, sink actions and resync filters out.

use anyhow::Result;
use pgsink::db::slot::parse_slot_line;
use pgsink::meta::private_keys;
use pgsink::query::FilterEntry;
use pgsink::search::BulkAction;
use pgsink::sync::chunk_runs;
use pgsink::sync::event::{ChangeEvent, TgOp};
use pgsink::sync::translator::{ChangeTranslator, MetaLookup, doc_id};
use serde_json::{Value, json};
use std::collections::BTreeMap;

use crate::helpers::{book_authors_tree, book_publisher_tree, bookstore_registry};

#[derive(Default)]
struct FakeIndex {
    /// Canned `_meta` hits per table.
    meta_ids: BTreeMap<String, Vec<String>>,
    all_ids: Vec<String>,
}

impl MetaLookup for FakeIndex {
    async fn search_meta(
        &self,
        _index: &str,
        table: &str,
        _fields: &BTreeMap<String, Vec<Value>>,
    ) -> Result<Vec<String>> {
        Ok(self.meta_ids.get(table).cloned().unwrap_or_default())
    }

    async fn meta_table_ids(&self, _index: &str, table: &str) -> Result<Vec<String>> {
        Ok(self.meta_ids.get(table).cloned().unwrap_or_default())
    }

    async fn all_doc_ids(&self, _index: &str) -> Result<Vec<String>> {
        Ok(self.all_ids.clone())
    }
}

fn payload(tg_op: TgOp, table: &str, old: Value, new: Value) -> ChangeEvent {
    ChangeEvent {
        tg_op,
        table: table.into(),
        schema: Some("public".into()),
        old: old.as_object().cloned().unwrap_or_default(),
        new: new.as_object().cloned().unwrap_or_default(),
        xmin: Some(1234),
        indices: vec!["testdb".into()],
    }
}

/// S1: the initial sync materializes the document with its `_meta` reverse
/// index derived from the `_keys` column the query emits.
#[test]
fn initial_sync_document_shape() {
    // _keys as the compiled statement produces it for book -> publisher
    let keys = json!([
        {"publisher": {"id": [1]}}
    ]);
    let meta = private_keys(&keys);
    assert_eq!(serde_json::to_value(&meta).unwrap(), json!({"publisher": {"id": [1]}}));

    let id = doc_id(&[json!("abc")]);
    assert_eq!(id, "abc");
}

/// S2: an UPDATE of a child's non-key column resyncs exactly the documents
/// whose `_meta` references the changed row.
#[tokio::test]
async fn update_child_non_primary_key() {
    let registry = bookstore_registry();
    let tree = book_publisher_tree(&registry);
    let translator = ChangeTranslator {
        tree: &tree,
        registry: &registry,
        index: "testdb",
        routing: None,
    };
    let index = FakeIndex {
        meta_ids: BTreeMap::from([("publisher".to_string(), vec!["abc".to_string()])]),
        ..Default::default()
    };

    let events = vec![payload(
        TgOp::Update,
        "publisher",
        json!({"id": 1}),
        json!({"id": 1}),
    )];
    let translation = translator.translate(&index, &events).await.unwrap();

    assert!(translation.deletes.is_empty());
    let root_filters = &translation.filters["book"];
    assert!(
        root_filters.contains(&FilterEntry::from([("isbn".to_string(), json!("abc"))])),
        "{root_filters:?}"
    );
}

/// S3: an UPDATE that renames the root primary key deletes the old `_id`
/// and schedules the new one, so the index never holds both.
#[tokio::test]
async fn update_root_primary_key() {
    let registry = bookstore_registry();
    let tree = book_publisher_tree(&registry);
    let translator = ChangeTranslator {
        tree: &tree,
        registry: &registry,
        index: "testdb",
        routing: None,
    };

    let events = vec![payload(
        TgOp::Update,
        "book",
        json!({"isbn": "abc"}),
        json!({"isbn": "xyz", "publisher_id": 1}),
    )];
    let translation = translator.translate(&FakeIndex::default(), &events).await.unwrap();

    assert_eq!(
        translation.deletes,
        vec![BulkAction::Delete { id: "abc".into(), routing: None }]
    );
    assert_eq!(
        translation.filters["book"],
        vec![FilterEntry::from([("isbn".to_string(), json!("xyz"))])]
    );
}

/// S4: deleting a child row referenced by a root resyncs that root; the
/// rebuilt document then carries a null child and no `_meta` entry for it.
#[tokio::test]
async fn delete_child_row() {
    let registry = bookstore_registry();
    let tree = book_publisher_tree(&registry);
    let translator = ChangeTranslator {
        tree: &tree,
        registry: &registry,
        index: "testdb",
        routing: None,
    };
    let index = FakeIndex {
        meta_ids: BTreeMap::from([("publisher".to_string(), vec!["abc".to_string()])]),
        ..Default::default()
    };

    let events = vec![payload(TgOp::Delete, "publisher", json!({"id": 1}), json!({}))];
    let translation = translator.translate(&index, &events).await.unwrap();

    assert!(translation.deletes.is_empty());
    assert_eq!(
        translation.filters["book"],
        vec![FilterEntry::from([("isbn".to_string(), json!("abc"))])]
    );

    // the resynced document's _keys no longer mentions the publisher
    let keys = json!([null]);
    assert!(private_keys(&keys).is_empty());
}

/// S5: inserting a through-table row resyncs the root it links, and the
/// through-table contributes its own `_meta` entry.
#[tokio::test]
async fn through_table_insert() {
    let registry = bookstore_registry();
    let tree = book_authors_tree(&registry);
    let translator = ChangeTranslator {
        tree: &tree,
        registry: &registry,
        index: "testdb",
        routing: None,
    };

    let events = vec![payload(
        TgOp::Insert,
        "book_author",
        json!({}),
        json!({"id": 9, "book_isbn": "abc", "author_id": 1}),
    )];
    let translation = translator.translate(&FakeIndex::default(), &events).await.unwrap();

    assert_eq!(
        translation.filters["book"],
        vec![FilterEntry::from([("isbn".to_string(), json!("abc"))])]
    );

    // _keys shape after the resync: author and book_author both present
    let keys = json!([
        [{"author": [{"id": [1]}], "book_author": [{"id": [9]}]}]
    ]);
    let meta = private_keys(&keys);
    assert_eq!(meta["author"]["id"], vec![json!(1)]);
    assert_eq!(meta["book_author"]["id"], vec![json!(9)]);
}

/// S6: the watched-column set is what the manifest exposes to the trigger;
/// an UPDATE touching only unlisted columns never reaches the channel.
#[test]
fn watched_columns_manifest() {
    let registry = bookstore_registry();
    let tree = pgsink::tree::Tree::build(
        &crate::helpers::document(json!({
            "table": "book",
            "columns": ["isbn", "title"],
            "watched_columns": ["title"],
            "children": [{
                "table": "publisher",
                "columns": ["id", "name"],
                "relationship": {"type": "one_to_one", "variant": "object"},
            }],
        })),
        &registry,
    )
    .unwrap();

    assert!(tree.watched_columns_tables().contains("book"));

    let rows = vec![pgsink::db::view::ManifestRow {
        table_name: "book".into(),
        primary_keys: vec!["isbn".into()],
        foreign_keys: vec!["publisher_id".into()],
        indices: vec!["testdb".into()],
        columns: tree.node_for_table("book").unwrap().watched_columns.clone(),
    }];
    let sql = pgsink::db::view::create_view_sql("public", &rows);
    assert!(sql.contains("ARRAY['title']::TEXT[]"), "{sql}");
    assert!(!sql.contains("'description'"), "{sql}");
}

/// Slot replay feeds the translator through order-preserving homogeneous
/// runs: parse, batch, translate.
#[tokio::test]
async fn slot_replay_batches_in_order() {
    let registry = bookstore_registry();
    let tree = book_publisher_tree(&registry);
    let translator = ChangeTranslator {
        tree: &tree,
        registry: &registry,
        index: "testdb",
        routing: None,
    };

    let lines = [
        "table public.book: INSERT: isbn[character varying]:'a' publisher_id[integer]:1",
        "table public.book: INSERT: isbn[character varying]:'b' publisher_id[integer]:1",
        "table public.publisher: INSERT: id[integer]:2 name[text]:'Rabbit'",
        "table public.book: DELETE: isbn[character varying]:'a'",
    ];
    let events: Vec<ChangeEvent> = lines.iter().map(|line| parse_slot_line(line).unwrap()).collect();

    let runs = chunk_runs(&events);
    assert_eq!(runs.len(), 3);

    // first run: two book inserts become two primary-key filters
    let translation = translator.translate(&FakeIndex::default(), runs[0]).await.unwrap();
    assert_eq!(
        translation.filters["book"],
        vec![
            FilterEntry::from([("isbn".to_string(), json!("a"))]),
            FilterEntry::from([("isbn".to_string(), json!("b"))]),
        ]
    );

    // last run: the root delete maps straight to a sink delete
    let translation = translator.translate(&FakeIndex::default(), runs[2]).await.unwrap();
    assert_eq!(
        translation.deletes,
        vec![BulkAction::Delete { id: "a".into(), routing: None }]
    );
}
