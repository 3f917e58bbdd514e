//! Shared fixtures: an in-memory model registry mirroring the book store
//! the end-to-end suites run against, plus tree builders for the common
//! document shapes.

use pgsink::db::model::{ColumnModel, ForeignKeyEdge, ModelRegistry, TableModel};
use pgsink::schema::SchemaDocument;
use pgsink::tree::Tree;
use serde_json::{Value, json};

pub fn table(name: &str, columns: &[&str], pks: &[&str]) -> TableModel {
    TableModel {
        schema: "public".into(),
        name: name.into(),
        columns: columns
            .iter()
            .map(|column| ColumnModel {
                name: (*column).into(),
                data_type: "text".into(),
            })
            .collect(),
        primary_keys: pks.iter().map(|pk| (*pk).into()).collect(),
    }
}

pub fn edge(child: &str, child_columns: &[&str], parent: &str, parent_columns: &[&str]) -> ForeignKeyEdge {
    ForeignKeyEdge {
        child_schema: "public".into(),
        child_table: child.into(),
        child_columns: child_columns.iter().map(|c| (*c).into()).collect(),
        parent_schema: "public".into(),
        parent_table: parent.into(),
        parent_columns: parent_columns.iter().map(|c| (*c).into()).collect(),
    }
}

/// book(isbn PK, title, description, publisher_id FK) with publisher,
/// author and the book_author join table.
pub fn bookstore_registry() -> ModelRegistry {
    ModelRegistry::from_models(
        vec![
            table("book", &["isbn", "title", "description", "publisher_id"], &["isbn"]),
            table("publisher", &["id", "name"], &["id"]),
            table("author", &["id", "name"], &["id"]),
            table("book_author", &["id", "book_isbn", "author_id"], &["id"]),
        ],
        vec![
            edge("book", &["publisher_id"], "publisher", &["id"]),
            edge("book_author", &["book_isbn"], "book", &["isbn"]),
            edge("book_author", &["author_id"], "author", &["id"]),
        ],
    )
}

pub fn document(nodes: Value) -> SchemaDocument {
    serde_json::from_value(json!({
        "database": "testdb",
        "index": "testdb",
        "nodes": nodes,
    }))
    .unwrap()
}

/// The minimal tree the concrete scenarios use: book with an object
/// one_to_one publisher child.
pub fn book_publisher_tree(registry: &ModelRegistry) -> Tree {
    Tree::build(
        &document(json!({
            "table": "book",
            "columns": ["isbn", "title"],
            "children": [{
                "table": "publisher",
                "columns": ["id", "name"],
                "relationship": {"type": "one_to_one", "variant": "object"},
            }],
        })),
        registry,
    )
    .unwrap()
}

/// book -> (book_author) -> author, object/one_to_many.
pub fn book_authors_tree(registry: &ModelRegistry) -> Tree {
    Tree::build(
        &document(json!({
            "table": "book",
            "columns": ["isbn", "title"],
            "children": [{
                "table": "author",
                "label": "authors",
                "columns": ["id", "name"],
                "relationship": {
                    "type": "one_to_many",
                    "variant": "object",
                    "through_tables": ["book_author"],
                },
            }],
        })),
        registry,
    )
    .unwrap()
}
