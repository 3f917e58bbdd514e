//! Compiled-statement assertions: the single recursive SQL statement per
//! root carries the document body, the `_keys` manifest and the root
//! primary keys, and targeted resyncs restrict it through INNER joins.

use pgsink::query::{FilterEntry, Filters, QueryBuilder, RootScope};
use serde_json::json;
use std::collections::BTreeMap;

use crate::helpers::{book_authors_tree, book_publisher_tree, bookstore_registry};

#[test]
fn statement_emits_keys_source_and_pks() {
    let registry = bookstore_registry();
    let tree = book_publisher_tree(&registry);
    let sql = QueryBuilder::new(&registry)
        .build(&tree, &Filters::new(), &RootScope::default())
        .unwrap();

    assert!(sql.starts_with("SELECT "), "{sql}");
    assert!(sql.contains("AS \"_keys\""), "{sql}");
    assert!(sql.contains("AS \"_source\""), "{sql}");
    assert!(sql.contains("AS \"_pks\""), "{sql}");
    assert!(sql.contains("FROM \"public\".\"book\""), "{sql}");
    // unfiltered trees keep every root row, child or no child
    assert!(sql.contains("LEFT OUTER JOIN"), "{sql}");
    assert!(!sql.contains("INNER JOIN"), "{sql}");
}

#[test]
fn targeted_resync_restricts_to_affected_roots() {
    let registry = bookstore_registry();
    let tree = book_publisher_tree(&registry);

    // root filters OR together; entries AND within
    let filters = Filters::from([(
        "book".to_string(),
        vec![
            FilterEntry::from([("isbn".to_string(), json!("abc"))]),
            FilterEntry::from([("isbn".to_string(), json!("def"))]),
        ],
    )]);
    let sql = QueryBuilder::new(&registry)
        .build(&tree, &filters, &RootScope::default())
        .unwrap();
    assert!(
        sql.contains("((book_0.\"isbn\" = 'abc') OR (book_0.\"isbn\" = 'def'))"),
        "{sql}"
    );

    // a filtered child flips its join INNER so unrelated roots drop out
    let filters = Filters::from([(
        "publisher".to_string(),
        vec![FilterEntry::from([("id".to_string(), json!(1))])],
    )]);
    let sql = QueryBuilder::new(&registry)
        .build(&tree, &filters, &RootScope::default())
        .unwrap();
    assert!(sql.contains("INNER JOIN"), "{sql}");
}

#[test]
fn forward_pass_scopes_by_transaction_id() {
    let registry = bookstore_registry();
    let tree = book_publisher_tree(&registry);
    let scope = RootScope { txmin: Some(7), txmax: Some(11), ctid: None };
    let sql = QueryBuilder::new(&registry)
        .build(&tree, &Filters::new(), &scope)
        .unwrap();
    assert!(sql.contains("\"xmin\" AS TEXT) AS BIGINT) >= 7"), "{sql}");
    assert!(sql.contains("\"xmin\" AS TEXT) AS BIGINT) < 11"), "{sql}");
}

#[test]
fn tuple_scoped_resync_uses_ctid() {
    let registry = bookstore_registry();
    let tree = book_publisher_tree(&registry);
    let scope = RootScope {
        txmin: None,
        txmax: None,
        ctid: Some(BTreeMap::from([(3, vec![1, 4]), (5, vec![2])])),
    };
    let sql = QueryBuilder::new(&registry)
        .build(&tree, &Filters::new(), &scope)
        .unwrap();
    assert!(
        sql.contains("\"ctid\" = ANY (ARRAY['(3,1)', '(3,4)', '(5,2)']::TID[])"),
        "{sql}"
    );
}

#[test]
fn through_statement_aggregates_and_groups() {
    let registry = bookstore_registry();
    let tree = book_authors_tree(&registry);
    let sql = QueryBuilder::new(&registry)
        .build(&tree, &Filters::new(), &RootScope::default())
        .unwrap();

    // child rows aggregate across the join table, grouped by the column
    // that points back at the root
    assert!(sql.contains("FROM \"public\".\"book_author\""), "{sql}");
    assert!(sql.contains("JSON_AGG("), "{sql}");
    assert!(sql.contains("GROUP BY"), "{sql}");
    assert!(sql.contains("\"book_isbn\""), "{sql}");
    // both the author and the join table feed _meta
    assert!(sql.contains("'book_author'"), "{sql}");
    assert!(sql.contains("'author'"), "{sql}");
}

#[test]
fn filters_on_non_root_tables_reach_their_subquery() {
    let registry = bookstore_registry();
    let tree = book_authors_tree(&registry);
    let filters = Filters::from([(
        "book_author".to_string(),
        vec![FilterEntry::from([("book_isbn".to_string(), json!("abc"))])],
    )]);
    let sql = QueryBuilder::new(&registry).build(&tree, &filters, &RootScope::default()).unwrap();
    assert!(sql.contains("\"book_isbn\" = 'abc'"), "{sql}");
    assert!(sql.contains("INNER JOIN"), "{sql}");
}
