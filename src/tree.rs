//! The schema tree: a validated, immutable graph of nodes derived from the
//! user document. Built once per document and shared read-only by the query
//! builder, the change translator and the sink mapping.

use std::collections::BTreeSet;

use crate::constants::{BUILTIN_SCHEMAS, DEFAULT_SCHEMA};
use crate::db::model::{ModelRegistry, SYNTHETIC_COLUMNS};
use crate::errors::SchemaError;
use crate::schema::{ForeignKeyDef, NodeDef, SchemaDocument, TransformDef};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationshipType {
    OneToOne,
    OneToMany,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationshipVariant {
    Scalar,
    Object,
}

#[derive(Debug, Clone)]
pub struct Relationship {
    pub kind: RelationshipType,
    pub variant: RelationshipVariant,
    pub through_table: Option<String>,
    /// User-declared join columns when no catalog edge exists (or to
    /// restrict the discovered one).
    pub foreign_key: Option<ForeignKeyDef>,
    pub join_depth: Option<usize>,
}

/// A column reference: either a bare column or a JSON-path traversal into a
/// JSON column (`meta->a->b`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnRef {
    pub name: String,
    pub path: Vec<String>,
}

impl ColumnRef {
    pub fn parse(raw: &str) -> Self {
        let mut segments = raw.split("->").map(|s| s.trim_start_matches('>').trim());
        let name = segments.next().unwrap_or(raw).to_string();
        let path = segments.map(str::to_string).collect();
        Self { name, path }
    }

    /// Key under which the column appears in the emitted document.
    pub fn alias(&self) -> String {
        if self.path.is_empty() {
            self.name.clone()
        } else {
            let mut alias = self.name.clone();
            for segment in &self.path {
                alias.push('_');
                alias.push_str(segment);
            }
            alias
        }
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub table: String,
    pub schema: String,
    pub label: String,
    pub columns: Vec<ColumnRef>,
    pub primary_keys: Vec<String>,
    /// Absent on the root.
    pub relationship: Option<Relationship>,
    pub transform: TransformDef,
    pub watched_columns: Vec<String>,
    pub children: Vec<Node>,
}

impl Node {
    pub fn through_table(&self) -> Option<&str> {
        self.relationship
            .as_ref()
            .and_then(|relationship| relationship.through_table.as_deref())
    }

    pub fn pre_order(&self) -> Vec<&Node> {
        let mut nodes = vec![self];
        for child in &self.children {
            nodes.extend(child.pre_order());
        }
        nodes
    }

    pub fn post_order(&self) -> Vec<&Node> {
        let mut nodes = Vec::new();
        for child in &self.children {
            nodes.extend(child.post_order());
        }
        nodes.push(self);
        nodes
    }

    pub fn breadth_first(&self) -> Vec<&Node> {
        let mut nodes = Vec::new();
        let mut queue = std::collections::VecDeque::from([self]);
        while let Some(node) = queue.pop_front() {
            nodes.push(node);
            queue.extend(node.children.iter());
        }
        nodes
    }
}

#[derive(Debug, Clone)]
pub struct Tree {
    pub root: Node,
    /// Tables backing a node anywhere in the tree.
    pub tables: BTreeSet<String>,
    /// Anonymous through-tables introduced by relationships.
    pub through_tables: BTreeSet<String>,
}

impl Tree {
    pub fn build(document: &SchemaDocument, registry: &ModelRegistry) -> Result<Self, SchemaError> {
        let def = document.node_defs()?;
        let mut tables = BTreeSet::new();
        let mut through_tables = BTreeSet::new();
        let root = build_node(
            &def,
            registry,
            true,
            &mut tables,
            &mut through_tables,
            &mut Vec::new(),
        )?;
        Ok(Self { root, tables, through_tables })
    }

    pub fn node_for_table(&self, table: &str) -> Option<&Node> {
        self.root.breadth_first().into_iter().find(|node| node.table == table)
    }

    /// The parent node of the node backed by `table`.
    pub fn parent_of(&self, table: &str) -> Option<&Node> {
        self.root
            .breadth_first()
            .into_iter()
            .find(|node| node.children.iter().any(|child| child.table == table))
    }

    /// For a through-table, the `(parent, child)` nodes it connects.
    pub fn through_endpoints(&self, through_table: &str) -> Option<(&Node, &Node)> {
        for parent in self.root.breadth_first() {
            for child in &parent.children {
                if child.through_table() == Some(through_table) {
                    return Some((parent, child));
                }
            }
        }
        None
    }

    /// Tables anywhere in the tree that declare a watched-column list; the
    /// ingestion path drops irrelevant UPDATEs for these early.
    pub fn watched_columns_tables(&self) -> BTreeSet<String> {
        self.root
            .pre_order()
            .into_iter()
            .filter(|node| !node.watched_columns.is_empty())
            .map(|node| node.table.clone())
            .collect()
    }

    /// Every source schema the tree touches.
    pub fn schemas(&self) -> BTreeSet<String> {
        self.root
            .pre_order()
            .into_iter()
            .map(|node| node.schema.clone())
            .collect()
    }

    pub fn contains(&self, table: &str) -> bool {
        self.tables.contains(table) || self.through_tables.contains(table)
    }
}

fn build_node(
    def: &NodeDef,
    registry: &ModelRegistry,
    is_root: bool,
    tables: &mut BTreeSet<String>,
    through_tables: &mut BTreeSet<String>,
    ancestry: &mut Vec<String>,
) -> Result<Node, SchemaError> {
    let table = def
        .table
        .clone()
        .ok_or_else(|| SchemaError::TableNotInNode(format!("{def:?}")))?;
    let schema = def.schema.clone().unwrap_or_else(|| DEFAULT_SCHEMA.to_string());

    if BUILTIN_SCHEMAS.contains(&schema.as_str()) || !registry.has_schema(&schema) {
        return Err(SchemaError::InvalidSchema(schema));
    }

    let model = registry.model(&schema, &table)?;

    let primary_keys = if !model.primary_keys.is_empty() {
        model.primary_keys.clone()
    } else {
        def.primary_key.clone()
    };
    if primary_keys.is_empty() {
        return Err(SchemaError::PrimaryKeyNotFound(model.qualified_name()));
    }

    let columns = if def.columns.is_empty() {
        model
            .user_columns()
            .into_iter()
            .map(ColumnRef::parse)
            .collect()
    } else {
        def.columns.iter().map(|raw| ColumnRef::parse(raw)).collect::<Vec<_>>()
    };
    for column in &columns {
        if !model.has_column(&column.name) || SYNTHETIC_COLUMNS.contains(&column.name.as_str()) {
            return Err(SchemaError::ColumnNotFound {
                column: column.name.clone(),
                table: table.clone(),
            });
        }
    }
    for watched in &def.watched_columns {
        if !model.has_column(watched) {
            return Err(SchemaError::ColumnNotFound {
                column: watched.clone(),
                table: table.clone(),
            });
        }
    }
    if let Some(concat) = &def.transform.concat {
        for column in &concat.columns {
            if !model.has_column(column) {
                return Err(SchemaError::ColumnNotFound {
                    column: column.clone(),
                    table: table.clone(),
                });
            }
        }
    }

    let relationship = match &def.relationship {
        Some(relationship_def) => {
            let kind = match relationship_def.kind.as_deref().map(str::to_lowercase).as_deref() {
                Some("one_to_one") => Some(RelationshipType::OneToOne),
                Some("one_to_many") => Some(RelationshipType::OneToMany),
                Some(other) => return Err(SchemaError::RelationshipType(other.to_string())),
                None => None,
            };
            let variant = match relationship_def
                .variant
                .as_deref()
                .map(str::to_lowercase)
                .as_deref()
            {
                Some("scalar") => Some(RelationshipVariant::Scalar),
                Some("object") => Some(RelationshipVariant::Object),
                Some(other) => return Err(SchemaError::RelationshipVariant(other.to_string())),
                None => None,
            };

            if relationship_def.through_tables.len() > 1 {
                return Err(SchemaError::MultipleThroughTables(
                    relationship_def.through_tables.clone(),
                ));
            }
            let through_table = relationship_def.through_tables.first().cloned();
            if let Some(through) = &through_table {
                let through_model = registry.model(&schema, through)?;
                if through_model.primary_keys.is_empty() {
                    return Err(SchemaError::ThroughTableWithoutPrimaryKey(through.clone()));
                }
                through_tables.insert(through.clone());
            }

            match (kind, variant) {
                (Some(kind), Some(variant)) => Some(Relationship {
                    kind,
                    variant,
                    through_table,
                    foreign_key: relationship_def.foreign_key.clone(),
                    join_depth: relationship_def.join_depth,
                }),
                _ => None,
            }
        }
        None => None,
    };

    if !is_root && relationship.is_none() {
        return Err(SchemaError::Relationship(format!("{schema}.{table}")));
    }

    // a cyclic document can only nest a table under itself join_depth deep
    let self_depth = ancestry.iter().filter(|ancestor| **ancestor == table).count();
    if let Some(join_depth) = relationship.as_ref().and_then(|r| r.join_depth) {
        if self_depth > join_depth {
            return Err(SchemaError::JoinDepthExceeded { table, join_depth });
        }
    }

    tables.insert(table.clone());

    let label = def.label.clone().unwrap_or_else(|| table.clone());

    ancestry.push(table.clone());
    let mut children = Vec::new();
    let mut labels = BTreeSet::new();
    for child_def in &def.children {
        let child = build_node(child_def, registry, false, tables, through_tables, ancestry)?;
        if !labels.insert(child.label.clone()) {
            ancestry.pop();
            return Err(SchemaError::DuplicateLabel {
                label: child.label,
                parent: table.clone(),
            });
        }
        children.push(child);
    }
    ancestry.pop();

    Ok(Node {
        table,
        schema,
        label,
        columns,
        primary_keys,
        relationship: if is_root { None } else { relationship },
        transform: def.transform.clone(),
        watched_columns: def.watched_columns.clone(),
        children,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::model::{ColumnModel, ForeignKeyEdge, TableModel};
    use serde_json::json;

    fn table(name: &str, columns: &[&str], pks: &[&str]) -> TableModel {
        TableModel {
            schema: "public".into(),
            name: name.into(),
            columns: columns
                .iter()
                .map(|c| ColumnModel { name: (*c).into(), data_type: "text".into() })
                .collect(),
            primary_keys: pks.iter().map(|c| (*c).into()).collect(),
        }
    }

    fn registry() -> ModelRegistry {
        ModelRegistry::from_models(
            vec![
                table("book", &["isbn", "title", "description", "publisher_id"], &["isbn"]),
                table("publisher", &["id", "name"], &["id"]),
                table("author", &["id", "name"], &["id"]),
                table("book_author", &["id", "book_isbn", "author_id"], &["id"]),
            ],
            vec![
                ForeignKeyEdge {
                    child_schema: "public".into(),
                    child_table: "book".into(),
                    child_columns: vec!["publisher_id".into()],
                    parent_schema: "public".into(),
                    parent_table: "publisher".into(),
                    parent_columns: vec!["id".into()],
                },
                ForeignKeyEdge {
                    child_schema: "public".into(),
                    child_table: "book_author".into(),
                    child_columns: vec!["book_isbn".into()],
                    parent_schema: "public".into(),
                    parent_table: "book".into(),
                    parent_columns: vec!["isbn".into()],
                },
                ForeignKeyEdge {
                    child_schema: "public".into(),
                    child_table: "book_author".into(),
                    child_columns: vec!["author_id".into()],
                    parent_schema: "public".into(),
                    parent_table: "author".into(),
                    parent_columns: vec!["id".into()],
                },
            ],
        )
    }

    fn document(nodes: serde_json::Value) -> SchemaDocument {
        serde_json::from_value(json!({"database": "testdb", "index": "testdb", "nodes": nodes}))
            .unwrap()
    }

    #[test]
    fn test_build_minimal_tree() {
        let doc = document(json!({
            "table": "book",
            "columns": ["isbn", "title"],
            "children": [{
                "table": "publisher",
                "columns": ["id", "name"],
                "relationship": {"type": "one_to_one", "variant": "object"},
            }],
        }));
        let tree = Tree::build(&doc, &registry()).unwrap();
        assert_eq!(tree.root.table, "book");
        assert_eq!(tree.root.label, "book");
        assert!(tree.root.relationship.is_none());
        assert_eq!(tree.root.children.len(), 1);
        let publisher = &tree.root.children[0];
        assert_eq!(
            publisher.relationship.as_ref().unwrap().kind,
            RelationshipType::OneToOne
        );
        assert!(tree.contains("publisher"));
    }

    #[test]
    fn test_columns_default_to_all_user_columns() {
        let doc = document(json!({"table": "publisher"}));
        let tree = Tree::build(&doc, &registry()).unwrap();
        let aliases: Vec<String> = tree.root.columns.iter().map(ColumnRef::alias).collect();
        assert_eq!(aliases, vec!["id", "name"]);
    }

    #[test]
    fn test_missing_relationship_on_child() {
        let doc = document(json!({
            "table": "book",
            "children": [{"table": "publisher"}],
        }));
        let err = Tree::build(&doc, &registry()).unwrap_err();
        assert!(matches!(err, SchemaError::Relationship(_)), "{err}");
    }

    #[test]
    fn test_unknown_column() {
        let doc = document(json!({"table": "book", "columns": ["isbn", "publisher"]}));
        let err = Tree::build(&doc, &registry()).unwrap_err();
        assert!(matches!(err, SchemaError::ColumnNotFound { .. }), "{err}");
    }

    #[test]
    fn test_unknown_schema() {
        let doc = document(json!({"table": "book", "schema": "missing"}));
        let err = Tree::build(&doc, &registry()).unwrap_err();
        assert!(matches!(err, SchemaError::InvalidSchema(_)), "{err}");
    }

    #[test]
    fn test_multiple_through_tables() {
        let doc = document(json!({
            "table": "book",
            "children": [{
                "table": "author",
                "relationship": {
                    "type": "one_to_many",
                    "variant": "object",
                    "through_tables": ["book_author", "other"],
                },
            }],
        }));
        let err = Tree::build(&doc, &registry()).unwrap_err();
        assert!(matches!(err, SchemaError::MultipleThroughTables(_)), "{err}");
    }

    #[test]
    fn test_through_table_is_tracked() {
        let doc = document(json!({
            "table": "book",
            "children": [{
                "table": "author",
                "relationship": {
                    "type": "one_to_many",
                    "variant": "object",
                    "through_tables": ["book_author"],
                },
            }],
        }));
        let tree = Tree::build(&doc, &registry()).unwrap();
        assert!(tree.through_tables.contains("book_author"));
        let (parent, child) = tree.through_endpoints("book_author").unwrap();
        assert_eq!(parent.table, "book");
        assert_eq!(child.table, "author");
    }

    #[test]
    fn test_duplicate_sibling_labels() {
        let doc = document(json!({
            "table": "book",
            "children": [
                {
                    "table": "publisher",
                    "label": "meta",
                    "relationship": {"type": "one_to_one", "variant": "object"},
                },
                {
                    "table": "author",
                    "label": "meta",
                    "relationship": {
                        "type": "one_to_many",
                        "variant": "object",
                        "through_tables": ["book_author"],
                    },
                },
            ],
        }));
        let err = Tree::build(&doc, &registry()).unwrap_err();
        assert!(matches!(err, SchemaError::DuplicateLabel { .. }), "{err}");
    }

    #[test]
    fn test_watched_columns_tables() {
        let doc = document(json!({
            "table": "book",
            "watched_columns": ["title"],
            "children": [{
                "table": "publisher",
                "relationship": {"type": "one_to_one", "variant": "object"},
            }],
        }));
        let tree = Tree::build(&doc, &registry()).unwrap();
        assert_eq!(
            tree.watched_columns_tables(),
            BTreeSet::from(["book".to_string()])
        );
    }

    #[test]
    fn test_traversal_orders() {
        let doc = document(json!({
            "table": "book",
            "children": [
                {
                    "table": "publisher",
                    "relationship": {"type": "one_to_one", "variant": "object"},
                },
                {
                    "table": "author",
                    "relationship": {
                        "type": "one_to_many",
                        "variant": "object",
                        "through_tables": ["book_author"],
                    },
                },
            ],
        }));
        let tree = Tree::build(&doc, &registry()).unwrap();
        let pre: Vec<&str> = tree.root.pre_order().iter().map(|n| n.table.as_str()).collect();
        let post: Vec<&str> = tree.root.post_order().iter().map(|n| n.table.as_str()).collect();
        let bfs: Vec<&str> = tree.root.breadth_first().iter().map(|n| n.table.as_str()).collect();
        assert_eq!(pre, vec!["book", "publisher", "author"]);
        assert_eq!(post, vec!["publisher", "author", "book"]);
        assert_eq!(bfs, vec!["book", "publisher", "author"]);
    }

    #[test]
    fn test_column_ref_json_path() {
        let column = ColumnRef::parse("meta->tags->primary");
        assert_eq!(column.name, "meta");
        assert_eq!(column.path, vec!["tags", "primary"]);
        assert_eq!(column.alias(), "meta_tags_primary");
    }
}
