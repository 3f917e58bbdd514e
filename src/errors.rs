//! Typed error taxonomy. Fatal configuration/validation errors are raised
//! during bootstrap or startup; transient I/O is retried by the callers.

use thiserror::Error;

/// Errors raised while building or validating the schema tree.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("unknown node attribute(s): {0}")]
    NodeAttribute(String),

    #[error("table not specified in node: {0}")]
    TableNotInNode(String),

    #[error("unknown schema name: {0}")]
    InvalidSchema(String),

    #[error("table \"{0}\" not found in registry")]
    TableNotFound(String),

    #[error("column \"{column}\" not present on table \"{table}\"")]
    ColumnNotFound { column: String, table: String },

    #[error("relationship type \"{0}\" is invalid")]
    RelationshipType(String),

    #[error("relationship variant \"{0}\" is invalid")]
    RelationshipVariant(String),

    #[error("relationship attribute(s) {0} are invalid")]
    RelationshipAttribute(String),

    #[error("multiple through tables: {0:?}")]
    MultipleThroughTables(Vec<String>),

    #[error("relationship not present on table \"{0}\"")]
    Relationship(String),

    #[error("label \"{label}\" duplicated among children of \"{parent}\"")]
    DuplicateLabel { label: String, parent: String },

    #[error("through table \"{0}\" has no primary key")]
    ThroughTableWithoutPrimaryKey(String),

    #[error("no primary key found on table \"{0}\"")]
    PrimaryKeyNotFound(String),

    #[error("self-referential nesting of \"{table}\" exceeds join_depth {join_depth}")]
    JoinDepthExceeded { table: String, join_depth: usize },

    #[error("malformed node document: {0}")]
    Malformed(String),
}

/// No foreign-key path could be resolved between two tables of the tree.
#[derive(Debug, Error)]
#[error("no foreign key relationship between \"{parent}\" and \"{child}\"")]
pub struct ForeignKeyError {
    pub parent: String,
    pub child: String,
}

/// A logical-decoding line did not match the expected grammar.
#[derive(Debug, Error)]
pub enum SlotParseError {
    #[error("no match for row: {0}")]
    Prefix(String),

    #[error("unknown {tg_op} operation for row: {row}")]
    UnknownOp { tg_op: String, row: String },

    #[error("invalid {data_type} value: {value}")]
    Value { data_type: String, value: String },
}

/// Index-mapping construction failures.
#[derive(Debug, Error)]
pub enum MappingError {
    #[error("invalid search engine type \"{0}\"")]
    InvalidType(String),

    #[error("invalid mapping parameter \"{0}\"")]
    InvalidParameter(String),

    #[error("conflicting mapping merge for \"{0}\"")]
    Conflict(String),
}

/// Search sink failures surfaced to the pipeline.
#[derive(Debug, Error)]
pub enum SearchError {
    #[error("search request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("bulk request returned {failed} failed item(s)")]
    BulkItems { failed: usize },

    #[error("search engine error ({status}): {body}")]
    Response { status: u16, body: String },
}
