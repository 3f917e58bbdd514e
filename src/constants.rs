use std::time::Duration;

/// Reserved document field holding the reverse index of contributing rows.
pub const META: &str = "_meta";

/// Logical decoding output plugin.
pub const PLUGIN: &str = "test_decoding";

/// Name of the notify trigger function installed in each user schema.
pub const TRIGGER_FUNC: &str = "table_notify";

/// Name of the per-schema materialized manifest read by the trigger function.
pub const MATERIALIZED_VIEW: &str = "_view";

/// Delimiter joining root primary-key values into a document `_id`.
pub const PRIMARY_KEY_DELIMITER: char = '|';

pub const DEFAULT_SCHEMA: &str = "public";

pub const BUILTIN_SCHEMAS: &[&str] = &["information_schema", "pg_catalog", "pg_toast"];

// Node attribute vocabulary for schema-document validation
pub const NODE_ATTRIBUTES: &[&str] = &[
    "children",
    "columns",
    "label",
    "primary_key",
    "relationship",
    "schema",
    "table",
    "transform",
    "watched_columns",
];

pub const RELATIONSHIP_ATTRIBUTES: &[&str] =
    &["foreign_key", "join_depth", "through_tables", "type", "variant"];

/// Field types accepted by the search engines.
pub const SEARCH_TYPES: &[&str] = &[
    "binary",
    "boolean",
    "byte",
    "constant_keyword",
    "date",
    "double",
    "float",
    "half_float",
    "integer",
    "ip",
    "keyword",
    "long",
    "nested",
    "null",
    "object",
    "scaled_float",
    "short",
    "text",
];

/// Mapping parameters accepted by the search engines.
pub const SEARCH_MAPPING_PARAMETERS: &[&str] = &[
    "analyzer",
    "boost",
    "coerce",
    "copy_to",
    "doc_values",
    "dynamic",
    "eager_global_ordinals",
    "enabled",
    "fielddata",
    "fields",
    "format",
    "ignore_above",
    "ignore_malformed",
    "index",
    "index_options",
    "index_phrases",
    "index_prefixes",
    "meta",
    "normalizer",
    "norms",
    "null_value",
    "position_increment_gap",
    "properties",
    "search_analyzer",
    "similarity",
    "store",
    "term_vector",
];

// Pipeline timing defaults; the environment can override most of these
// through `Settings`.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(100);
pub const DEFAULT_QUEUE_POLL_INTERVAL: Duration = Duration::from_millis(10);
pub const DEFAULT_SLOT_CLEANUP_INTERVAL: Duration = Duration::from_secs(180);
pub const DEFAULT_LOG_INTERVAL: Duration = Duration::from_secs(5);
