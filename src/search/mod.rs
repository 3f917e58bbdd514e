//! Search-index sink: bulk writes, `_meta` reverse-index lookups and index
//! lifecycle against Elasticsearch or OpenSearch.

pub mod client;
pub mod mapping;

pub use client::{BulkAction, SearchClient};
pub use mapping::build_mapping;
