//! Document query compilation: one recursive SQL statement per root.

pub mod builder;
pub mod sql;

pub use builder::{FilterEntry, Filters, QueryBuilder, RootScope, join_keys};
