//! Source-database adapter: schema reflection, replication slot access,
//! trigger installation and the logical-decoding parser.

pub mod connection;
pub mod model;
pub mod slot;
pub mod trigger;
pub mod view;

pub use connection::{connect_with_retry, has_permissions, pg_setting};
pub use model::{ForeignKeyEdge, JoinKeys, ModelRegistry, TableModel};
pub use slot::{parse_slot_line, txid_current};
