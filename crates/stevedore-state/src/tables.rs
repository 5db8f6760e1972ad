//! redb table definitions for the state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized
//! domain types).

use redb::TableDefinition;

/// In-flight deployment plans keyed by plan id.
pub const PLANS: TableDefinition<&str, &[u8]> = TableDefinition::new("plans");

/// Group trees keyed by path id. Only the root (`/`) is written today.
pub const GROUPS: TableDefinition<&str, &[u8]> = TableDefinition::new("groups");
