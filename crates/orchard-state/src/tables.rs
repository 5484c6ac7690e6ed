//! redb table definitions.
//!
//! Keys are instance hashes; values are JSON-serialized domain types.

use redb::TableDefinition;

/// Instance rows: hash → `Instance` JSON.
pub const INSTANCES: TableDefinition<&str, &[u8]> = TableDefinition::new("instances");

/// Captured build logs: hash → `Vec<BuildLogRow>` JSON, append-ordered.
pub const BUILD_LOGS: TableDefinition<&str, &[u8]> = TableDefinition::new("build_logs");
