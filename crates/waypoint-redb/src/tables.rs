//! Redb table definitions for a store file.

use redb::TableDefinition;

/// Key -> JSON-encoded value
pub const DATA: TableDefinition<&str, &str> = TableDefinition::new("data");

/// Key -> (last access, last change), nanoseconds since the Unix epoch
pub const METADATA: TableDefinition<&str, (u64, u64)> = TableDefinition::new("metadata");
