//! redb table definitions for the Shoal state store.
//!
//! Values are JSON-serialized domain types. Definitions and events are keyed
//! by their monotonic sequence so `last()` yields the newest entry.

use redb::TableDefinition;

/// Task definitions keyed by version.
pub const DEFINITIONS: TableDefinition<u64, &[u8]> = TableDefinition::new("definitions");

/// Services keyed by service id.
pub const SERVICES: TableDefinition<&str, &[u8]> = TableDefinition::new("services");

/// Tasks keyed by `{service_id}:{task_id}`.
pub const TASKS: TableDefinition<&str, &[u8]> = TableDefinition::new("tasks");

/// Deployment events keyed by sequence number.
pub const EVENTS: TableDefinition<u64, &[u8]> = TableDefinition::new("events");
