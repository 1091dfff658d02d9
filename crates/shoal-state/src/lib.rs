//! shoal-state: data model and embedded state store for Shoal.
//!
//! Backed by [redb](https://docs.rs/redb), holds the task definitions,
//! services, tasks and the append-only deployment event log that the
//! controller reconciles against.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Task definitions and events are keyed by their monotonic `u64` sequence;
//! tasks use the composite key `{service_id}:{task_id}` so a service's fleet
//! can be loaded with a prefix scan.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks. Readers never block each other,
//! which is what makes the [`TaskDefinitionStore`] safe for the read-mostly
//! access pattern of many concurrently reconciling services.

pub mod backoff;
pub mod definitions;
pub mod duration;
pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use backoff::Backoff;
pub use definitions::TaskDefinitionStore;
pub use error::{DefinitionError, StateError, StateResult, ValidationError};
pub use store::StateStore;
pub use types::*;
