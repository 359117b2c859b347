// ABOUTME: Library root for entity-replicator
// ABOUTME: Copies an entity and its reachable relationship graph between datastores

pub mod capability;
pub mod commands;
pub mod config;
pub mod engine;
pub mod entity;
pub mod error;
pub mod mapper;
mod resolver;
pub mod state;
pub mod store;
pub mod transaction;
pub mod utils;

pub use capability::{
    CapabilityRegistry, DeclaredEntity, RelationDescriptor, RelationKind, Syncable,
};
pub use config::ReplicatorConfig;
pub use engine::{SyncEngine, SyncResult};
pub use entity::{AttributeType, Entity, EntityId, EntitySchema, Value};
pub use error::{ReplicationError, Result};
pub use mapper::IdMapper;
pub use store::{EntityStore, MemoryStore, PostgresStore, SqliteStore};
