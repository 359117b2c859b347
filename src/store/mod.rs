// ABOUTME: EntityStore contract and helpers shared by every store adapter
// ABOUTME: Opens SQLite or PostgreSQL stores from a connection string

pub mod memory;
pub mod postgres;
pub mod sqlite;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;
pub use sqlite::SqliteStore;

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::time::Duration;

use crate::config::DEFAULT_TIMEOUT_SECS;
use crate::entity::{Attributes, Entity, EntityId, EntitySchema, Value};
use crate::error::ReplicationError;

/// How a transaction is going to be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionMode {
    /// Consistent snapshot of the graph being read; writes are refused.
    ReadOnly,
    ReadWrite,
}

/// Equality filter on one attribute. A NULL value matches missing values.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub attribute: String,
    pub value: Value,
}

impl Filter {
    pub fn new(attribute: &str, value: impl Into<Value>) -> Self {
        Self {
            attribute: attribute.to_string(),
            value: value.into(),
        }
    }
}

/// One backing store holding entities of declared schemas.
///
/// Adapters report failures as `anyhow` errors; the engine wraps them with
/// the store name.
#[async_trait]
pub trait EntityStore: Send {
    /// Short name used in logs and errors.
    fn name(&self) -> &str;

    async fn find(&mut self, schema: &EntitySchema, id: &EntityId) -> Result<Option<Entity>>;

    /// Whether a row with this key exists. Works for entity types without a
    /// declared schema, so only the table and key column are needed.
    async fn exists(&mut self, entity_type: &str, primary_key: &str, id: &EntityId)
        -> Result<bool>;

    /// Entities matching every filter, ordered by primary key.
    async fn find_where(&mut self, schema: &EntitySchema, filters: &[Filter])
        -> Result<Vec<Entity>>;

    /// Inserts a row and returns it with the identifier the store assigned.
    async fn create(&mut self, schema: &EntitySchema, attributes: Attributes) -> Result<Entity>;

    /// Writes every attribute of an existing entity.
    async fn save(&mut self, schema: &EntitySchema, entity: &Entity) -> Result<()>;

    async fn count(&mut self, schema: &EntitySchema) -> Result<u64>;

    async fn begin_transaction(&mut self, mode: TransactionMode) -> Result<()>;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;
}

/// Connection settings shared by every adapter.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Read/statement timeout enforced by the store itself
    pub timeout: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }
}

/// Kind of store a connection string points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreKind {
    Postgres,
    Sqlite(String),
}

/// Detects the store kind from a connection string.
///
/// `postgres://` / `postgresql://` URLs are PostgreSQL; `sqlite:` prefixes and
/// `.db`, `.sqlite`, `.sqlite3` paths are SQLite.
pub fn detect_store_kind(url: &str) -> Result<StoreKind> {
    let trimmed = url.trim();
    if trimmed.starts_with("postgres://") || trimmed.starts_with("postgresql://") {
        return Ok(StoreKind::Postgres);
    }
    if let Some(path) = trimmed.strip_prefix("sqlite://") {
        return Ok(StoreKind::Sqlite(path.to_string()));
    }
    if let Some(path) = trimmed.strip_prefix("sqlite:") {
        return Ok(StoreKind::Sqlite(path.to_string()));
    }
    let lower = trimmed.to_lowercase();
    if [".db", ".sqlite", ".sqlite3"]
        .iter()
        .any(|ext| lower.ends_with(ext))
    {
        return Ok(StoreKind::Sqlite(trimmed.to_string()));
    }
    bail!(
        "Unsupported store '{}'. Use a postgres:// URL, a sqlite: prefix or a .db/.sqlite/.sqlite3 path",
        crate::utils::strip_password_from_url(trimmed).unwrap_or_else(|_| trimmed.to_string())
    )
}

/// Opens a store from a connection string.
pub async fn open(url: &str, options: &StoreOptions) -> Result<Box<dyn EntityStore>> {
    match detect_store_kind(url)? {
        StoreKind::Postgres => Ok(Box::new(PostgresStore::connect(url, options).await?)),
        StoreKind::Sqlite(path) => Ok(Box::new(SqliteStore::open(&path, options)?)),
    }
}

/// Coerces filter values to the declared attribute types.
///
/// The primary key may be filtered on even though it is not an attribute.
pub(crate) fn prepare_filters(schema: &EntitySchema, filters: &[Filter]) -> Result<Vec<Filter>> {
    filters
        .iter()
        .map(|filter| {
            if filter.attribute == schema.primary_key {
                return Ok(filter.clone());
            }
            let spec = schema.spec(&filter.attribute).ok_or_else(|| {
                ReplicationError::attribute(
                    &schema.entity_type,
                    &filter.attribute,
                    "attribute is not declared",
                )
            })?;
            let value = filter.value.clone().coerce(spec.ty).map_err(|msg| {
                ReplicationError::attribute(&schema.entity_type, &filter.attribute, msg)
            })?;
            Ok(Filter {
                attribute: filter.attribute.clone(),
                value,
            })
        })
        .collect()
}

/// Turns a raw row (attribute name to loosely typed value) into an entity.
pub(crate) fn entity_from_row(
    schema: &EntitySchema,
    id: EntityId,
    raw: impl IntoIterator<Item = (String, Value)>,
) -> Result<Entity> {
    let attributes = schema.coerce(raw.into_iter().collect())?;
    Ok(Entity::new(&schema.entity_type, id, attributes))
}

/// Reads the primary key column value.
pub(crate) fn key_from_value(schema: &EntitySchema, value: &Value) -> Result<EntityId> {
    match EntityId::from_value(value) {
        Some(id) => Ok(id),
        None => bail!(
            "{} row has an unusable primary key {:?} in column '{}'",
            schema.entity_type,
            value,
            schema.primary_key
        ),
    }
}
