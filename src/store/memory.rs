// ABOUTME: MemoryStore - in-process EntityStore with snapshot transactions
// ABOUTME: Cloned handles share the same tables, so callers can inspect a store after handing it off

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{entity_from_row, prepare_filters, EntityStore, Filter, TransactionMode};
use crate::entity::{Attributes, Entity, EntityId, EntitySchema, KeyKind, Value};

#[derive(Debug, Clone, Default)]
struct Tables {
    rows: HashMap<String, BTreeMap<EntityId, Attributes>>,
    next_ids: HashMap<String, i64>,
}

#[derive(Debug, Default)]
struct Inner {
    tables: Tables,
    snapshot: Option<Tables>,
    mode: Option<TransactionMode>,
}

/// Entity store kept entirely in memory.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    name: String,
    first_id: i64,
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            first_id: 1,
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    /// Starts integer keys at `first_id` instead of 1, so source and target
    /// key spaces are easy to tell apart.
    pub fn with_first_id(mut self, first_id: i64) -> Self {
        self.first_id = first_id;
        self
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| anyhow!("memory store '{}' lock is poisoned", self.name))
    }

    fn ensure_writable(&self, inner: &Inner) -> Result<()> {
        if inner.mode == Some(TransactionMode::ReadOnly) {
            bail!(
                "memory store '{}' is inside a read-only transaction",
                self.name
            );
        }
        Ok(())
    }

    /// Inserts a row outside of the transaction rules (fixtures).
    pub fn seed(&self, schema: &EntitySchema, attributes: Attributes) -> Result<Entity> {
        let mut inner = self.lock()?;
        self.insert_row(&mut inner, schema, attributes)
    }

    /// Number of rows of an entity type.
    pub fn row_count(&self, entity_type: &str) -> Result<usize> {
        let inner = self.lock()?;
        Ok(inner
            .tables
            .rows
            .get(entity_type)
            .map_or(0, BTreeMap::len))
    }

    /// Every row of an entity type, ordered by key.
    pub fn rows(&self, entity_type: &str) -> Result<Vec<(EntityId, Attributes)>> {
        let inner = self.lock()?;
        Ok(inner
            .tables
            .rows
            .get(entity_type)
            .map(|rows| {
                rows.iter()
                    .map(|(id, attrs)| (id.clone(), attrs.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn insert_row(
        &self,
        inner: &mut Inner,
        schema: &EntitySchema,
        attributes: Attributes,
    ) -> Result<Entity> {
        let mut prepared = schema.prepare_insert(attributes)?;
        for name in schema.attribute_names() {
            prepared.entry(name.to_string()).or_insert(Value::Null);
        }

        let id = match schema.key_kind {
            KeyKind::Integer => {
                let next = inner
                    .tables
                    .next_ids
                    .entry(schema.entity_type.clone())
                    .or_insert(self.first_id);
                let id = *next;
                *next += 1;
                EntityId::Int(id)
            }
            KeyKind::Uuid => schema
                .generate_key()
                .ok_or_else(|| anyhow!("no key generator for {}", schema.entity_type))?,
        };

        inner
            .tables
            .rows
            .entry(schema.entity_type.clone())
            .or_default()
            .insert(id.clone(), prepared.clone());
        Ok(Entity::new(&schema.entity_type, id, prepared))
    }

    fn read(&self, schema: &EntitySchema, id: &EntityId) -> Result<Option<Entity>> {
        let inner = self.lock()?;
        match inner
            .tables
            .rows
            .get(&schema.entity_type)
            .and_then(|rows| rows.get(id))
        {
            Some(attrs) => Ok(Some(entity_from_row(schema, id.clone(), attrs.clone())?)),
            None => Ok(None),
        }
    }

    fn contains(&self, entity_type: &str, id: &EntityId) -> Result<bool> {
        let inner = self.lock()?;
        Ok(inner
            .tables
            .rows
            .get(entity_type)
            .is_some_and(|rows| rows.contains_key(id)))
    }

    fn select(&self, schema: &EntitySchema, filters: &[Filter]) -> Result<Vec<Entity>> {
        let filters = prepare_filters(schema, filters)?;
        let inner = self.lock()?;
        let Some(rows) = inner.tables.rows.get(&schema.entity_type) else {
            return Ok(Vec::new());
        };

        rows.iter()
            .filter(|(id, attrs)| {
                filters.iter().all(|filter| {
                    if filter.attribute == schema.primary_key {
                        EntityId::from_value(&filter.value).as_ref() == Some(*id)
                    } else {
                        attrs.get(&filter.attribute).unwrap_or(&Value::Null) == &filter.value
                    }
                })
            })
            .map(|(id, attrs)| entity_from_row(schema, id.clone(), attrs.clone()))
            .collect()
    }

    fn update(&self, schema: &EntitySchema, entity: &Entity) -> Result<()> {
        let mut inner = self.lock()?;
        self.ensure_writable(&inner)?;
        let prepared = schema.prepare_update(entity.attributes().clone())?;
        let row = inner
            .tables
            .rows
            .get_mut(&schema.entity_type)
            .and_then(|rows| rows.get_mut(entity.id()))
            .ok_or_else(|| {
                anyhow!(
                    "cannot save {}: row does not exist in '{}'",
                    entity.label(),
                    self.name
                )
            })?;
        row.extend(prepared);
        Ok(())
    }

    fn begin(&self, mode: TransactionMode) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.mode.is_some() {
            bail!("memory store '{}' already has a transaction open", self.name);
        }
        inner.snapshot = Some(inner.tables.clone());
        inner.mode = Some(mode);
        Ok(())
    }

    fn finish(&self, commit: bool) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.mode.take().is_none() {
            bail!("memory store '{}' has no transaction open", self.name);
        }
        let snapshot = inner.snapshot.take();
        if !commit {
            if let Some(tables) = snapshot {
                inner.tables = tables;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn find(&mut self, schema: &EntitySchema, id: &EntityId) -> Result<Option<Entity>> {
        self.read(schema, id)
    }

    async fn exists(
        &mut self,
        entity_type: &str,
        _primary_key: &str,
        id: &EntityId,
    ) -> Result<bool> {
        self.contains(entity_type, id)
    }

    async fn find_where(
        &mut self,
        schema: &EntitySchema,
        filters: &[Filter],
    ) -> Result<Vec<Entity>> {
        self.select(schema, filters)
    }

    async fn create(&mut self, schema: &EntitySchema, attributes: Attributes) -> Result<Entity> {
        let mut inner = self.lock()?;
        self.ensure_writable(&inner)?;
        self.insert_row(&mut inner, schema, attributes)
    }

    async fn save(&mut self, schema: &EntitySchema, entity: &Entity) -> Result<()> {
        self.update(schema, entity)
    }

    async fn count(&mut self, schema: &EntitySchema) -> Result<u64> {
        Ok(self.row_count(&schema.entity_type)? as u64)
    }

    async fn begin_transaction(&mut self, mode: TransactionMode) -> Result<()> {
        self.begin(mode)
    }

    async fn commit(&mut self) -> Result<()> {
        self.finish(true)
    }

    async fn rollback(&mut self) -> Result<()> {
        self.finish(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::AttributeType;

    fn organizations() -> EntitySchema {
        EntitySchema::new("organizations")
            .with_timestamps()
            .attribute("name", AttributeType::String)
            .attribute("status", AttributeType::String)
    }

    fn named(name: &str) -> Attributes {
        let mut attrs = Attributes::new();
        attrs.insert("name".to_string(), Value::from(name));
        attrs
    }

    #[tokio::test]
    async fn test_create_assigns_keys_from_first_id() {
        let mut store = MemoryStore::new("target").with_first_id(1000);
        let schema = organizations();

        let first = store.create(&schema, named("Acme")).await.unwrap();
        let second = store.create(&schema, named("Globex")).await.unwrap();

        assert_eq!(first.id(), &EntityId::Int(1000));
        assert_eq!(second.id(), &EntityId::Int(1001));
        assert_eq!(first.value("status"), &Value::Null);
        assert!(matches!(first.value("created_at"), Value::Timestamp(_)));
        assert_eq!(store.count(&schema).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_rollback_restores_snapshot() {
        let mut store = MemoryStore::new("target");
        let schema = organizations();
        store.seed(&schema, named("Existing")).unwrap();

        store
            .begin_transaction(TransactionMode::ReadWrite)
            .await
            .unwrap();
        store.create(&schema, named("Discarded")).await.unwrap();
        assert_eq!(store.row_count("organizations").unwrap(), 2);
        store.rollback().await.unwrap();

        assert_eq!(store.row_count("organizations").unwrap(), 1);
        assert!(store.rollback().await.is_err());
    }

    #[tokio::test]
    async fn test_read_only_transaction_refuses_writes() {
        let mut store = MemoryStore::new("source");
        let schema = organizations();
        let existing = store.seed(&schema, named("Existing")).unwrap();

        store
            .begin_transaction(TransactionMode::ReadOnly)
            .await
            .unwrap();
        assert!(store.create(&schema, named("New")).await.is_err());
        assert!(store.save(&schema, &existing).await.is_err());
        assert!(store.find(&schema, existing.id()).await.unwrap().is_some());
        store.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_find_where_and_save() {
        let mut store = MemoryStore::new("target");
        let schema = organizations();
        let mut acme = store.seed(&schema, named("Acme")).unwrap();
        store.seed(&schema, named("Globex")).unwrap();

        acme.set("status", "active");
        store.save(&schema, &acme).await.unwrap();

        let active = store
            .find_where(&schema, &[Filter::new("status", "active")])
            .await
            .unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].value("name"), &Value::from("Acme"));

        let unset = store
            .find_where(&schema, &[Filter::new("status", Value::Null)])
            .await
            .unwrap();
        assert_eq!(unset.len(), 1);
        assert_eq!(unset[0].value("name"), &Value::from("Globex"));
    }

    #[tokio::test]
    async fn test_exists_checks_table_and_key() {
        let mut store = MemoryStore::new("source");
        let acme = store.seed(&organizations(), named("Acme")).unwrap();

        assert!(store.exists("organizations", "id", acme.id()).await.unwrap());
        assert!(!store
            .exists("organizations", "id", &EntityId::Int(999999))
            .await
            .unwrap());
        assert!(!store.exists("countries", "id", acme.id()).await.unwrap());
    }

    #[tokio::test]
    async fn test_clones_share_tables() {
        let store = MemoryStore::new("target");
        let mut handle: Box<dyn EntityStore> = Box::new(store.clone());
        handle
            .create(&organizations(), named("Acme"))
            .await
            .unwrap();
        assert_eq!(store.row_count("organizations").unwrap(), 1);
    }
}
