// ABOUTME: SyncEngine - copies a root entity and its reachable graph between stores
// ABOUTME: Depth-first, mapper-checked, inside one source/target transaction pair

use futures::future::BoxFuture;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::capability::{CapabilityRegistry, ForeignKeySide, RelationKind, Syncable};
use crate::config::ReplicatorConfig;
use crate::entity::{Attributes, Entity, EntityId, EntitySchema};
use crate::error::{ReplicationError, Result};
use crate::mapper::IdMapper;
use crate::resolver::{self, PendingLinks};
use crate::store::{self, EntityStore, Filter, StoreOptions};
use crate::transaction::TransactionCoordinator;

/// Outcome of one `sync` call: the root's source id and its id in the target store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncResult {
    original_id: EntityId,
    new_id: EntityId,
}

impl SyncResult {
    pub fn new(original_id: EntityId, new_id: EntityId) -> Self {
        Self {
            original_id,
            new_id,
        }
    }

    pub fn original_id(&self) -> &EntityId {
        &self.original_id
    }

    pub fn new_id(&self) -> &EntityId {
        &self.new_id
    }
}

/// Replicates entity graphs from a source store into a target store.
///
/// One engine is one session: the identifier mapper lives as long as the
/// engine, so repeated `sync` calls on the same engine never duplicate a
/// shared dependency. Calls must not overlap; `sync` takes `&mut self`.
pub struct SyncEngine {
    registry: CapabilityRegistry,
    stores: TransactionCoordinator,
    mapper: IdMapper,
    links: PendingLinks,
    excluded_columns: BTreeSet<String>,
    batch_size: i64,
}

impl SyncEngine {
    /// Creates an engine over already opened stores.
    ///
    /// Fails with a configuration error when the configuration is invalid.
    pub fn new(
        config: &ReplicatorConfig,
        registry: CapabilityRegistry,
        source: Box<dyn EntityStore>,
        target: Box<dyn EntityStore>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            registry,
            stores: TransactionCoordinator::new(source, target),
            mapper: IdMapper::new(),
            links: PendingLinks::default(),
            excluded_columns: config.excluded_columns(),
            batch_size: config.batch_size(),
        })
    }

    /// Opens both stores named by the configuration and creates an engine.
    pub async fn connect(config: &ReplicatorConfig, registry: CapabilityRegistry) -> Result<Self> {
        config.validate()?;
        crate::utils::validate_source_target_different(config.source(), config.target())
            .map_err(|e| ReplicationError::Configuration(format!("{:#}", e)))?;

        let options = StoreOptions {
            timeout: config.timeout(),
        };
        let source = store::open(config.source(), &options)
            .await
            .map_err(ReplicationError::store("source"))?;
        let target = store::open(config.target(), &options)
            .await
            .map_err(ReplicationError::store("target"))?;
        Self::new(config, registry, source, target)
    }

    /// Replaces the session mapper, e.g. with mappings persisted by an earlier run.
    pub fn with_mapper(mut self, mapper: IdMapper) -> Self {
        self.mapper = mapper;
        self
    }

    pub fn mapper(&self) -> &IdMapper {
        &self.mapper
    }

    pub fn mapper_mut(&mut self) -> &mut IdMapper {
        &mut self.mapper
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    pub fn batch_size(&self) -> i64 {
        self.batch_size
    }

    /// Changes the batch size. Must be positive.
    pub fn set_batch_size(&mut self, batch_size: i64) -> Result<()> {
        if batch_size <= 0 {
            return Err(ReplicationError::Configuration(
                "Batch size must be a positive integer".to_string(),
            ));
        }
        self.batch_size = batch_size;
        Ok(())
    }

    pub fn source_mut(&mut self) -> &mut dyn EntityStore {
        self.stores.source()
    }

    pub fn target_mut(&mut self) -> &mut dyn EntityStore {
        self.stores.target()
    }

    pub(crate) fn links_mut(&mut self) -> &mut PendingLinks {
        &mut self.links
    }

    /// Copies the entity `(entity_type, id)` and everything it reaches.
    ///
    /// Both stores are committed only when the whole graph has been copied.
    /// On failure both are rolled back and the mapper is restored to its
    /// state before the call.
    pub async fn sync(
        &mut self,
        entity_type: &str,
        id: impl Into<EntityId>,
    ) -> Result<SyncResult> {
        let source_id = id.into();
        let capability = self.registry.require(entity_type)?;

        tracing::info!("Syncing {} {}", entity_type, source_id);
        let checkpoint = self.mapper.checkpoint();
        self.stores.begin().await?;

        let copied = self.sync_root(capability, &source_id).await;
        let committed = match copied {
            Ok(target) => self.stores.commit().await.map(|()| target),
            Err(e) => {
                tracing::warn!(
                    "Sync of {} {} failed, rolling back: {}",
                    entity_type,
                    source_id,
                    e
                );
                self.stores.rollback().await;
                Err(e)
            }
        };
        self.links.clear();

        match committed {
            Ok(target) => {
                let result = SyncResult::new(source_id, target.id().clone());
                tracing::info!(
                    "Synced {} {} -> {}",
                    entity_type,
                    result.original_id(),
                    result.new_id()
                );
                Ok(result)
            }
            Err(e) => {
                self.mapper.restore(checkpoint);
                Err(e)
            }
        }
    }

    /// Syncs several roots of one type in the same session.
    ///
    /// Each root gets its own transaction pair; shared dependencies are
    /// copied once. Stops at the first failure, keeping earlier roots committed.
    pub async fn sync_many(
        &mut self,
        entity_type: &str,
        ids: impl IntoIterator<Item = EntityId>,
    ) -> Result<Vec<SyncResult>> {
        let mut results = Vec::new();
        for id in ids {
            results.push(self.sync(entity_type, id).await?);
        }
        Ok(results)
    }

    async fn sync_root(
        &mut self,
        capability: Arc<dyn Syncable>,
        source_id: &EntityId,
    ) -> Result<Entity> {
        let schema = capability.schema();
        let source = self
            .find_source(schema, source_id)
            .await?
            .ok_or_else(|| ReplicationError::EntityNotFound {
                store: self.stores.source().name().to_string(),
                entity_type: schema.entity_type.clone(),
                id: source_id.clone(),
            })?;

        if !capability.is_eligible(&source) {
            return Err(ReplicationError::IneligibleEntity {
                entity_type: schema.entity_type.clone(),
                id: source_id.clone(),
            });
        }
        self.copy_entity(source).await
    }

    /// Copies one source entity, returning its target counterpart.
    ///
    /// Boxed because relation resolution recurses back into it.
    pub(crate) fn copy_entity(&mut self, source: Entity) -> BoxFuture<'_, Result<Entity>> {
        Box::pin(async move { self.copy_entity_inner(source).await })
    }

    async fn copy_entity_inner(&mut self, source: Entity) -> Result<Entity> {
        let entity_type = source.entity_type().to_string();
        let capability = self.registry.require(&entity_type)?;
        let schema = capability.schema();

        if let Some(target_id) = self.mapper.confirmed(&entity_type, source.id()).cloned() {
            tracing::debug!("{} already synced as {}", source.label(), target_id);
            return self.fetch_target(schema, source.id(), &target_id).await;
        }
        if self.mapper.is_pending(&entity_type, source.id()) {
            // Callers route in-flight entities through pending links instead.
            return Err(ReplicationError::MappingNotFound {
                entity_type,
                source_id: source.id().clone(),
            });
        }

        if !capability.is_eligible(&source) {
            return Err(ReplicationError::IneligibleEntity {
                entity_type,
                id: source.id().clone(),
            });
        }

        let mut attributes = self.build_attributes(capability.as_ref(), &source);
        self.mapper.add_temp(&entity_type, source.id());

        let relations = capability.relation_descriptors();
        for (name, relation) in &relations {
            if relation.foreign_key_side() == ForeignKeySide::Owner {
                resolver::resolve_owning_reference(self, &source, name, relation, &mut attributes)
                    .await?;
            }
        }
        self.links
            .apply_assignments(&entity_type, source.id(), &mut attributes);

        let created = {
            let target = self.stores.target();
            let target_name = target.name().to_string();
            target
                .create(schema, attributes)
                .await
                .map_err(ReplicationError::store(&target_name))?
        };
        self.mapper
            .confirm_temp(&entity_type, source.id(), created.id().clone());
        tracing::debug!("Copied {} -> {}", source.label(), created.id());

        resolver::apply_back_references(self, &entity_type, source.id(), created.id()).await?;

        for (name, relation) in &relations {
            match relation.kind {
                RelationKind::OwningReference => {}
                RelationKind::OwnedSingle => {
                    resolver::resolve_owned_single(self, &source, &created, name, relation)
                        .await?
                }
                RelationKind::OwnedMany => {
                    resolver::resolve_owned_many(self, &source, &created, name, relation).await?
                }
            }
        }

        let refreshed = self.fetch_target(schema, source.id(), created.id()).await?;
        capability.after_sync(&refreshed);
        Ok(refreshed)
    }

    /// Attributes to insert: everything except excluded columns, transformed.
    fn build_attributes(&self, capability: &dyn Syncable, source: &Entity) -> Attributes {
        let mut excluded = capability.excluded_attributes();
        excluded.extend(self.excluded_columns.iter().cloned());
        excluded.insert(capability.schema().primary_key.clone());

        let mut attributes: Attributes = source
            .attributes()
            .iter()
            .filter(|(name, _)| !excluded.contains(*name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();

        for (name, transformer) in capability.attribute_transformers() {
            if let Some(value) = attributes.get_mut(&name) {
                *value = transformer(&*value, source);
            }
        }
        attributes
    }

    pub(crate) async fn find_source(
        &mut self,
        schema: &EntitySchema,
        id: &EntityId,
    ) -> Result<Option<Entity>> {
        let source = self.stores.source();
        let name = source.name().to_string();
        source
            .find(schema, id)
            .await
            .map_err(ReplicationError::store(&name))
    }

    pub(crate) async fn source_contains(
        &mut self,
        entity_type: &str,
        primary_key: &str,
        id: &EntityId,
    ) -> Result<bool> {
        let source = self.stores.source();
        let name = source.name().to_string();
        source
            .exists(entity_type, primary_key, id)
            .await
            .map_err(ReplicationError::store(&name))
    }

    pub(crate) async fn find_source_where(
        &mut self,
        schema: &EntitySchema,
        filters: &[Filter],
    ) -> Result<Vec<Entity>> {
        let source = self.stores.source();
        let name = source.name().to_string();
        source
            .find_where(schema, filters)
            .await
            .map_err(ReplicationError::store(&name))
    }

    /// Loads the target row a mapping points at.
    pub(crate) async fn fetch_target(
        &mut self,
        schema: &EntitySchema,
        source_id: &EntityId,
        target_id: &EntityId,
    ) -> Result<Entity> {
        let target = self.stores.target();
        let name = target.name().to_string();
        target
            .find(schema, target_id)
            .await
            .map_err(ReplicationError::store(&name))?
            .ok_or_else(|| ReplicationError::StaleMapping {
                entity_type: schema.entity_type.clone(),
                source_id: source_id.clone(),
                target_id: target_id.clone(),
            })
    }

    pub(crate) async fn save_target(&mut self, schema: &EntitySchema, entity: &Entity) -> Result<()> {
        let target = self.stores.target();
        let name = target.name().to_string();
        target
            .save(schema, entity)
            .await
            .map_err(ReplicationError::store(&name))
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("registry", &self.registry)
            .field("mappings", &self.mapper.len())
            .field("batch_size", &self.batch_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::DeclaredEntity;
    use crate::entity::{AttributeType, Value};
    use crate::store::MemoryStore;

    fn registry() -> CapabilityRegistry {
        let mut registry = CapabilityRegistry::new();
        registry.register(DeclaredEntity::new(
            EntitySchema::new("organizations")
                .with_timestamps()
                .attribute("name", AttributeType::String)
                .attribute("deleted_at", AttributeType::Timestamp),
        ));
        registry
    }

    fn engine(source: &MemoryStore, target: &MemoryStore) -> SyncEngine {
        SyncEngine::new(
            &ReplicatorConfig::new("source", "target"),
            registry(),
            Box::new(source.clone()),
            Box::new(target.clone()),
        )
        .unwrap()
    }

    #[test]
    fn test_new_rejects_invalid_configuration() {
        let result = SyncEngine::new(
            &ReplicatorConfig::new("", "target"),
            registry(),
            Box::new(MemoryStore::new("source")),
            Box::new(MemoryStore::new("target")),
        );
        assert!(matches!(result, Err(ReplicationError::Configuration(_))));
    }

    #[test]
    fn test_batch_size_is_validated() {
        let mut engine = engine(&MemoryStore::new("source"), &MemoryStore::new("target"));
        assert_eq!(engine.batch_size(), 100);
        assert!(engine.set_batch_size(0).is_err());
        engine.set_batch_size(500).unwrap();
        assert_eq!(engine.batch_size(), 500);
    }

    #[test]
    fn test_build_attributes_drops_global_and_managed_columns() {
        let engine = engine(&MemoryStore::new("source"), &MemoryStore::new("target"));
        let capability = engine.registry().require("organizations").unwrap();

        let mut attrs = Attributes::new();
        attrs.insert("name".into(), Value::from("Acme"));
        attrs.insert("created_at".into(), Value::from("2024-01-01T00:00:00Z"));
        attrs.insert("deleted_at".into(), Value::Null);
        let source = Entity::new("organizations", EntityId::Int(1), attrs);

        let built = engine.build_attributes(capability.as_ref(), &source);
        assert_eq!(built.len(), 1);
        assert_eq!(built["name"], Value::from("Acme"));
    }

    #[tokio::test]
    async fn test_sync_result_serializes_both_ids() {
        let source = MemoryStore::new("source");
        let target = MemoryStore::new("target").with_first_id(1000);
        let schema = registry().require("organizations").unwrap().schema().clone();
        let mut attrs = Attributes::new();
        attrs.insert("name".into(), Value::from("Test Organization"));
        source.seed(&schema, attrs).unwrap();

        let mut engine = engine(&source, &target);
        let result = engine.sync("organizations", 1).await.unwrap();
        assert_eq!(
            serde_json::to_value(&result).unwrap(),
            serde_json::json!({"original_id": 1, "new_id": 1000})
        );
    }
}
