// ABOUTME: Relationship resolver - follows one relation descriptor per call
// ABOUTME: Rewrites foreign keys into target-space ids and recurses into related entities

use std::collections::HashMap;

use crate::capability::{RelationDescriptor, Syncable};
use crate::engine::SyncEngine;
use crate::entity::{Attributes, Entity, EntityId, Value, DEFAULT_PRIMARY_KEY};
use crate::error::{ReplicationError, Result};
use crate::store::Filter;

/// An owner row whose foreign key must be patched once its parent exists.
#[derive(Debug, Clone, PartialEq)]
struct BackReference {
    entity_type: String,
    source_id: EntityId,
    foreign_key: String,
}

type Key = (String, EntityId);

/// Foreign key writes that could not happen yet because one side is still in flight.
#[derive(Debug, Default)]
pub(crate) struct PendingLinks {
    /// Parent key -> owners created with a NULL foreign key to it.
    awaiting_parent: HashMap<Key, Vec<BackReference>>,
    /// Entity key -> foreign key values to set right before it is created.
    awaiting_creation: HashMap<Key, Vec<(String, Value)>>,
}

impl PendingLinks {
    fn key(entity_type: &str, source_id: &EntityId) -> Key {
        (entity_type.to_string(), source_id.clone())
    }

    fn await_parent(&mut self, parent_type: &str, parent_id: &EntityId, owner: BackReference) {
        self.awaiting_parent
            .entry(Self::key(parent_type, parent_id))
            .or_default()
            .push(owner);
    }

    /// Queues a foreign key value for an entity that has not been created yet.
    pub(crate) fn assign(
        &mut self,
        entity_type: &str,
        source_id: &EntityId,
        foreign_key: &str,
        value: Value,
    ) {
        self.awaiting_creation
            .entry(Self::key(entity_type, source_id))
            .or_default()
            .push((foreign_key.to_string(), value));
    }

    /// Moves queued foreign key values into the attributes about to be inserted.
    pub(crate) fn apply_assignments(
        &mut self,
        entity_type: &str,
        source_id: &EntityId,
        attributes: &mut Attributes,
    ) {
        if let Some(assignments) = self
            .awaiting_creation
            .remove(&Self::key(entity_type, source_id))
        {
            attributes.extend(assignments);
        }
    }

    fn take_back_references(&mut self, parent_type: &str, parent_id: &EntityId) -> Vec<BackReference> {
        self.awaiting_parent
            .remove(&Self::key(parent_type, parent_id))
            .unwrap_or_default()
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.awaiting_parent.is_empty() && self.awaiting_creation.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.awaiting_parent.clear();
        self.awaiting_creation.clear();
    }
}

/// Owner holds the foreign key to a parent.
///
/// Runs before the owner is created: the parent is copied first and the
/// owner's attribute set receives the parent's target id. A parent that is
/// still in flight (cycle) gets a NULL foreign key, patched once the parent
/// is confirmed. Unregistered parent types keep the copied value, provided
/// the parent row exists in the source.
pub(crate) async fn resolve_owning_reference(
    engine: &mut SyncEngine,
    owner: &Entity,
    relation_name: &str,
    relation: &RelationDescriptor,
    attributes: &mut Attributes,
) -> Result<()> {
    let Some(parent_id) = EntityId::from_value(owner.value(&relation.foreign_key)) else {
        tracing::debug!(
            "{}: '{}' is not set, skipping relation '{}'",
            owner.label(),
            relation.foreign_key,
            relation_name
        );
        return Ok(());
    };

    let missing_parent = || ReplicationError::MissingParent {
        entity_type: owner.entity_type().to_string(),
        id: owner.id().clone(),
        foreign_key: relation.foreign_key.clone(),
        parent_type: relation.related_type.clone(),
        parent_id: parent_id.clone(),
    };

    let Some(parent_capability) = engine.registry().get(&relation.related_type) else {
        if !engine
            .source_contains(&relation.related_type, DEFAULT_PRIMARY_KEY, &parent_id)
            .await?
        {
            return Err(missing_parent());
        }
        tracing::debug!(
            "{}: '{}' is not syncable, keeping '{}' = {} as copied",
            owner.label(),
            relation.related_type,
            relation.foreign_key,
            parent_id
        );
        return Ok(());
    };

    if let Some(target_id) = engine
        .mapper()
        .confirmed(&relation.related_type, &parent_id)
        .cloned()
    {
        attributes.insert(relation.foreign_key.clone(), target_id.to_value());
        return Ok(());
    }

    if engine.mapper().is_pending(&relation.related_type, &parent_id) {
        tracing::debug!(
            "{}: parent {}#{} is still in flight, '{}' will be patched after it is created",
            owner.label(),
            relation.related_type,
            parent_id,
            relation.foreign_key
        );
        attributes.insert(relation.foreign_key.clone(), Value::Null);
        engine.links_mut().await_parent(
            &relation.related_type,
            &parent_id,
            BackReference {
                entity_type: owner.entity_type().to_string(),
                source_id: owner.id().clone(),
                foreign_key: relation.foreign_key.clone(),
            },
        );
        return Ok(());
    }

    let parent = engine
        .find_source(parent_capability.schema(), &parent_id)
        .await?
        .ok_or_else(missing_parent)?;

    let target_parent = engine.copy_entity(parent).await?;
    attributes.insert(relation.foreign_key.clone(), target_parent.id().to_value());
    Ok(())
}

/// One related entity holds a foreign key back to the owner.
///
/// Skips silently when the related type is not syncable, no related entity
/// exists, or it is not eligible.
pub(crate) async fn resolve_owned_single(
    engine: &mut SyncEngine,
    owner: &Entity,
    owner_target: &Entity,
    relation_name: &str,
    relation: &RelationDescriptor,
) -> Result<()> {
    let Some(capability) = engine.registry().get(&relation.related_type) else {
        tracing::debug!(
            "{}: '{}' is not syncable, skipping relation '{}'",
            owner.label(),
            relation.related_type,
            relation_name
        );
        return Ok(());
    };

    let related = load_related(engine, capability.as_ref(), owner, relation).await?;
    let Some(child) = related.into_iter().next() else {
        tracing::debug!("{}: relation '{}' is empty", owner.label(), relation_name);
        return Ok(());
    };
    if !capability.is_eligible(&child) {
        tracing::debug!(
            "{}: {} is not eligible, skipping relation '{}'",
            owner.label(),
            child.label(),
            relation_name
        );
        return Ok(());
    }

    link_owned_child(engine, capability.as_ref(), owner_target, relation, child).await
}

/// Many related entities hold a foreign key back to the owner.
///
/// Siblings are independent; each is copied and linked on its own.
pub(crate) async fn resolve_owned_many(
    engine: &mut SyncEngine,
    owner: &Entity,
    owner_target: &Entity,
    relation_name: &str,
    relation: &RelationDescriptor,
) -> Result<()> {
    let Some(capability) = engine.registry().get(&relation.related_type) else {
        tracing::debug!(
            "{}: '{}' is not syncable, skipping relation '{}'",
            owner.label(),
            relation.related_type,
            relation_name
        );
        return Ok(());
    };

    let related = load_related(engine, capability.as_ref(), owner, relation).await?;
    tracing::debug!(
        "{}: relation '{}' has {} related {}",
        owner.label(),
        relation_name,
        related.len(),
        relation.related_type
    );

    for child in related {
        if !capability.is_eligible(&child) {
            tracing::debug!("{}: skipping ineligible {}", owner.label(), child.label());
            continue;
        }
        link_owned_child(engine, capability.as_ref(), owner_target, relation, child).await?;
    }
    Ok(())
}

/// Loads the source entities pointing back at `owner` through the relation.
async fn load_related(
    engine: &mut SyncEngine,
    capability: &dyn Syncable,
    owner: &Entity,
    relation: &RelationDescriptor,
) -> Result<Vec<Entity>> {
    let mut filters = vec![Filter::new(&relation.foreign_key, owner.id().to_value())];
    filters.extend(
        relation
            .conditions
            .iter()
            .map(|(attribute, value)| Filter::new(attribute, value.clone())),
    );
    engine.find_source_where(capability.schema(), &filters).await
}

/// Copies an owned child and points its foreign key at the owner's target id.
async fn link_owned_child(
    engine: &mut SyncEngine,
    capability: &dyn Syncable,
    owner_target: &Entity,
    relation: &RelationDescriptor,
    child: Entity,
) -> Result<()> {
    let child_type = child.entity_type().to_string();
    let owner_key = owner_target.id().to_value();

    if engine.mapper().is_pending(&child_type, child.id()) {
        // The child is further up the call stack, still resolving its own parents.
        engine
            .links_mut()
            .assign(&child_type, child.id(), &relation.foreign_key, owner_key);
        return Ok(());
    }
    if !engine.mapper().has(&child_type, child.id()) {
        engine
            .links_mut()
            .assign(&child_type, child.id(), &relation.foreign_key, owner_key.clone());
    }

    let mut target_child = engine.copy_entity(child).await?;
    if target_child.value(&relation.foreign_key) != &owner_key {
        target_child.set(relation.foreign_key.clone(), owner_key);
        engine.save_target(capability.schema(), &target_child).await?;
    }
    Ok(())
}

/// Patches owners that were created while `parent` was still in flight.
pub(crate) async fn apply_back_references(
    engine: &mut SyncEngine,
    parent_type: &str,
    parent_source_id: &EntityId,
    parent_target_id: &EntityId,
) -> Result<()> {
    let patches = engine
        .links_mut()
        .take_back_references(parent_type, parent_source_id);

    for patch in patches {
        let value = parent_target_id.to_value();
        let owner_target_id = engine
            .mapper()
            .confirmed(&patch.entity_type, &patch.source_id)
            .cloned();

        match owner_target_id {
            Some(owner_target_id) => {
                let capability = engine.registry().require(&patch.entity_type)?;
                let schema = capability.schema();
                let mut owner = engine.fetch_target(schema, &patch.source_id, &owner_target_id).await?;
                tracing::debug!(
                    "Patching {}.{} = {}",
                    owner.label(),
                    patch.foreign_key,
                    parent_target_id
                );
                owner.set(patch.foreign_key.clone(), value);
                engine.save_target(schema, &owner).await?;
            }
            None => {
                engine
                    .links_mut()
                    .assign(&patch.entity_type, &patch.source_id, &patch.foreign_key, value);
            }
        }
    }
    Ok(())
}
