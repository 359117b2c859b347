// ABOUTME: IdMapper - translates source identifiers into target identifiers
// ABOUTME: Two-phase (temporary/confirmed) entries let cycles resolve to in-flight entities

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::entity::EntityId;
use crate::entity::value::PLACEHOLDER_PREFIX;
use crate::error::{ReplicationError, Result};

type Table = HashMap<String, HashMap<EntityId, EntityId>>;

/// One confirmed translation, as exported for persistence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingEntry {
    pub entity_type: String,
    pub source_id: EntityId,
    pub target_id: EntityId,
}

/// Snapshot of the mapper taken before a sync session starts.
#[derive(Debug, Clone, Default)]
pub struct MapperCheckpoint {
    confirmed: Table,
    temporary: Table,
}

/// Source-id to target-id translations for one sync session.
///
/// Keys are `(entity type, source id)`. A temporary entry is registered as
/// soon as an entity is in flight; the confirmed entry replaces it once the
/// target row exists. Lookups prefer confirmed entries.
#[derive(Debug, Clone, Default)]
pub struct IdMapper {
    confirmed: Table,
    temporary: Table,
}

impl IdMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a temporary mapping and returns the placeholder it points at.
    pub fn add_temp(&mut self, entity_type: &str, source_id: &EntityId) -> EntityId {
        let placeholder = EntityId::Text(format!(
            "{}{}",
            PLACEHOLDER_PREFIX,
            uuid::Uuid::new_v4().simple()
        ));
        self.temporary
            .entry(entity_type.to_string())
            .or_default()
            .insert(source_id.clone(), placeholder.clone());
        placeholder
    }

    /// Installs the confirmed mapping and drops any temporary entry for the key.
    ///
    /// Works whether or not the key was ever marked temporary.
    pub fn confirm_temp(&mut self, entity_type: &str, source_id: &EntityId, target_id: EntityId) {
        if let Some(temps) = self.temporary.get_mut(entity_type) {
            temps.remove(source_id);
            if temps.is_empty() {
                self.temporary.remove(entity_type);
            }
        }
        self.add(entity_type, source_id, target_id);
    }

    /// Installs a confirmed mapping.
    pub fn add(&mut self, entity_type: &str, source_id: &EntityId, target_id: EntityId) {
        self.confirmed
            .entry(entity_type.to_string())
            .or_default()
            .insert(source_id.clone(), target_id);
    }

    /// Looks up a mapping, confirmed entries first.
    pub fn get(&self, entity_type: &str, source_id: &EntityId) -> Result<EntityId> {
        lookup(&self.confirmed, entity_type, source_id)
            .or_else(|| lookup(&self.temporary, entity_type, source_id))
            .cloned()
            .ok_or_else(|| ReplicationError::MappingNotFound {
                entity_type: entity_type.to_string(),
                source_id: source_id.clone(),
            })
    }

    /// Confirmed target id, if the entity has been created.
    pub fn confirmed(&self, entity_type: &str, source_id: &EntityId) -> Option<&EntityId> {
        lookup(&self.confirmed, entity_type, source_id)
    }

    pub fn has(&self, entity_type: &str, source_id: &EntityId) -> bool {
        lookup(&self.confirmed, entity_type, source_id).is_some()
            || lookup(&self.temporary, entity_type, source_id).is_some()
    }

    /// Whether the entity is in flight: temporary mapping, no confirmed one yet.
    pub fn is_pending(&self, entity_type: &str, source_id: &EntityId) -> bool {
        lookup(&self.confirmed, entity_type, source_id).is_none()
            && lookup(&self.temporary, entity_type, source_id).is_some()
    }

    /// All mappings for a type, confirmed winning over temporary on collision.
    pub fn mappings_for(&self, entity_type: &str) -> BTreeMap<EntityId, EntityId> {
        let mut merged = BTreeMap::new();
        if let Some(temps) = self.temporary.get(entity_type) {
            merged.extend(temps.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        if let Some(confirmed) = self.confirmed.get(entity_type) {
            merged.extend(confirmed.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        merged
    }

    pub fn clear(&mut self) {
        self.confirmed.clear();
        self.temporary.clear();
    }

    /// Number of distinct keys, confirmed or temporary.
    pub fn len(&self) -> usize {
        let mut total = self.confirmed.values().map(HashMap::len).sum::<usize>();
        for (entity_type, temps) in &self.temporary {
            total += temps
                .keys()
                .filter(|id| lookup(&self.confirmed, entity_type, id).is_none())
                .count();
        }
        total
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn checkpoint(&self) -> MapperCheckpoint {
        MapperCheckpoint {
            confirmed: self.confirmed.clone(),
            temporary: self.temporary.clone(),
        }
    }

    /// Rolls the mapper back to a checkpoint.
    pub fn restore(&mut self, checkpoint: MapperCheckpoint) {
        self.confirmed = checkpoint.confirmed;
        self.temporary = checkpoint.temporary;
    }

    /// Confirmed entries, sorted by entity type then source id.
    pub fn entries(&self) -> Vec<MappingEntry> {
        let mut entries: Vec<MappingEntry> = self
            .confirmed
            .iter()
            .flat_map(|(entity_type, ids)| {
                ids.iter().map(move |(source_id, target_id)| MappingEntry {
                    entity_type: entity_type.clone(),
                    source_id: source_id.clone(),
                    target_id: target_id.clone(),
                })
            })
            .collect();
        entries.sort_by(|a, b| {
            a.entity_type
                .cmp(&b.entity_type)
                .then_with(|| a.source_id.cmp(&b.source_id))
        });
        entries
    }

    /// Builds a mapper holding the given confirmed entries.
    pub fn from_entries(entries: impl IntoIterator<Item = MappingEntry>) -> Self {
        let mut mapper = Self::new();
        for entry in entries {
            mapper.add(&entry.entity_type, &entry.source_id, entry.target_id);
        }
        mapper
    }
}

fn lookup<'a>(table: &'a Table, entity_type: &str, source_id: &EntityId) -> Option<&'a EntityId> {
    table.get(entity_type).and_then(|ids| ids.get(source_id))
}
