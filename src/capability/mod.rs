// ABOUTME: Syncable capability - per-entity-type replication metadata
// ABOUTME: Eligibility, exclusions, transformers and statically declared relations

pub mod declared;
pub mod registry;

pub use declared::DeclaredEntity;
pub use registry::CapabilityRegistry;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use crate::entity::{Entity, EntitySchema, Value};

/// Pure per-attribute rewrite applied while building the target attribute set.
///
/// Receives the source value and the source entity.
pub type Transformer = Arc<dyn Fn(&Value, &Entity) -> Value + Send + Sync>;

/// Kind of a navigable relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    /// The owner holds the foreign key to a parent (belongs-to).
    #[serde(alias = "belongs_to")]
    OwningReference,
    /// One related entity holds a foreign key back to the owner (has-one).
    #[serde(alias = "has_one")]
    OwnedSingle,
    /// Many related entities hold a foreign key back to the owner (has-many).
    #[serde(alias = "has_many")]
    OwnedMany,
}

impl fmt::Display for RelationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RelationKind::OwningReference => "owning_reference",
            RelationKind::OwnedSingle => "owned_single",
            RelationKind::OwnedMany => "owned_many",
        };
        f.write_str(name)
    }
}

/// Which side of a relation stores the foreign key attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForeignKeySide {
    Owner,
    Related,
}

/// One relationship from an owner entity type to a related entity type.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationDescriptor {
    pub kind: RelationKind,
    pub related_type: String,
    pub foreign_key: String,
    /// Extra equality constraints on the related side (`where is_primary = true`).
    pub conditions: Vec<(String, Value)>,
}

impl RelationDescriptor {
    pub fn new(kind: RelationKind, related_type: &str, foreign_key: &str) -> Self {
        Self {
            kind,
            related_type: related_type.to_string(),
            foreign_key: foreign_key.to_string(),
            conditions: Vec::new(),
        }
    }

    pub fn owning_reference(related_type: &str, foreign_key: &str) -> Self {
        Self::new(RelationKind::OwningReference, related_type, foreign_key)
    }

    pub fn owned_single(related_type: &str, foreign_key: &str) -> Self {
        Self::new(RelationKind::OwnedSingle, related_type, foreign_key)
    }

    pub fn owned_many(related_type: &str, foreign_key: &str) -> Self {
        Self::new(RelationKind::OwnedMany, related_type, foreign_key)
    }

    pub fn with_condition(mut self, attribute: &str, value: impl Into<Value>) -> Self {
        self.conditions.push((attribute.to_string(), value.into()));
        self
    }

    pub fn foreign_key_side(&self) -> ForeignKeySide {
        match self.kind {
            RelationKind::OwningReference => ForeignKeySide::Owner,
            RelationKind::OwnedSingle | RelationKind::OwnedMany => ForeignKeySide::Related,
        }
    }
}

/// Capability an entity type must provide to take part in replication.
///
/// Only `schema` is required; the rest default to "copy everything, no
/// relations, no hooks".
pub trait Syncable: Send + Sync {
    /// Declared attribute schema of the entity type.
    fn schema(&self) -> &EntitySchema;

    fn entity_type(&self) -> &str {
        &self.schema().entity_type
    }

    /// Whether a source entity may be copied at all.
    fn is_eligible(&self, _entity: &Entity) -> bool {
        true
    }

    /// Attributes never copied. Always includes the primary key and the
    /// store-managed timestamp columns.
    fn excluded_attributes(&self) -> BTreeSet<String> {
        self.schema().store_managed_columns()
    }

    /// Relations to follow, keyed by relation name.
    fn relation_descriptors(&self) -> BTreeMap<String, RelationDescriptor> {
        BTreeMap::new()
    }

    fn attribute_transformers(&self) -> BTreeMap<String, Transformer> {
        BTreeMap::new()
    }

    /// Runs once per copied entity with the refreshed target entity.
    fn after_sync(&self, _target: &Entity) {}
}
