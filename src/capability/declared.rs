// ABOUTME: DeclaredEntity - Syncable capability built from a static declaration
// ABOUTME: Covers exclusions, eligibility rules, relations, transformers and hooks

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use super::{RelationDescriptor, Syncable, Transformer};
use crate::config::{toml_to_value, EntityDefinition};
use crate::entity::{Entity, EntitySchema, Value};
use crate::error::{ReplicationError, Result};

type Hook = Arc<dyn Fn(&Entity) + Send + Sync>;
type Predicate = Arc<dyn Fn(&Entity) -> bool + Send + Sync>;

/// A syncable entity type described by data rather than code.
#[derive(Clone)]
pub struct DeclaredEntity {
    schema: EntitySchema,
    excluded: BTreeSet<String>,
    excluded_relations: BTreeSet<String>,
    relations: BTreeMap<String, RelationDescriptor>,
    require_present: Vec<String>,
    require_equals: Vec<(String, Value)>,
    predicate: Option<Predicate>,
    transformers: BTreeMap<String, Transformer>,
    after_sync: Option<Hook>,
}

impl DeclaredEntity {
    pub fn new(schema: EntitySchema) -> Self {
        Self {
            schema,
            excluded: BTreeSet::new(),
            excluded_relations: BTreeSet::new(),
            relations: BTreeMap::new(),
            require_present: Vec::new(),
            require_equals: Vec::new(),
            predicate: None,
            transformers: BTreeMap::new(),
            after_sync: None,
        }
    }

    /// Builds a capability from a configuration entry.
    pub fn from_definition(entity_type: &str, definition: &EntityDefinition) -> Result<Self> {
        let mut entity = Self::new(definition.schema(entity_type));
        for attribute in &definition.exclude {
            entity = entity.exclude(attribute);
        }
        for relation in &definition.exclude_relations {
            entity = entity.exclude_relation(relation);
        }
        for attribute in &definition.require_present {
            entity = entity.require_present(attribute);
        }
        for (attribute, value) in &definition.require_equals {
            entity = entity.require_equals(attribute, toml_to_value(value));
        }
        for (name, relation) in &definition.relations {
            if relation.related.is_empty() || relation.foreign_key.is_empty() {
                return Err(ReplicationError::Configuration(format!(
                    "entity '{}': relation '{}' needs a related type and a foreign key",
                    entity_type, name
                )));
            }
            let descriptor = relation.conditions.iter().fold(
                RelationDescriptor::new(relation.kind, &relation.related, &relation.foreign_key),
                |descriptor, (attribute, value)| {
                    descriptor.with_condition(attribute, toml_to_value(value))
                },
            );
            entity = entity.relation(name, descriptor);
        }
        Ok(entity)
    }

    pub fn exclude(mut self, attribute: &str) -> Self {
        self.excluded.insert(attribute.to_string());
        self
    }

    /// Stops the named relation from being followed.
    pub fn exclude_relation(mut self, relation: &str) -> Self {
        self.excluded_relations.insert(relation.to_string());
        self
    }

    pub fn relation(mut self, name: &str, descriptor: RelationDescriptor) -> Self {
        self.relations.insert(name.to_string(), descriptor);
        self
    }

    /// Entities with a NULL or missing `attribute` are ineligible.
    pub fn require_present(mut self, attribute: &str) -> Self {
        self.require_present.push(attribute.to_string());
        self
    }

    /// Entities whose `attribute` differs from `value` are ineligible.
    pub fn require_equals(mut self, attribute: &str, value: impl Into<Value>) -> Self {
        self.require_equals.push((attribute.to_string(), value.into()));
        self
    }

    /// Adds a custom eligibility predicate, checked after the declared rules.
    pub fn eligible_when(
        mut self,
        predicate: impl Fn(&Entity) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    /// Registers a transformer for one attribute.
    pub fn with_transformer(
        mut self,
        attribute: &str,
        transformer: impl Fn(&Value, &Entity) -> Value + Send + Sync + 'static,
    ) -> Self {
        self.transformers
            .insert(attribute.to_string(), Arc::new(transformer));
        self
    }

    pub fn on_after_sync(mut self, hook: impl Fn(&Entity) + Send + Sync + 'static) -> Self {
        self.after_sync = Some(Arc::new(hook));
        self
    }
}

impl Syncable for DeclaredEntity {
    fn schema(&self) -> &EntitySchema {
        &self.schema
    }

    fn is_eligible(&self, entity: &Entity) -> bool {
        let present = self
            .require_present
            .iter()
            .all(|attribute| !entity.value(attribute).is_null());
        let equal = self
            .require_equals
            .iter()
            .all(|(attribute, expected)| entity.value(attribute) == expected);
        present && equal && self.predicate.as_ref().map_or(true, |p| p(entity))
    }

    fn excluded_attributes(&self) -> BTreeSet<String> {
        let mut excluded = self.schema.store_managed_columns();
        excluded.extend(self.excluded.iter().cloned());
        excluded
    }

    fn relation_descriptors(&self) -> BTreeMap<String, RelationDescriptor> {
        self.relations
            .iter()
            .filter(|(name, _)| !self.excluded_relations.contains(*name))
            .map(|(name, descriptor)| (name.clone(), descriptor.clone()))
            .collect()
    }

    fn attribute_transformers(&self) -> BTreeMap<String, Transformer> {
        self.transformers.clone()
    }

    fn after_sync(&self, target: &Entity) {
        if let Some(hook) = &self.after_sync {
            hook(target);
        }
    }
}

impl std::fmt::Debug for DeclaredEntity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeclaredEntity")
            .field("entity_type", &self.schema.entity_type)
            .field("excluded", &self.excluded)
            .field("relations", &self.relations.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::RelationKind;
    use crate::entity::{AttributeType, Attributes, EntityId};

    fn resources() -> DeclaredEntity {
        DeclaredEntity::new(
            EntitySchema::new("resources")
                .with_timestamps()
                .attribute("name", AttributeType::String)
                .attribute("organization_id", AttributeType::Integer)
                .attribute("status", AttributeType::String),
        )
        .relation(
            "organization",
            RelationDescriptor::owning_reference("organizations", "organization_id"),
        )
        .relation(
            "services",
            RelationDescriptor::owned_many("services", "resource_id"),
        )
    }

    fn resource(organization_id: Value) -> Entity {
        let mut attrs = Attributes::new();
        attrs.insert("name".into(), Value::from("Test Resource"));
        attrs.insert("organization_id".into(), organization_id);
        attrs.insert("status".into(), Value::from("active"));
        Entity::new("resources", EntityId::from(1), attrs)
    }

    #[test]
    fn test_require_present() {
        let capability = resources().require_present("organization_id");
        assert!(capability.is_eligible(&resource(Value::Integer(1))));
        assert!(!capability.is_eligible(&resource(Value::Null)));
    }

    #[test]
    fn test_require_equals_and_predicate() {
        let capability = resources().require_equals("status", "active");
        assert!(capability.is_eligible(&resource(Value::Integer(1))));

        let capability = resources().require_equals("status", "archived");
        assert!(!capability.is_eligible(&resource(Value::Integer(1))));

        let capability =
            resources().eligible_when(|e| e.value("name") != &Value::from("Test Resource"));
        assert!(!capability.is_eligible(&resource(Value::Integer(1))));
    }

    #[test]
    fn test_excluded_relations_are_hidden() {
        let capability = resources().exclude_relation("services");
        let relations = capability.relation_descriptors();
        assert_eq!(relations.len(), 1);
        assert_eq!(
            relations["organization"].kind,
            RelationKind::OwningReference
        );
    }

    #[test]
    fn test_exclusions_extend_managed_columns() {
        let excluded = resources().exclude("status").excluded_attributes();
        assert!(excluded.contains("id"));
        assert!(excluded.contains("updated_at"));
        assert!(excluded.contains("status"));
        assert!(!excluded.contains("name"));
    }

    #[test]
    fn test_transformers_are_exposed() {
        let capability = resources().with_transformer("name", |value, _| match value {
            Value::Text(name) => Value::Text(name.to_uppercase()),
            other => other.clone(),
        });
        let transformers = capability.attribute_transformers();
        let entity = resource(Value::Integer(1));
        let transformed = transformers["name"](entity.value("name"), &entity);
        assert_eq!(transformed, Value::from("TEST RESOURCE"));
    }
}
