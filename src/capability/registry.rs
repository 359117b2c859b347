// ABOUTME: CapabilityRegistry - entity type name to Syncable capability
// ABOUTME: The engine only copies entity types registered here

use std::collections::HashMap;
use std::sync::Arc;

use super::{DeclaredEntity, Syncable};
use crate::config::ReplicatorConfig;
use crate::error::{ReplicationError, Result};

/// Registered syncable entity types.
#[derive(Clone, Default)]
pub struct CapabilityRegistry {
    capabilities: HashMap<String, Arc<dyn Syncable>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a registry from the entity declarations of a configuration.
    pub fn from_config(config: &ReplicatorConfig) -> Result<Self> {
        let mut registry = Self::new();
        for (entity_type, definition) in &config.entities {
            registry.register(DeclaredEntity::from_definition(entity_type, definition)?);
        }
        Ok(registry)
    }

    /// Registers a capability under its entity type, replacing any previous one.
    pub fn register(&mut self, capability: impl Syncable + 'static) -> &mut Self {
        self.register_arc(Arc::new(capability))
    }

    pub fn register_arc(&mut self, capability: Arc<dyn Syncable>) -> &mut Self {
        self.capabilities
            .insert(capability.entity_type().to_string(), capability);
        self
    }

    pub fn get(&self, entity_type: &str) -> Option<Arc<dyn Syncable>> {
        self.capabilities.get(entity_type).cloned()
    }

    /// Like `get`, but fails with a capability error for unregistered types.
    pub fn require(&self, entity_type: &str) -> Result<Arc<dyn Syncable>> {
        self.get(entity_type)
            .ok_or_else(|| ReplicationError::Capability {
                entity_type: entity_type.to_string(),
            })
    }

    pub fn contains(&self, entity_type: &str) -> bool {
        self.capabilities.contains_key(entity_type)
    }

    /// Registered entity types, sorted.
    pub fn entity_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.capabilities.keys().map(|s| s.as_str()).collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }
}

impl std::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("entity_types", &self.entity_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{AttributeType, EntitySchema};

    #[test]
    fn test_require_unregistered_type_fails() {
        let mut registry = CapabilityRegistry::new();
        registry.register(DeclaredEntity::new(
            EntitySchema::new("organizations").attribute("name", AttributeType::String),
        ));

        assert!(registry.contains("organizations"));
        assert!(registry.require("organizations").is_ok());
        match registry.require("invoices") {
            Err(ReplicationError::Capability { entity_type }) => {
                assert_eq!(entity_type, "invoices")
            }
            other => panic!("expected capability error, got {:?}", other.map(|_| ())),
        }
    }
}
