// ABOUTME: Entity records identified by (entity type, primary key)
// ABOUTME: Re-exports values, identifiers and schema declarations

pub mod schema;
pub mod value;

pub use schema::{
    AttributeSpec, AttributeType, DefaultValue, EntitySchema, KeyKind, DEFAULT_PRIMARY_KEY,
};
pub use value::{EntityId, Value};

use serde::Serialize;
use std::collections::BTreeMap;

/// Attribute name to value. The primary key is kept out of this map.
pub type Attributes = BTreeMap<String, Value>;

/// A persisted record in one store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Entity {
    entity_type: String,
    id: EntityId,
    attributes: Attributes,
}

impl Entity {
    pub fn new(entity_type: impl Into<String>, id: EntityId, attributes: Attributes) -> Self {
        Self {
            entity_type: entity_type.into(),
            id,
            attributes,
        }
    }

    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    pub fn id(&self) -> &EntityId {
        &self.id
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    /// Attribute value; absent attributes read as `None`.
    pub fn get(&self, attribute: &str) -> Option<&Value> {
        self.attributes.get(attribute)
    }

    /// Attribute value, treating absent attributes as NULL.
    pub fn value(&self, attribute: &str) -> &Value {
        self.attributes.get(attribute).unwrap_or(&Value::Null)
    }

    pub fn set(&mut self, attribute: impl Into<String>, value: impl Into<Value>) {
        self.attributes.insert(attribute.into(), value.into());
    }

    /// `"organizations#5"`, for logs.
    pub fn label(&self) -> String {
        format!("{}#{}", self.entity_type, self.id)
    }
}
