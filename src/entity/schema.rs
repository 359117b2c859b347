// ABOUTME: Declared attribute schema per entity type
// ABOUTME: Attribute sets are declared up front, never discovered from rows

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use super::value::Value;
use super::Attributes;
use crate::error::{ReplicationError, Result};

/// Declared type of an attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributeType {
    #[serde(alias = "text")]
    String,
    #[serde(alias = "int", alias = "number")]
    Integer,
    #[serde(alias = "real", alias = "decimal")]
    Float,
    #[serde(alias = "bool")]
    Boolean,
    #[serde(alias = "datetime")]
    Timestamp,
    #[serde(alias = "structured")]
    Json,
    Uuid,
}

impl fmt::Display for AttributeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AttributeType::String => "string",
            AttributeType::Integer => "integer",
            AttributeType::Float => "float",
            AttributeType::Boolean => "boolean",
            AttributeType::Timestamp => "timestamp",
            AttributeType::Json => "json",
            AttributeType::Uuid => "uuid",
        };
        f.write_str(name)
    }
}

/// Value a store assigns to an attribute the insert did not provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefaultValue {
    /// Fresh timestamp at write time.
    #[serde(alias = "current_timestamp")]
    Now,
    /// Freshly generated v4 UUID.
    Uuid,
}

impl DefaultValue {
    fn generate(self) -> Value {
        match self {
            DefaultValue::Now => Value::Timestamp(Utc::now()),
            DefaultValue::Uuid => Value::Text(uuid::Uuid::new_v4().to_string()),
        }
    }
}

/// Type and default of one attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributeSpec {
    pub ty: AttributeType,
    pub default: Option<DefaultValue>,
}

impl AttributeSpec {
    pub fn new(ty: AttributeType) -> Self {
        Self { ty, default: None }
    }

    pub fn with_default(mut self, default: DefaultValue) -> Self {
        self.default = Some(default);
        self
    }
}

/// How a store assigns primary keys for this entity type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyKind {
    /// Store-assigned auto-increment integer.
    #[default]
    Integer,
    /// Adapter-generated v4 UUID.
    Uuid,
}

/// Primary key column assumed for entity types without a declared schema.
pub const DEFAULT_PRIMARY_KEY: &str = "id";

/// Schema of one entity type (one table).
#[derive(Debug, Clone, PartialEq)]
pub struct EntitySchema {
    /// Entity type name; also the table name in SQL stores.
    pub entity_type: String,
    pub primary_key: String,
    pub key_kind: KeyKind,
    /// `(created_at, updated_at)` columns managed by the store, if any.
    pub timestamps: Option<(String, String)>,
    pub attributes: BTreeMap<String, AttributeSpec>,
}

impl EntitySchema {
    /// Creates a schema with an integer `id` key and no attributes.
    pub fn new(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            primary_key: DEFAULT_PRIMARY_KEY.to_string(),
            key_kind: KeyKind::Integer,
            timestamps: None,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_primary_key(mut self, primary_key: impl Into<String>, kind: KeyKind) -> Self {
        self.primary_key = primary_key.into();
        self.key_kind = kind;
        self
    }

    /// Declares `created_at` / `updated_at` timestamps, filled by the store on write.
    pub fn with_timestamps(mut self) -> Self {
        let created = "created_at".to_string();
        let updated = "updated_at".to_string();
        let spec = AttributeSpec::new(AttributeType::Timestamp).with_default(DefaultValue::Now);
        self.attributes.insert(created.clone(), spec);
        self.attributes.insert(updated.clone(), spec);
        self.timestamps = Some((created, updated));
        self
    }

    pub fn attribute(mut self, name: impl Into<String>, ty: AttributeType) -> Self {
        self.attributes.insert(name.into(), AttributeSpec::new(ty));
        self
    }

    pub fn attribute_with_default(
        mut self,
        name: impl Into<String>,
        ty: AttributeType,
        default: DefaultValue,
    ) -> Self {
        self.attributes
            .insert(name.into(), AttributeSpec::new(ty).with_default(default));
        self
    }

    pub fn spec(&self, attribute: &str) -> Option<&AttributeSpec> {
        self.attributes.get(attribute)
    }

    pub fn has_attribute(&self, attribute: &str) -> bool {
        self.attributes.contains_key(attribute)
    }

    /// Attribute names in declaration order (sorted).
    pub fn attribute_names(&self) -> impl Iterator<Item = &str> {
        self.attributes.keys().map(|s| s.as_str())
    }

    /// Columns the target store owns: the primary key and audit timestamps.
    pub fn store_managed_columns(&self) -> BTreeSet<String> {
        let mut columns = BTreeSet::new();
        columns.insert(self.primary_key.clone());
        if let Some((created, updated)) = &self.timestamps {
            columns.insert(created.clone());
            columns.insert(updated.clone());
        }
        columns
    }

    /// Type-checks `attributes` against the schema, rejecting undeclared names.
    pub fn coerce(&self, attributes: Attributes) -> Result<Attributes> {
        attributes
            .into_iter()
            .map(|(name, value)| {
                let spec = self.spec(&name).ok_or_else(|| {
                    ReplicationError::attribute(&self.entity_type, &name, "attribute is not declared")
                })?;
                let value = value
                    .coerce(spec.ty)
                    .map_err(|msg| ReplicationError::attribute(&self.entity_type, &name, msg))?;
                Ok((name, value))
            })
            .collect()
    }

    /// Prepares attributes for an insert: coerces them and fills store defaults
    /// for every declared attribute the caller left out.
    pub fn prepare_insert(&self, attributes: Attributes) -> Result<Attributes> {
        let mut attributes = self.coerce(attributes)?;
        for (name, spec) in &self.attributes {
            if let Some(default) = spec.default {
                if attributes.get(name).map_or(true, Value::is_null) {
                    attributes.insert(name.clone(), default.generate());
                }
            }
        }
        Ok(attributes)
    }

    /// Prepares attributes for an update: coerces them and touches `updated_at`.
    pub fn prepare_update(&self, attributes: Attributes) -> Result<Attributes> {
        let mut attributes = self.coerce(attributes)?;
        if let Some((_, updated)) = &self.timestamps {
            attributes.insert(updated.clone(), Value::Timestamp(Utc::now()));
        }
        Ok(attributes)
    }

    /// Generates a key for adapters that assign UUID keys themselves.
    pub fn generate_key(&self) -> Option<super::EntityId> {
        match self.key_kind {
            KeyKind::Integer => None,
            KeyKind::Uuid => Some(super::EntityId::from(uuid::Uuid::new_v4())),
        }
    }
}
