// ABOUTME: ReplicatorConfig - TOML configuration for stores and entity declarations
// ABOUTME: Validation raises configuration errors before any store is touched

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;

use crate::capability::RelationKind;
use crate::entity::{AttributeType, DefaultValue, EntitySchema, KeyKind, Value};
use crate::error::{ReplicationError, Result};
use crate::utils::validate_identifier;

pub const DEFAULT_BATCH_SIZE: i64 = 100;
pub const DEFAULT_TIMEOUT_SECS: u64 = 600;

fn default_batch_size() -> i64 {
    DEFAULT_BATCH_SIZE
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_exclude_columns() -> Vec<String> {
    vec![
        "created_at".to_string(),
        "updated_at".to_string(),
        "deleted_at".to_string(),
    ]
}

fn default_primary_key() -> String {
    "id".to_string()
}

/// Top-level replication configuration.
///
/// ```toml
/// source = "sqlite:staging.db"
/// target = "sqlite:production.db"
///
/// [entities.organizations]
/// timestamps = true
/// attributes = { name = "string", is_active = "boolean" }
///
/// [entities.organizations.relations.resources]
/// kind = "owned_many"
/// related = "resources"
/// foreign_key = "organization_id"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReplicatorConfig {
    /// Source store identifier (URL or path)
    #[serde(default)]
    pub source: String,
    /// Target store identifier (URL or path)
    #[serde(default)]
    pub target: String,
    /// Reserved for bulk variants; the graph traversal never consults it
    #[serde(default = "default_batch_size")]
    pub batch_size: i64,
    /// Store read/statement timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Columns never copied, merged with per-type exclusions
    #[serde(default = "default_exclude_columns")]
    pub exclude_columns: Vec<String>,
    /// Syncable entity types, keyed by entity type (table) name
    #[serde(default)]
    pub entities: BTreeMap<String, EntityDefinition>,
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self {
            source: String::new(),
            target: String::new(),
            batch_size: DEFAULT_BATCH_SIZE,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            exclude_columns: default_exclude_columns(),
            entities: BTreeMap::new(),
        }
    }
}

/// Declaration of one syncable entity type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EntityDefinition {
    #[serde(default = "default_primary_key")]
    pub primary_key: String,
    #[serde(default)]
    pub key: KeyKind,
    /// Whether the store manages `created_at` / `updated_at`
    #[serde(default)]
    pub timestamps: bool,
    #[serde(default)]
    pub attributes: BTreeMap<String, AttributeDefinition>,
    /// Extra attributes never copied
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Relation names not followed
    #[serde(default)]
    pub exclude_relations: Vec<String>,
    /// Entities with a NULL in any of these attributes are ineligible
    #[serde(default)]
    pub require_present: Vec<String>,
    /// Entities whose attributes differ from these values are ineligible
    #[serde(default)]
    pub require_equals: BTreeMap<String, toml::Value>,
    #[serde(default)]
    pub relations: BTreeMap<String, RelationDefinition>,
}

impl Default for EntityDefinition {
    fn default() -> Self {
        Self {
            primary_key: default_primary_key(),
            key: KeyKind::default(),
            timestamps: false,
            attributes: BTreeMap::new(),
            exclude: Vec::new(),
            exclude_relations: Vec::new(),
            require_present: Vec::new(),
            require_equals: BTreeMap::new(),
            relations: BTreeMap::new(),
        }
    }
}

/// Attribute type, either `name = "string"` or `name = { type = "uuid", default = "uuid" }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeDefinition {
    Short(AttributeType),
    Full {
        #[serde(rename = "type")]
        ty: AttributeType,
        #[serde(default)]
        default: Option<DefaultValue>,
    },
}

impl AttributeDefinition {
    pub fn ty(&self) -> AttributeType {
        match self {
            AttributeDefinition::Short(ty) => *ty,
            AttributeDefinition::Full { ty, .. } => *ty,
        }
    }

    pub fn default_value(&self) -> Option<DefaultValue> {
        match self {
            AttributeDefinition::Short(_) => None,
            AttributeDefinition::Full { default, .. } => *default,
        }
    }
}

/// Declaration of one relation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelationDefinition {
    pub kind: RelationKind,
    /// Related entity type
    pub related: String,
    pub foreign_key: String,
    /// Equality conditions on the related entities
    #[serde(default, rename = "where")]
    pub conditions: BTreeMap<String, toml::Value>,
}

impl EntityDefinition {
    /// Builds the attribute schema of this entity type.
    pub fn schema(&self, entity_type: &str) -> EntitySchema {
        let mut schema = EntitySchema::new(entity_type).with_primary_key(&self.primary_key, self.key);
        if self.timestamps {
            schema = schema.with_timestamps();
        }
        for (name, definition) in &self.attributes {
            schema = match definition.default_value() {
                Some(default) => schema.attribute_with_default(name, definition.ty(), default),
                None => schema.attribute(name, definition.ty()),
            };
        }
        schema
    }
}

/// Converts a TOML literal from `where` / `require_equals` into an attribute value.
pub fn toml_to_value(value: &toml::Value) -> Value {
    match value {
        toml::Value::String(s) => Value::Text(s.clone()),
        toml::Value::Integer(i) => Value::Integer(*i),
        toml::Value::Float(f) => Value::Float(*f),
        toml::Value::Boolean(b) => Value::Boolean(*b),
        toml::Value::Datetime(dt) => {
            let raw = dt.to_string();
            crate::entity::value::parse_timestamp(&raw)
                .map(Value::Timestamp)
                .unwrap_or(Value::Text(raw))
        }
        other => serde_json::to_value(other)
            .map(Value::Json)
            .unwrap_or(Value::Null),
    }
}

impl ReplicatorConfig {
    /// Creates a configuration for a store pair with default settings.
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            ..Self::default()
        }
    }

    /// Loads a TOML configuration file. Does not validate.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration from {:?}", path))?;
        let config = Self::from_toml_str(&contents)
            .with_context(|| format!("Failed to parse configuration from {:?}", path))?;
        Ok(config)
    }

    /// Parses a TOML document. Does not validate.
    pub fn from_toml_str(contents: &str) -> anyhow::Result<Self> {
        toml::from_str(contents).context("Invalid replicator configuration")
    }

    /// Overrides the source store identifier.
    pub fn from(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Overrides the target store identifier.
    pub fn to(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    /// Overrides the batch size. Must be positive.
    pub fn with_batch_size(mut self, batch_size: i64) -> Result<Self> {
        check_batch_size(batch_size)?;
        self.batch_size = batch_size;
        Ok(self)
    }

    pub fn with_entity(mut self, entity_type: &str, definition: EntityDefinition) -> Self {
        self.entities.insert(entity_type.to_string(), definition);
        self
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn batch_size(&self) -> i64 {
        self.batch_size
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Globally excluded columns.
    pub fn excluded_columns(&self) -> BTreeSet<String> {
        self.exclude_columns.iter().cloned().collect()
    }

    /// Checks store identifiers, batch size and the entity declarations.
    pub fn validate(&self) -> Result<()> {
        if self.source.trim().is_empty() {
            return Err(ReplicationError::Configuration(
                "Source connection must be configured".to_string(),
            ));
        }
        if self.target.trim().is_empty() {
            return Err(ReplicationError::Configuration(
                "Target connection must be configured".to_string(),
            ));
        }
        check_batch_size(self.batch_size)?;
        if self.timeout_secs == 0 {
            return Err(ReplicationError::Configuration(
                "Timeout must be at least one second".to_string(),
            ));
        }

        for (entity_type, definition) in &self.entities {
            self.validate_entity(entity_type, definition)?;
        }
        Ok(())
    }

    fn validate_entity(&self, entity_type: &str, definition: &EntityDefinition) -> Result<()> {
        let invalid = |msg: String| ReplicationError::Configuration(msg);
        let identifier = |name: &str| {
            validate_identifier(name)
                .map_err(|e| invalid(format!("entity '{}': {}", entity_type, e)))
        };

        identifier(entity_type)?;
        identifier(&definition.primary_key)?;
        let schema = definition.schema(entity_type);
        for name in schema.attribute_names() {
            identifier(name)?;
        }
        if schema.has_attribute(&definition.primary_key) {
            return Err(invalid(format!(
                "entity '{}': primary key '{}' must not be declared as an attribute",
                entity_type, definition.primary_key
            )));
        }

        for name in definition
            .require_present
            .iter()
            .chain(definition.require_equals.keys())
        {
            if !schema.has_attribute(name) {
                return Err(invalid(format!(
                    "entity '{}': eligibility rule uses undeclared attribute '{}'",
                    entity_type, name
                )));
            }
        }

        for (relation_name, relation) in &definition.relations {
            let related = self.entities.get(&relation.related).ok_or_else(|| {
                invalid(format!(
                    "entity '{}': relation '{}' points at undeclared entity type '{}'",
                    entity_type, relation_name, relation.related
                ))
            })?;
            let related_schema = related.schema(&relation.related);
            let (holder, holder_schema) = match relation.kind {
                RelationKind::OwningReference => (entity_type, &schema),
                RelationKind::OwnedSingle | RelationKind::OwnedMany => {
                    (relation.related.as_str(), &related_schema)
                }
            };
            if !holder_schema.has_attribute(&relation.foreign_key) {
                return Err(invalid(format!(
                    "entity '{}': relation '{}' uses foreign key '{}', which '{}' does not declare",
                    entity_type, relation_name, relation.foreign_key, holder
                )));
            }
            for attribute in relation.conditions.keys() {
                if !related_schema.has_attribute(attribute) {
                    return Err(invalid(format!(
                        "entity '{}': relation '{}' filters on undeclared attribute '{}'",
                        entity_type, relation_name, attribute
                    )));
                }
            }
        }
        Ok(())
    }
}

fn check_batch_size(batch_size: i64) -> Result<()> {
    if batch_size <= 0 {
        return Err(ReplicationError::Configuration(
            "Batch size must be a positive integer".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
source = "sqlite:staging.db"
target = "sqlite:production.db"

[entities.organizations]
timestamps = true
attributes = { name = "string", status = "string", is_active = "boolean", metadata = "json", uuid = { type = "uuid", default = "uuid" } }
exclude = ["uuid"]

[entities.organizations.relations.resources]
kind = "has_many"
related = "resources"
foreign_key = "organization_id"

[entities.organizations.relations.location]
kind = "owned_single"
related = "organization_locations"
foreign_key = "organization_id"
where = { is_primary = true }

[entities.resources]
timestamps = true
attributes = { name = "string", organization_id = "integer" }
require_present = ["organization_id"]

[entities.resources.relations.organization]
kind = "belongs_to"
related = "organizations"
foreign_key = "organization_id"

[entities.organization_locations]
attributes = { organization_id = "integer", city = "string", is_primary = "boolean" }
"#;

    #[test]
    fn test_defaults() {
        let config = ReplicatorConfig::default();
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.timeout(), Duration::from_secs(600));
        assert_eq!(
            config.exclude_columns,
            vec!["created_at", "updated_at", "deleted_at"]
        );
    }

    #[test]
    fn test_parse_entity_declarations() {
        let config = ReplicatorConfig::from_toml_str(CONFIG).unwrap();
        config.validate().unwrap();

        let organizations = &config.entities["organizations"];
        let schema = organizations.schema("organizations");
        assert_eq!(schema.primary_key, "id");
        assert!(schema.timestamps.is_some());
        assert_eq!(schema.spec("is_active").unwrap().ty, AttributeType::Boolean);
        assert_eq!(
            schema.spec("uuid").unwrap().default,
            Some(DefaultValue::Uuid)
        );

        let location = &organizations.relations["location"];
        assert_eq!(location.kind, RelationKind::OwnedSingle);
        assert_eq!(
            toml_to_value(&location.conditions["is_primary"]),
            Value::Boolean(true)
        );
        assert_eq!(
            organizations.relations["resources"].kind,
            RelationKind::OwnedMany
        );
    }

    #[test]
    fn test_missing_connections_rejected() {
        let err = ReplicatorConfig::new("", "sqlite:target.db")
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("Source connection must be configured"));

        let err = ReplicatorConfig::new("sqlite:source.db", " ")
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("Target connection must be configured"));
    }

    #[test]
    fn test_batch_size_must_be_positive() {
        let config = ReplicatorConfig::new("a.db", "b.db");
        assert!(config.clone().with_batch_size(0).is_err());
        assert!(config.clone().with_batch_size(-5).is_err());
        assert_eq!(config.with_batch_size(250).unwrap().batch_size(), 250);

        let mut config = ReplicatorConfig::new("a.db", "b.db");
        config.batch_size = 0;
        assert!(matches!(
            config.validate(),
            Err(ReplicationError::Configuration(_))
        ));
    }

    #[test]
    fn test_builder_overrides_connections() {
        let config = ReplicatorConfig::new("a.db", "b.db").from("c.db").to("d.db");
        assert_eq!(config.source(), "c.db");
        assert_eq!(config.target(), "d.db");
    }

    #[test]
    fn test_relation_to_undeclared_type_rejected() {
        let toml = r#"
source = "a.db"
target = "b.db"

[entities.organizations]
attributes = { name = "string" }

[entities.organizations.relations.invoices]
kind = "owned_many"
related = "invoices"
foreign_key = "organization_id"
"#;
        let config = ReplicatorConfig::from_toml_str(toml).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("invoices"));
    }

    #[test]
    fn test_undeclared_foreign_key_rejected() {
        let toml = r#"
source = "a.db"
target = "b.db"

[entities.organizations]
attributes = { name = "string" }

[entities.resources]
attributes = { name = "string" }

[entities.resources.relations.organization]
kind = "owning_reference"
related = "organizations"
foreign_key = "organization_id"
"#;
        let config = ReplicatorConfig::from_toml_str(toml).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("organization_id"));
    }

    #[test]
    fn test_unsafe_identifier_rejected() {
        let toml = r#"
source = "a.db"
target = "b.db"

[entities."users; DROP TABLE users"]
attributes = { name = "string" }
"#;
        let config = ReplicatorConfig::from_toml_str(toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let toml = r#"
source = "a.db"
target = "b.db"
safe_mode = true
"#;
        assert!(ReplicatorConfig::from_toml_str(toml).is_err());
    }
}
