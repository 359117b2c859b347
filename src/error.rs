// ABOUTME: Error taxonomy for entity graph replication
// ABOUTME: Every failure aborts the sync session and rolls both stores back

use crate::entity::EntityId;
use thiserror::Error;

/// Result type for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors raised while configuring or running a sync session.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// Missing store identifiers, non-positive batch size, or an invalid entity declaration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The entity type has no registered syncable capability.
    #[error("entity type '{entity_type}' is not registered as syncable")]
    Capability {
        /// Requested entity type.
        entity_type: String,
    },

    /// The eligibility predicate rejected the entity.
    #[error("{entity_type} {id} is not eligible for synchronization")]
    IneligibleEntity {
        /// Entity type.
        entity_type: String,
        /// Source identifier.
        id: EntityId,
    },

    /// An owning reference points at a row that does not exist in the source store.
    #[error(
        "parent {parent_type} {parent_id} referenced by {entity_type} {id} through '{foreign_key}' not found"
    )]
    MissingParent {
        /// Type of the entity holding the foreign key.
        entity_type: String,
        /// Source identifier of the entity holding the foreign key.
        id: EntityId,
        /// Foreign key attribute.
        foreign_key: String,
        /// Referenced entity type.
        parent_type: String,
        /// Referenced source identifier.
        parent_id: EntityId,
    },

    /// The identifier mapper has no entry for the key.
    #[error("No mapping found for table '{entity_type}' with source ID '{source_id}'")]
    MappingNotFound {
        /// Entity type.
        entity_type: String,
        /// Source identifier.
        source_id: EntityId,
    },

    /// A row looked up by identifier does not exist.
    #[error("{entity_type} {id} not found in store '{store}'")]
    EntityNotFound {
        /// Store name.
        store: String,
        /// Entity type.
        entity_type: String,
        /// Identifier that was looked up.
        id: EntityId,
    },

    /// A confirmed mapping points at a target row that no longer exists.
    #[error("{entity_type} {source_id} is mapped to {target_id}, which no longer exists in the target store")]
    StaleMapping {
        /// Entity type.
        entity_type: String,
        /// Source identifier.
        source_id: EntityId,
        /// Mapped target identifier.
        target_id: EntityId,
    },

    /// A value does not fit the attribute schema.
    #[error("attribute '{attribute}' of {entity_type}: {message}")]
    Attribute {
        /// Entity type.
        entity_type: String,
        /// Attribute name.
        attribute: String,
        /// What went wrong.
        message: String,
    },

    /// A store adapter failed (connectivity, constraint violation, ...).
    #[error("store '{store}' failed: {source:#}")]
    Store {
        /// Store name.
        store: String,
        /// Adapter error, unchanged.
        #[source]
        source: anyhow::Error,
    },
}

impl ReplicationError {
    /// Builds a closure that wraps an adapter error for the named store.
    ///
    /// Replication errors raised inside an adapter (attribute coercion) come
    /// back out as themselves.
    pub fn store(store: &str) -> impl FnOnce(anyhow::Error) -> Self + '_ {
        move |source| match source.downcast::<ReplicationError>() {
            Ok(err) => err,
            Err(source) => Self::Store {
                store: store.to_string(),
                source,
            },
        }
    }

    /// Creates an attribute error.
    pub fn attribute(
        entity_type: impl Into<String>,
        attribute: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Attribute {
            entity_type: entity_type.into(),
            attribute: attribute.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_not_found_message() {
        let err = ReplicationError::MappingNotFound {
            entity_type: "unknown_table".to_string(),
            source_id: EntityId::from(1),
        };
        assert_eq!(
            err.to_string(),
            "No mapping found for table 'unknown_table' with source ID '1'"
        );
    }

    #[test]
    fn store_errors_keep_their_source() {
        let err = ReplicationError::store("target")(anyhow::anyhow!("connection reset"));
        assert!(err.to_string().contains("target"));
        assert!(err.to_string().contains("connection reset"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn adapter_raised_replication_errors_are_unwrapped() {
        let inner = ReplicationError::attribute("organizations", "name", "expected string, got json");
        let err = ReplicationError::store("target")(anyhow::Error::new(inner));
        assert!(matches!(err, ReplicationError::Attribute { .. }));
    }

    #[test]
    fn missing_parent_names_the_dangling_key() {
        let err = ReplicationError::MissingParent {
            entity_type: "resources".to_string(),
            id: EntityId::from(1),
            foreign_key: "organization_id".to_string(),
            parent_type: "organizations".to_string(),
            parent_id: EntityId::from(999999),
        };
        assert!(err.to_string().contains("999999"));
        assert!(err.to_string().contains("organization_id"));
    }
}
