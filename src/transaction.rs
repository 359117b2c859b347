// ABOUTME: TransactionCoordinator - one transaction pair across source and target stores
// ABOUTME: Commits both only after a full traversal; rolls both back on any failure

use crate::error::{ReplicationError, Result};
use crate::store::{EntityStore, TransactionMode};

/// Owns the source and target stores of a sync session.
pub struct TransactionCoordinator {
    source: Box<dyn EntityStore>,
    target: Box<dyn EntityStore>,
    active: bool,
}

impl TransactionCoordinator {
    pub fn new(source: Box<dyn EntityStore>, target: Box<dyn EntityStore>) -> Self {
        Self {
            source,
            target,
            active: false,
        }
    }

    pub fn source(&mut self) -> &mut dyn EntityStore {
        self.source.as_mut()
    }

    pub fn target(&mut self) -> &mut dyn EntityStore {
        self.target.as_mut()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Begins a read-only transaction on the source and a read-write one on the target.
    pub async fn begin(&mut self) -> Result<()> {
        let source_name = self.source.name().to_string();
        let target_name = self.target.name().to_string();

        self.source
            .begin_transaction(TransactionMode::ReadOnly)
            .await
            .map_err(ReplicationError::store(&source_name))?;

        if let Err(e) = self
            .target
            .begin_transaction(TransactionMode::ReadWrite)
            .await
        {
            if let Err(rollback_err) = self.source.rollback().await {
                tracing::warn!(
                    "Failed to roll back source '{}' after target begin failed: {:#}",
                    source_name,
                    rollback_err
                );
            }
            return Err(ReplicationError::store(&target_name)(e));
        }

        self.active = true;
        tracing::debug!(
            "Began transactions on '{}' (read-only) and '{}'",
            source_name,
            target_name
        );
        Ok(())
    }

    /// Commits the source, then the target.
    pub async fn commit(&mut self) -> Result<()> {
        self.active = false;
        let source_name = self.source.name().to_string();
        let target_name = self.target.name().to_string();

        if let Err(e) = self.source.commit().await {
            if let Err(rollback_err) = self.target.rollback().await {
                tracing::warn!(
                    "Failed to roll back target '{}' after source commit failed: {:#}",
                    target_name,
                    rollback_err
                );
            }
            return Err(ReplicationError::store(&source_name)(e));
        }
        self.target
            .commit()
            .await
            .map_err(ReplicationError::store(&target_name))?;
        tracing::debug!("Committed transactions on '{}' and '{}'", source_name, target_name);
        Ok(())
    }

    /// Rolls both stores back.
    ///
    /// Failures are logged, never returned, so the error that caused the
    /// rollback is the one the caller sees.
    pub async fn rollback(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;

        if let Err(e) = self.target.rollback().await {
            tracing::warn!(
                "Failed to roll back target '{}': {:#}",
                self.target.name(),
                e
            );
        }
        if let Err(e) = self.source.rollback().await {
            tracing::warn!(
                "Failed to roll back source '{}': {:#}",
                self.source.name(),
                e
            );
        }
        tracing::info!("Rolled back transactions on both stores");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{AttributeType, Attributes, EntitySchema, Value};
    use crate::store::MemoryStore;

    fn schema() -> EntitySchema {
        EntitySchema::new("organizations").attribute("name", AttributeType::String)
    }

    fn named(name: &str) -> Attributes {
        let mut attrs = Attributes::new();
        attrs.insert("name".to_string(), Value::from(name));
        attrs
    }

    #[tokio::test]
    async fn test_commit_keeps_target_writes() {
        let source = MemoryStore::new("source");
        let target = MemoryStore::new("target");
        let mut tx = TransactionCoordinator::new(Box::new(source), Box::new(target.clone()));

        tx.begin().await.unwrap();
        assert!(tx.is_active());
        tx.target().create(&schema(), named("Acme")).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(target.row_count("organizations").unwrap(), 1);
        assert!(!tx.is_active());
    }

    #[tokio::test]
    async fn test_rollback_discards_target_writes() {
        let source = MemoryStore::new("source");
        let target = MemoryStore::new("target");
        let mut tx = TransactionCoordinator::new(Box::new(source), Box::new(target.clone()));

        tx.begin().await.unwrap();
        tx.target().create(&schema(), named("Acme")).await.unwrap();
        tx.rollback().await;

        assert_eq!(target.row_count("organizations").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_source_is_read_only() {
        let source = MemoryStore::new("source");
        let mut tx = TransactionCoordinator::new(
            Box::new(source),
            Box::new(MemoryStore::new("target")),
        );

        tx.begin().await.unwrap();
        let err = tx.source().create(&schema(), named("Acme")).await;
        assert!(err.is_err());
        tx.rollback().await;
    }

    #[tokio::test]
    async fn test_failed_target_begin_releases_source() {
        let source = MemoryStore::new("source");
        let target = MemoryStore::new("target");
        let mut blocked = target.clone();
        blocked
            .begin_transaction(TransactionMode::ReadWrite)
            .await
            .unwrap();

        let mut tx = TransactionCoordinator::new(Box::new(source.clone()), Box::new(target));
        let err = tx.begin().await.unwrap_err();
        assert!(matches!(err, ReplicationError::Store { ref store, .. } if store == "target"));
        assert!(!tx.is_active());

        // The source transaction was rolled back, so a new one can start.
        let mut source = source;
        source
            .begin_transaction(TransactionMode::ReadOnly)
            .await
            .unwrap();
    }
}
