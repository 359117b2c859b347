// ABOUTME: SqliteStore - EntityStore backed by a SQLite database file
// ABOUTME: Booleans as integers, timestamps as RFC 3339 text, JSON as text

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, OpenFlags};
use std::collections::HashMap;

use super::{
    entity_from_row, key_from_value, prepare_filters, EntityStore, Filter, StoreOptions,
    TransactionMode,
};
use crate::entity::{Attributes, Entity, EntityId, EntitySchema, KeyKind, Value};
use crate::utils::quote_ident;

/// Entity store on a SQLite database.
pub struct SqliteStore {
    name: String,
    conn: Connection,
    mode: Option<TransactionMode>,
}

impl SqliteStore {
    /// Opens (or creates) the database at `path`. `:memory:` opens a private in-memory database.
    pub fn open(path: &str, options: &StoreOptions) -> Result<Self> {
        tracing::debug!("Opening SQLite store: {}", path);
        let conn = if path == ":memory:" {
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?
        } else {
            Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
            )
            .with_context(|| format!("Failed to open SQLite database '{}'", path))?
        };
        Self::from_connection(path, conn, options)
    }

    /// Wraps an existing connection.
    pub fn from_connection(name: &str, conn: Connection, options: &StoreOptions) -> Result<Self> {
        conn.busy_timeout(options.timeout)
            .context("Failed to set SQLite busy timeout")?;
        Ok(Self {
            name: name.to_string(),
            conn,
            mode: None,
        })
    }

    /// Underlying connection, for fixtures and schema setup.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.mode == Some(TransactionMode::ReadOnly) {
            bail!("SQLite store '{}' is inside a read-only transaction", self.name);
        }
        Ok(())
    }

    fn select_columns(schema: &EntitySchema) -> Vec<String> {
        std::iter::once(schema.primary_key.as_str())
            .chain(schema.attribute_names())
            .map(quote_ident)
            .collect()
    }

    fn query_entities(
        &self,
        schema: &EntitySchema,
        where_clause: &str,
        params: Vec<SqlValue>,
    ) -> Result<Vec<Entity>> {
        let names: Vec<&str> = schema.attribute_names().collect();
        let query = format!(
            "SELECT {} FROM {}{} ORDER BY {}",
            Self::select_columns(schema).join(", "),
            quote_ident(&schema.entity_type),
            where_clause,
            quote_ident(&schema.primary_key)
        );

        let mut stmt = self
            .conn
            .prepare(&query)
            .with_context(|| format!("Failed to prepare query on '{}'", schema.entity_type))?;

        let rows: Vec<(Value, HashMap<String, Value>)> = stmt
            .query_map(params_from_iter(params), |row| {
                let key = from_sql(row.get::<_, SqlValue>(0)?);
                let mut row_map = HashMap::new();
                for (idx, name) in names.iter().enumerate() {
                    let value: SqlValue = row.get(idx + 1)?;
                    row_map.insert(name.to_string(), from_sql(value));
                }
                Ok((key, row_map))
            })
            .with_context(|| format!("Failed to query '{}'", schema.entity_type))?
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("Failed to read rows from '{}'", schema.entity_type))?;

        rows.into_iter()
            .map(|(key, row_map)| {
                let id = key_from_value(schema, &key)?;
                entity_from_row(schema, id, row_map)
            })
            .collect()
    }
}

/// Converts an attribute value into its SQLite storage form.
pub fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Boolean(b) => SqlValue::Integer(i64::from(*b)),
        Value::Integer(i) => SqlValue::Integer(*i),
        Value::Float(f) => SqlValue::Real(*f),
        Value::Text(s) => SqlValue::Text(s.clone()),
        Value::Timestamp(ts) => SqlValue::Text(ts.to_rfc3339()),
        Value::Json(json) => SqlValue::Text(json.to_string()),
    }
}

/// Converts a SQLite value into a loosely typed attribute value.
///
/// The schema coerces it to the declared type afterwards.
pub fn from_sql(value: SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(i) => Value::Integer(i),
        SqlValue::Real(f) => Value::Float(f),
        SqlValue::Text(s) => Value::Text(s),
        SqlValue::Blob(bytes) => Value::Text(String::from_utf8_lossy(&bytes).into_owned()),
    }
}

fn key_to_sql(id: &EntityId) -> SqlValue {
    match id {
        EntityId::Int(i) => SqlValue::Integer(*i),
        EntityId::Text(s) => SqlValue::Text(s.clone()),
    }
}

#[async_trait]
impl EntityStore for SqliteStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn find(&mut self, schema: &EntitySchema, id: &EntityId) -> Result<Option<Entity>> {
        let where_clause = format!(" WHERE {} = ?", quote_ident(&schema.primary_key));
        let mut found = self.query_entities(schema, &where_clause, vec![key_to_sql(id)])?;
        Ok(found.pop())
    }

    async fn exists(
        &mut self,
        entity_type: &str,
        primary_key: &str,
        id: &EntityId,
    ) -> Result<bool> {
        let query = format!(
            "SELECT EXISTS(SELECT 1 FROM {} WHERE {} = ?)",
            quote_ident(entity_type),
            quote_ident(primary_key)
        );
        let found: i64 = self
            .conn
            .query_row(&query, [key_to_sql(id)], |row| row.get(0))
            .with_context(|| format!("Failed to look up {}#{}", entity_type, id))?;
        Ok(found != 0)
    }

    async fn find_where(
        &mut self,
        schema: &EntitySchema,
        filters: &[Filter],
    ) -> Result<Vec<Entity>> {
        let filters = prepare_filters(schema, filters)?;
        let mut clauses = Vec::with_capacity(filters.len());
        let mut params = Vec::with_capacity(filters.len());
        for filter in &filters {
            if filter.value.is_null() {
                clauses.push(format!("{} IS NULL", quote_ident(&filter.attribute)));
            } else {
                clauses.push(format!("{} = ?", quote_ident(&filter.attribute)));
                params.push(to_sql(&filter.value));
            }
        }
        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };
        self.query_entities(schema, &where_clause, params)
    }

    async fn create(&mut self, schema: &EntitySchema, attributes: Attributes) -> Result<Entity> {
        self.ensure_writable()?;
        let prepared = schema.prepare_insert(attributes)?;

        let mut columns = Vec::with_capacity(prepared.len() + 1);
        let mut params = Vec::with_capacity(prepared.len() + 1);
        let generated = schema.generate_key();
        if let Some(key) = &generated {
            columns.push(quote_ident(&schema.primary_key));
            params.push(key_to_sql(key));
        }
        for (name, value) in &prepared {
            columns.push(quote_ident(name));
            params.push(to_sql(value));
        }

        let table = quote_ident(&schema.entity_type);
        let query = if columns.is_empty() {
            format!("INSERT INTO {} DEFAULT VALUES", table)
        } else {
            format!(
                "INSERT INTO {} ({}) VALUES ({})",
                table,
                columns.join(", "),
                vec!["?"; columns.len()].join(", ")
            )
        };

        self.conn
            .execute(&query, params_from_iter(params))
            .with_context(|| format!("Failed to insert into '{}'", schema.entity_type))?;

        let id = match (schema.key_kind, generated) {
            (KeyKind::Uuid, Some(key)) => key,
            _ => EntityId::Int(self.conn.last_insert_rowid()),
        };
        tracing::debug!("Inserted {}#{} into '{}'", schema.entity_type, id, self.name);

        self.find(schema, &id).await?.with_context(|| {
            format!(
                "Row {}#{} vanished right after insert",
                schema.entity_type, id
            )
        })
    }

    async fn save(&mut self, schema: &EntitySchema, entity: &Entity) -> Result<()> {
        self.ensure_writable()?;
        let prepared = schema.prepare_update(entity.attributes().clone())?;
        if prepared.is_empty() {
            return Ok(());
        }

        let mut assignments = Vec::with_capacity(prepared.len());
        let mut params = Vec::with_capacity(prepared.len() + 1);
        for (name, value) in &prepared {
            assignments.push(format!("{} = ?", quote_ident(name)));
            params.push(to_sql(value));
        }
        params.push(key_to_sql(entity.id()));

        let query = format!(
            "UPDATE {} SET {} WHERE {} = ?",
            quote_ident(&schema.entity_type),
            assignments.join(", "),
            quote_ident(&schema.primary_key)
        );
        let updated = self
            .conn
            .execute(&query, params_from_iter(params))
            .with_context(|| format!("Failed to update {}", entity.label()))?;
        if updated == 0 {
            bail!("Cannot save {}: row does not exist", entity.label());
        }
        Ok(())
    }

    async fn count(&mut self, schema: &EntitySchema) -> Result<u64> {
        let query = format!("SELECT COUNT(*) FROM {}", quote_ident(&schema.entity_type));
        let count: i64 = self
            .conn
            .query_row(&query, [], |row| row.get(0))
            .with_context(|| format!("Failed to count rows in table '{}'", schema.entity_type))?;
        Ok(count as u64)
    }

    async fn begin_transaction(&mut self, mode: TransactionMode) -> Result<()> {
        if self.mode.is_some() {
            bail!("SQLite store '{}' already has a transaction open", self.name);
        }
        let sql = match mode {
            TransactionMode::ReadOnly => "BEGIN DEFERRED; PRAGMA query_only = ON;",
            TransactionMode::ReadWrite => "BEGIN IMMEDIATE;",
        };
        self.conn
            .execute_batch(sql)
            .with_context(|| format!("Failed to begin transaction on '{}'", self.name))?;
        self.mode = Some(mode);
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        if self.mode.take().is_none() {
            bail!("SQLite store '{}' has no transaction open", self.name);
        }
        self.conn
            .execute_batch("COMMIT; PRAGMA query_only = OFF;")
            .with_context(|| format!("Failed to commit transaction on '{}'", self.name))
    }

    async fn rollback(&mut self) -> Result<()> {
        if self.mode.take().is_none() {
            bail!("SQLite store '{}' has no transaction open", self.name);
        }
        self.conn
            .execute_batch("ROLLBACK; PRAGMA query_only = OFF;")
            .with_context(|| format!("Failed to roll back transaction on '{}'", self.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::AttributeType;
    use serde_json::json;

    fn store() -> SqliteStore {
        let store = SqliteStore::open(":memory:", &StoreOptions::default()).unwrap();
        store
            .connection()
            .execute_batch(
                "CREATE TABLE organizations (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    is_active INTEGER,
                    metadata TEXT,
                    created_at TEXT,
                    updated_at TEXT
                );
                CREATE TABLE devices (
                    id TEXT PRIMARY KEY,
                    label TEXT
                );",
            )
            .unwrap();
        store
    }

    fn organizations() -> EntitySchema {
        EntitySchema::new("organizations")
            .with_timestamps()
            .attribute("name", AttributeType::String)
            .attribute("is_active", AttributeType::Boolean)
            .attribute("metadata", AttributeType::Json)
    }

    #[tokio::test]
    async fn test_create_and_find_round_trips_types() {
        let mut store = store();
        let schema = organizations();
        let mut attrs = Attributes::new();
        attrs.insert("name".into(), Value::from("Test Organization"));
        attrs.insert("is_active".into(), Value::Boolean(true));
        attrs.insert("metadata".into(), Value::Json(json!({"tier": "gold"})));

        let created = store.create(&schema, attrs).await.unwrap();
        assert_eq!(created.id(), &EntityId::Int(1));
        assert_eq!(created.value("is_active"), &Value::Boolean(true));
        assert_eq!(created.value("metadata"), &Value::Json(json!({"tier": "gold"})));
        assert!(matches!(created.value("created_at"), Value::Timestamp(_)));

        let found = store.find(&schema, created.id()).await.unwrap().unwrap();
        assert_eq!(found, created);
        assert!(store
            .find(&schema, &EntityId::Int(42))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_exists_without_declared_schema() {
        let mut store = store();
        store
            .connection()
            .execute("INSERT INTO devices (id, label) VALUES ('abc', 'sensor')", [])
            .unwrap();

        assert!(store
            .exists("devices", "id", &EntityId::Text("abc".into()))
            .await
            .unwrap());
        assert!(!store
            .exists("devices", "id", &EntityId::Text("xyz".into()))
            .await
            .unwrap());
        assert!(!store
            .exists("organizations", "id", &EntityId::Int(1))
            .await
            .unwrap());
        assert!(store
            .exists("countries", "id", &EntityId::Int(1))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_uuid_keys() {
        let mut store = store();
        let schema = EntitySchema::new("devices")
            .with_primary_key("id", KeyKind::Uuid)
            .attribute("label", AttributeType::String);
        let mut attrs = Attributes::new();
        attrs.insert("label".into(), Value::from("sensor"));

        let created = store.create(&schema, attrs).await.unwrap();
        assert!(matches!(created.id(), EntityId::Text(id) if id.len() == 36));
    }

    #[tokio::test]
    async fn test_rollback_discards_insert() {
        let mut store = store();
        let schema = organizations();
        store
            .begin_transaction(TransactionMode::ReadWrite)
            .await
            .unwrap();
        let mut attrs = Attributes::new();
        attrs.insert("name".into(), Value::from("Discarded"));
        store.create(&schema, attrs).await.unwrap();
        store.rollback().await.unwrap();

        assert_eq!(store.count(&schema).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_read_only_transaction_refuses_writes() {
        let mut store = store();
        let schema = organizations();
        store
            .begin_transaction(TransactionMode::ReadOnly)
            .await
            .unwrap();
        let mut attrs = Attributes::new();
        attrs.insert("name".into(), Value::from("Nope"));
        assert!(store.create(&schema, attrs).await.is_err());
        store.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_find_where_null_filter() {
        let mut store = store();
        let schema = organizations();
        for (name, active) in [("Acme", Value::Boolean(true)), ("Globex", Value::Null)] {
            let mut attrs = Attributes::new();
            attrs.insert("name".into(), Value::from(name));
            attrs.insert("is_active".into(), active);
            store.create(&schema, attrs).await.unwrap();
        }

        let unknown = store
            .find_where(&schema, &[Filter::new("is_active", Value::Null)])
            .await
            .unwrap();
        assert_eq!(unknown.len(), 1);
        assert_eq!(unknown[0].value("name"), &Value::from("Globex"));

        let active = store
            .find_where(&schema, &[Filter::new("is_active", true)])
            .await
            .unwrap();
        assert_eq!(active.len(), 1);
    }

    #[test]
    fn test_value_conversion() {
        assert_eq!(to_sql(&Value::Boolean(true)), SqlValue::Integer(1));
        assert_eq!(
            to_sql(&Value::Json(json!([1, 2]))),
            SqlValue::Text("[1,2]".to_string())
        );
        assert_eq!(from_sql(SqlValue::Real(1.5)), Value::Float(1.5));
        assert_eq!(from_sql(SqlValue::Null), Value::Null);
    }
}
