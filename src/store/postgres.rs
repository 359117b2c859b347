// ABOUTME: PostgresStore - EntityStore backed by a PostgreSQL connection
// ABOUTME: Typed placeholders per declared attribute type, INSERT ... RETURNING for keys

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use postgres_native_tls::MakeTlsConnector;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, Row};

use super::{entity_from_row, prepare_filters, EntityStore, Filter, StoreOptions, TransactionMode};
use crate::entity::{AttributeType, Attributes, Entity, EntityId, EntitySchema, KeyKind, Value};
use crate::utils::{quote_ident, strip_password_from_url};

/// Entity store on a PostgreSQL database.
pub struct PostgresStore {
    name: String,
    client: Client,
    mode: Option<TransactionMode>,
}

impl PostgresStore {
    /// Connects over TLS (falling back to plain connections the server allows)
    /// and applies the statement timeout.
    pub async fn connect(url: &str, options: &StoreOptions) -> Result<Self> {
        let name = strip_password_from_url(url).unwrap_or_else(|_| "postgres".to_string());
        tracing::debug!("Connecting to PostgreSQL store: {}", name);

        let tls = native_tls::TlsConnector::builder()
            .build()
            .context("Failed to build TLS connector")?;
        let connector = MakeTlsConnector::new(tls);
        let (client, connection) = tokio_postgres::connect(url, connector)
            .await
            .with_context(|| format!("Failed to connect to {}", name))?;

        let conn_name = name.clone();
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!("Connection to {} closed with error: {}", conn_name, e);
            }
        });

        client
            .batch_execute(&format!(
                "SET statement_timeout = {}",
                options.timeout.as_millis()
            ))
            .await
            .context("Failed to set statement_timeout")?;

        Ok(Self {
            name,
            client,
            mode: None,
        })
    }

    /// Underlying client, for fixtures and schema setup.
    pub fn client(&self) -> &Client {
        &self.client
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.mode == Some(TransactionMode::ReadOnly) {
            bail!(
                "PostgreSQL store '{}' is inside a read-only transaction",
                self.name
            );
        }
        Ok(())
    }

    fn key_cast(schema: &EntitySchema) -> &'static str {
        match schema.key_kind {
            KeyKind::Integer => "BIGINT",
            KeyKind::Uuid => "TEXT",
        }
    }

    fn select_list(schema: &EntitySchema) -> String {
        let mut columns = vec![format!(
            "{}::{}",
            quote_ident(&schema.primary_key),
            Self::key_cast(schema)
        )];
        for (name, spec) in &schema.attributes {
            columns.push(format!("{}::{}", quote_ident(name), read_cast(spec.ty)));
        }
        columns.join(", ")
    }

    async fn query_entities(
        &self,
        schema: &EntitySchema,
        where_clause: &str,
        params: Vec<Box<dyn ToSql + Sync + Send>>,
    ) -> Result<Vec<Entity>> {
        let query = format!(
            "SELECT {} FROM {}{} ORDER BY {}",
            Self::select_list(schema),
            quote_ident(&schema.entity_type),
            where_clause,
            quote_ident(&schema.primary_key)
        );
        let refs: Vec<&(dyn ToSql + Sync)> = params
            .iter()
            .map(|v| v.as_ref() as &(dyn ToSql + Sync))
            .collect();
        let rows = self
            .client
            .query(&query, &refs)
            .await
            .with_context(|| format!("Failed to query '{}'", schema.entity_type))?;

        rows.iter().map(|row| row_to_entity(schema, row)).collect()
    }
}

/// Cast applied when reading a column of the declared type.
fn read_cast(ty: AttributeType) -> &'static str {
    match ty {
        AttributeType::String | AttributeType::Uuid => "TEXT",
        AttributeType::Integer => "BIGINT",
        AttributeType::Float => "DOUBLE PRECISION",
        AttributeType::Boolean => "BOOLEAN",
        AttributeType::Timestamp => "TIMESTAMPTZ",
        AttributeType::Json => "JSONB",
    }
}

/// Cast applied to a bound parameter of the declared type.
fn write_cast(ty: AttributeType) -> &'static str {
    match ty {
        AttributeType::Uuid => "TEXT::UUID",
        other => read_cast(other),
    }
}

/// Binds a value as the Rust type matching its declared attribute type.
///
/// Values have already been coerced by the schema.
fn to_param(value: &Value, ty: AttributeType) -> Result<Box<dyn ToSql + Sync + Send>> {
    let param: Box<dyn ToSql + Sync + Send> = match (ty, value) {
        (AttributeType::String | AttributeType::Uuid, Value::Text(s)) => Box::new(Some(s.clone())),
        (AttributeType::String | AttributeType::Uuid, Value::Null) => Box::new(None::<String>),
        (AttributeType::Integer, Value::Integer(i)) => Box::new(Some(*i)),
        (AttributeType::Integer, Value::Null) => Box::new(None::<i64>),
        (AttributeType::Float, Value::Float(f)) => Box::new(Some(*f)),
        (AttributeType::Float, Value::Null) => Box::new(None::<f64>),
        (AttributeType::Boolean, Value::Boolean(b)) => Box::new(Some(*b)),
        (AttributeType::Boolean, Value::Null) => Box::new(None::<bool>),
        (AttributeType::Timestamp, Value::Timestamp(ts)) => Box::new(Some(*ts)),
        (AttributeType::Timestamp, Value::Null) => {
            Box::new(None::<chrono::DateTime<chrono::Utc>>)
        }
        (AttributeType::Json, Value::Json(json)) => Box::new(Some(json.clone())),
        (AttributeType::Json, Value::Null) => Box::new(None::<serde_json::Value>),
        (ty, other) => bail!("cannot bind {} value as {}", other.kind(), ty),
    };
    Ok(param)
}

fn key_to_param(schema: &EntitySchema, id: &EntityId) -> Result<Box<dyn ToSql + Sync + Send>> {
    match (schema.key_kind, id) {
        (KeyKind::Integer, EntityId::Int(i)) => Ok(Box::new(*i)),
        (KeyKind::Uuid, EntityId::Text(s)) => Ok(Box::new(s.clone())),
        (_, other) => bail!(
            "identifier '{}' does not fit the {:?} key of {}",
            other,
            schema.key_kind,
            schema.entity_type
        ),
    }
}

fn row_to_entity(schema: &EntitySchema, row: &Row) -> Result<Entity> {
    let id = match schema.key_kind {
        KeyKind::Integer => EntityId::Int(row.try_get::<_, i64>(0)?),
        KeyKind::Uuid => EntityId::Text(row.try_get::<_, String>(0)?),
    };

    let mut raw = Vec::with_capacity(schema.attributes.len());
    for (idx, (name, spec)) in schema.attributes.iter().enumerate() {
        let idx = idx + 1;
        let value = match spec.ty {
            AttributeType::String | AttributeType::Uuid => {
                Value::from(row.try_get::<_, Option<String>>(idx)?)
            }
            AttributeType::Integer => Value::from(row.try_get::<_, Option<i64>>(idx)?),
            AttributeType::Float => Value::from(row.try_get::<_, Option<f64>>(idx)?),
            AttributeType::Boolean => Value::from(row.try_get::<_, Option<bool>>(idx)?),
            AttributeType::Timestamp => Value::from(
                row.try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(idx)?,
            ),
            AttributeType::Json => {
                Value::from(row.try_get::<_, Option<serde_json::Value>>(idx)?)
            }
        };
        raw.push((name.clone(), value));
    }
    entity_from_row(schema, id, raw)
}

/// Builds `(column list, placeholder list, params)` for the given attributes.
fn bind_attributes(
    schema: &EntitySchema,
    attributes: &Attributes,
    first_placeholder: usize,
) -> Result<(Vec<String>, Vec<String>, Vec<Box<dyn ToSql + Sync + Send>>)> {
    let mut columns = Vec::with_capacity(attributes.len());
    let mut placeholders = Vec::with_capacity(attributes.len());
    let mut params = Vec::with_capacity(attributes.len());
    for (offset, (name, value)) in attributes.iter().enumerate() {
        let ty = schema
            .spec(name)
            .map(|spec| spec.ty)
            .with_context(|| format!("'{}' is not an attribute of {}", name, schema.entity_type))?;
        columns.push(quote_ident(name));
        placeholders.push(format!("${}::{}", first_placeholder + offset, write_cast(ty)));
        params.push(to_param(value, ty)?);
    }
    Ok((columns, placeholders, params))
}

#[async_trait]
impl EntityStore for PostgresStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn find(&mut self, schema: &EntitySchema, id: &EntityId) -> Result<Option<Entity>> {
        let where_clause = format!(
            " WHERE {} = $1::{}",
            quote_ident(&schema.primary_key),
            write_key_cast(schema)
        );
        let mut found = self
            .query_entities(schema, &where_clause, vec![key_to_param(schema, id)?])
            .await?;
        Ok(found.pop())
    }

    /// Compares the key as text, since the column type is not declared.
    async fn exists(
        &mut self,
        entity_type: &str,
        primary_key: &str,
        id: &EntityId,
    ) -> Result<bool> {
        let query = format!(
            "SELECT EXISTS(SELECT 1 FROM {} WHERE {}::TEXT = $1)",
            quote_ident(entity_type),
            quote_ident(primary_key)
        );
        let row = self
            .client
            .query_one(&query, &[&id.to_string()])
            .await
            .with_context(|| format!("Failed to look up {}#{}", entity_type, id))?;
        Ok(row.get(0))
    }

    async fn find_where(
        &mut self,
        schema: &EntitySchema,
        filters: &[Filter],
    ) -> Result<Vec<Entity>> {
        let filters = prepare_filters(schema, filters)?;
        let mut clauses = Vec::with_capacity(filters.len());
        let mut params: Vec<Box<dyn ToSql + Sync + Send>> = Vec::with_capacity(filters.len());
        for filter in &filters {
            let column = quote_ident(&filter.attribute);
            if filter.value.is_null() {
                clauses.push(format!("{} IS NULL", column));
                continue;
            }
            if filter.attribute == schema.primary_key {
                let id = EntityId::from_value(&filter.value)
                    .with_context(|| format!("invalid key filter on {}", schema.entity_type))?;
                params.push(key_to_param(schema, &id)?);
                clauses.push(format!(
                    "{} = ${}::{}",
                    column,
                    params.len(),
                    write_key_cast(schema)
                ));
            } else {
                let ty = schema
                    .spec(&filter.attribute)
                    .map(|spec| spec.ty)
                    .unwrap_or(AttributeType::String);
                params.push(to_param(&filter.value, ty)?);
                clauses.push(format!("{} = ${}::{}", column, params.len(), write_cast(ty)));
            }
        }
        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };
        self.query_entities(schema, &where_clause, params).await
    }

    async fn create(&mut self, schema: &EntitySchema, attributes: Attributes) -> Result<Entity> {
        self.ensure_writable()?;
        let prepared = schema.prepare_insert(attributes)?;

        let (mut columns, mut placeholders, mut params) = bind_attributes(schema, &prepared, 1)?;
        if let Some(key) = schema.generate_key() {
            params.push(key_to_param(schema, &key)?);
            columns.push(quote_ident(&schema.primary_key));
            placeholders.push(format!("${}::{}", params.len(), write_key_cast(schema)));
        }

        let table = quote_ident(&schema.entity_type);
        let returning = format!(
            "RETURNING {}",
            Self::select_list(schema)
        );
        let query = if columns.is_empty() {
            format!("INSERT INTO {} DEFAULT VALUES {}", table, returning)
        } else {
            format!(
                "INSERT INTO {} ({}) VALUES ({}) {}",
                table,
                columns.join(", "),
                placeholders.join(", "),
                returning
            )
        };

        let refs: Vec<&(dyn ToSql + Sync)> = params
            .iter()
            .map(|v| v.as_ref() as &(dyn ToSql + Sync))
            .collect();
        let row = self
            .client
            .query_one(&query, &refs)
            .await
            .with_context(|| format!("Failed to insert into '{}'", schema.entity_type))?;
        let entity = row_to_entity(schema, &row)?;
        tracing::debug!("Inserted {} into '{}'", entity.label(), self.name);
        Ok(entity)
    }

    async fn save(&mut self, schema: &EntitySchema, entity: &Entity) -> Result<()> {
        self.ensure_writable()?;
        let prepared = schema.prepare_update(entity.attributes().clone())?;
        if prepared.is_empty() {
            return Ok(());
        }

        let (columns, placeholders, mut params) = bind_attributes(schema, &prepared, 1)?;
        let assignments: Vec<String> = columns
            .iter()
            .zip(&placeholders)
            .map(|(column, placeholder)| format!("{} = {}", column, placeholder))
            .collect();
        params.push(key_to_param(schema, entity.id())?);

        let query = format!(
            "UPDATE {} SET {} WHERE {} = ${}::{}",
            quote_ident(&schema.entity_type),
            assignments.join(", "),
            quote_ident(&schema.primary_key),
            params.len(),
            write_key_cast(schema)
        );
        let refs: Vec<&(dyn ToSql + Sync)> = params
            .iter()
            .map(|v| v.as_ref() as &(dyn ToSql + Sync))
            .collect();
        let updated = self
            .client
            .execute(&query, &refs)
            .await
            .with_context(|| format!("Failed to update {}", entity.label()))?;
        if updated == 0 {
            bail!("Cannot save {}: row does not exist", entity.label());
        }
        Ok(())
    }

    async fn count(&mut self, schema: &EntitySchema) -> Result<u64> {
        let query = format!("SELECT COUNT(*) FROM {}", quote_ident(&schema.entity_type));
        let row = self
            .client
            .query_one(&query, &[])
            .await
            .with_context(|| format!("Failed to count rows in table '{}'", schema.entity_type))?;
        let count: i64 = row.get(0);
        Ok(count as u64)
    }

    async fn begin_transaction(&mut self, mode: TransactionMode) -> Result<()> {
        if self.mode.is_some() {
            bail!(
                "PostgreSQL store '{}' already has a transaction open",
                self.name
            );
        }
        let sql = match mode {
            TransactionMode::ReadOnly => "BEGIN ISOLATION LEVEL REPEATABLE READ READ ONLY",
            TransactionMode::ReadWrite => "BEGIN",
        };
        self.client
            .batch_execute(sql)
            .await
            .with_context(|| format!("Failed to begin transaction on {}", self.name))?;
        self.mode = Some(mode);
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        if self.mode.take().is_none() {
            bail!("PostgreSQL store '{}' has no transaction open", self.name);
        }
        self.client
            .batch_execute("COMMIT")
            .await
            .with_context(|| format!("Failed to commit transaction on {}", self.name))
    }

    async fn rollback(&mut self) -> Result<()> {
        if self.mode.take().is_none() {
            bail!("PostgreSQL store '{}' has no transaction open", self.name);
        }
        self.client
            .batch_execute("ROLLBACK")
            .await
            .with_context(|| format!("Failed to roll back transaction on {}", self.name))
    }
}

fn write_key_cast(schema: &EntitySchema) -> &'static str {
    match schema.key_kind {
        KeyKind::Integer => "BIGINT",
        KeyKind::Uuid => "TEXT::UUID",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_casts() {
        assert_eq!(read_cast(AttributeType::Uuid), "TEXT");
        assert_eq!(write_cast(AttributeType::Uuid), "TEXT::UUID");
        assert_eq!(write_cast(AttributeType::Json), "JSONB");
        assert_eq!(write_cast(AttributeType::Timestamp), "TIMESTAMPTZ");
    }

    #[test]
    fn test_select_list_casts_every_column() {
        let schema = EntitySchema::new("organizations")
            .attribute("name", AttributeType::String)
            .attribute("metadata", AttributeType::Json);
        assert_eq!(
            PostgresStore::select_list(&schema),
            "\"id\"::BIGINT, \"metadata\"::JSONB, \"name\"::TEXT"
        );
    }

    #[test]
    fn test_bind_rejects_mismatched_values() {
        assert!(to_param(&Value::Json(json!({})), AttributeType::Integer).is_err());
        assert!(to_param(&Value::Null, AttributeType::Json).is_ok());
        assert!(to_param(&Value::Integer(5), AttributeType::Integer).is_ok());
    }

    #[test]
    fn test_key_params_follow_key_kind() {
        let schema = EntitySchema::new("organizations");
        assert!(key_to_param(&schema, &EntityId::Int(5)).is_ok());
        assert!(key_to_param(&schema, &EntityId::from("temp_abc")).is_err());
    }
}
