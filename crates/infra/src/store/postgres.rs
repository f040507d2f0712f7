//! Postgres-backed record store.
//!
//! Each application runs inside one database transaction. Row locks are
//! `SELECT … FOR UPDATE` with a transaction-local `lock_timeout`, so a
//! blocked lock surfaces as [`StoreError::LockTimeout`] instead of waiting
//! forever.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `Constraint` |
//! | Database (foreign key violation) | `23503` | `Constraint` |
//! | Database (not null violation) | `23502` | `Constraint` |
//! | Database (check constraint violation) | `23514` | `Constraint` |
//! | Database (lock not available) | `55P03` | `LockTimeout` (at the lock site) |
//! | Anything else | any | `Backend` |
//!
//! ## Table Layout
//!
//! Table and column names come from `Aggregate::TABLE` and the event
//! binding constants. They are interpolated into SQL, so they are checked to
//! be plain lowercase identifiers first. [`schema_sql`] renders the DDL a
//! binding expects.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;
use uuid::Uuid;

use keel_core::{AggregateId, EventId};
use keel_events::{BindingInfo, Payload};

use crate::config::StoreConfig;

use super::r#trait::{
    AggregateRow, NewEvent, RecordStore, StoreError, StoreTransaction, StoredEvent,
};

/// Postgres-backed transactional record store.
///
/// Uses the SQLx connection pool, which is `Send + Sync` and cheap to clone.
#[derive(Debug, Clone)]
pub struct PostgresRecordStore {
    pool: PgPool,
}

impl PostgresRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool from configuration.
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let url = config
            .database_url
            .as_deref()
            .ok_or_else(|| StoreError::Backend("DATABASE_URL is not set".to_string()))?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;

        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the aggregate and event tables of a binding if they are missing.
    #[instrument(skip(self), fields(events_table = binding.events_table), err)]
    pub async fn ensure_schema(&self, binding: &BindingInfo) -> Result<(), StoreError> {
        for statement in schema_sql(binding)? {
            sqlx::query(&statement)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for PostgresRecordStore {
    type Transaction = PostgresTransaction;

    async fn begin(&self) -> Result<Self::Transaction, StoreError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        Ok(PostgresTransaction { tx })
    }
}

/// One open database transaction.
///
/// Dropping it without calling `commit` rolls back.
pub struct PostgresTransaction {
    tx: Transaction<'static, Postgres>,
}

impl std::fmt::Debug for PostgresTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresTransaction").finish_non_exhaustive()
    }
}

#[async_trait]
impl StoreTransaction for PostgresTransaction {
    #[instrument(skip(self), fields(id = %id), err)]
    async fn find_aggregate(
        &mut self,
        table: &'static str,
        id: AggregateId,
    ) -> Result<Option<AggregateRow>, StoreError> {
        let sql = format!("SELECT id, state FROM {} WHERE id = $1", ident(table)?);

        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("find_aggregate", e))?;

        row.map(|r| aggregate_row(&r)).transpose()
    }

    #[instrument(skip(self), fields(id = %id), err)]
    async fn lock_aggregate(
        &mut self,
        table: &'static str,
        id: AggregateId,
        timeout: Duration,
    ) -> Result<AggregateRow, StoreError> {
        // SET does not accept bind parameters.
        let set_timeout = format!("SET LOCAL lock_timeout = '{}ms'", timeout.as_millis().max(1));
        sqlx::query(&set_timeout)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("set_lock_timeout", e))?;

        let sql = format!(
            "SELECT id, state FROM {} WHERE id = $1 FOR UPDATE",
            ident(table)?
        );

        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| {
                if has_code(&e, "55P03") {
                    StoreError::LockTimeout {
                        table,
                        id,
                        waited: timeout,
                    }
                } else {
                    map_sqlx_error("lock_aggregate", e)
                }
            })?;

        match row {
            Some(r) => aggregate_row(&r),
            None => Err(StoreError::NotFound { table, id }),
        }
    }

    #[instrument(skip(self, state), err)]
    async fn insert_aggregate(
        &mut self,
        table: &'static str,
        state: JsonValue,
    ) -> Result<AggregateId, StoreError> {
        let id = AggregateId::new();
        let sql = format!(
            "INSERT INTO {} (id, state, created_at, updated_at) VALUES ($1, $2, NOW(), NOW())",
            ident(table)?
        );

        sqlx::query(&sql)
            .bind(id.as_uuid())
            .bind(&state)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("insert_aggregate", e))?;

        Ok(id)
    }

    #[instrument(skip(self, state), fields(id = %id), err)]
    async fn update_aggregate(
        &mut self,
        table: &'static str,
        id: AggregateId,
        state: JsonValue,
    ) -> Result<(), StoreError> {
        let sql = format!(
            "UPDATE {} SET state = $2, updated_at = NOW() WHERE id = $1",
            ident(table)?
        );

        let result = sqlx::query(&sql)
            .bind(id.as_uuid())
            .bind(&state)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("update_aggregate", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound { table, id });
        }
        Ok(())
    }

    #[instrument(
        skip(self, binding, event),
        fields(
            events_table = binding.events_table,
            event_type = %event.event_type,
            aggregate_ref = %event.aggregate_ref
        ),
        err
    )]
    async fn insert_event(
        &mut self,
        binding: &BindingInfo,
        event: NewEvent,
    ) -> Result<StoredEvent, StoreError> {
        let id = EventId::new();
        let created_at = Utc::now();
        let sql = format!(
            "INSERT INTO {} (id, event_type, payload, {}, created_at) VALUES ($1, $2, $3, $4, $5)",
            ident(binding.events_table)?,
            ident(binding.reference_field)?
        );

        let payload = event.payload.into_value();
        sqlx::query(&sql)
            .bind(id.as_uuid())
            .bind(&event.event_type)
            .bind(&payload)
            .bind(event.aggregate_ref.as_uuid())
            .bind(created_at)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("insert_event", e))?;

        Ok(StoredEvent {
            id,
            event_type: event.event_type,
            payload: Payload::from_value(payload)
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
            aggregate_ref: event.aggregate_ref,
            created_at,
        })
    }

    #[instrument(skip(self, binding), fields(events_table = binding.events_table), err)]
    async fn load_events(
        &mut self,
        binding: &BindingInfo,
        aggregate_ref: AggregateId,
    ) -> Result<Vec<StoredEvent>, StoreError> {
        let reference = ident(binding.reference_field)?;
        let sql = format!(
            "SELECT id, event_type, payload, {reference} AS aggregate_ref, created_at \
             FROM {} WHERE {reference} = $1 ORDER BY created_at ASC, id ASC",
            ident(binding.events_table)?
        );

        let rows = sqlx::query(&sql)
            .bind(aggregate_ref.as_uuid())
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("load_events", e))?;

        rows.iter().map(stored_event).collect()
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", e))
    }
}

/// DDL for the aggregate table and events table of a binding.
pub fn schema_sql(binding: &BindingInfo) -> Result<Vec<String>, StoreError> {
    let aggregates = ident(binding.aggregate_table)?;
    let events = ident(binding.events_table)?;
    let reference = ident(binding.reference_field)?;

    Ok(vec![
        format!(
            "CREATE TABLE IF NOT EXISTS {aggregates} (\
                id UUID PRIMARY KEY, \
                state JSONB NOT NULL, \
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(), \
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW())"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {events} (\
                id UUID PRIMARY KEY, \
                event_type TEXT NOT NULL, \
                payload JSONB NOT NULL DEFAULT '{{}}'::jsonb, \
                {reference} UUID NOT NULL REFERENCES {aggregates} (id), \
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW())"
        ),
        format!("CREATE INDEX IF NOT EXISTS {events}_{reference}_idx ON {events} ({reference})"),
    ])
}

/// Accept only plain lowercase SQL identifiers.
fn ident(name: &'static str) -> Result<&'static str, StoreError> {
    let valid = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_')
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');

    if valid {
        Ok(name)
    } else {
        Err(StoreError::Backend(format!("invalid SQL identifier '{name}'")))
    }
}

fn aggregate_row(row: &PgRow) -> Result<AggregateRow, StoreError> {
    let id: Uuid = row
        .try_get("id")
        .map_err(|e| StoreError::Serialization(format!("failed to read id: {e}")))?;
    let state: JsonValue = row
        .try_get("state")
        .map_err(|e| StoreError::Serialization(format!("failed to read state: {e}")))?;

    Ok(AggregateRow {
        id: AggregateId::from_uuid(id),
        state,
    })
}

fn stored_event(row: &PgRow) -> Result<StoredEvent, StoreError> {
    let read = |e: sqlx::Error| StoreError::Serialization(format!("failed to read event row: {e}"));

    let id: Uuid = row.try_get("id").map_err(read)?;
    let event_type: String = row.try_get("event_type").map_err(read)?;
    let payload: JsonValue = row.try_get("payload").map_err(read)?;
    let aggregate_ref: Uuid = row.try_get("aggregate_ref").map_err(read)?;
    let created_at: DateTime<Utc> = row.try_get("created_at").map_err(read)?;

    Ok(StoredEvent {
        id: EventId::from_uuid(id),
        event_type,
        payload: Payload::from_value(payload)
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        aggregate_ref: AggregateId::from_uuid(aggregate_ref),
        created_at,
    })
}

fn has_code(err: &sqlx::Error, expected: &str) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == expected;
        }
    }
    false
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());

            match db_err.code().as_deref() {
                Some("23505" | "23503" | "23502" | "23514") => StoreError::Constraint(msg),
                _ => StoreError::Backend(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Backend(format!("connection pool closed in {}", operation))
        }
        _ => StoreError::Backend(format!("sqlx error in {}: {}", operation, err)),
    }
}
