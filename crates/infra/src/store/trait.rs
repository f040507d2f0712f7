use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use keel_core::{Aggregate, AggregateId, EventId};
use keel_events::{BindingInfo, Event, EventRecord, Payload};

/// A row of an aggregate table: identity plus serialized attribute set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRow {
    pub id: AggregateId,
    pub state: JsonValue,
}

impl AggregateRow {
    /// Decode the row into its aggregate type and attach the row's identity.
    pub fn decode<A: Aggregate>(self) -> Result<A, StoreError> {
        let mut aggregate: A = serde_json::from_value(self.state).map_err(|e| {
            StoreError::Serialization(format!(
                "failed to decode {} {}: {e}",
                A::AGGREGATE_TYPE,
                self.id
            ))
        })?;
        aggregate.assign_id(self.id);
        Ok(aggregate)
    }
}

/// An event row ready to be inserted (identity and timestamp not yet assigned).
///
/// The aggregate reference is mandatory here: the engine backfills it before
/// the row is written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
    pub event_type: String,
    pub payload: Payload,
    pub aggregate_ref: AggregateId,
}

/// A persisted event row.
///
/// Stored events are append-only: stores expose no way to update or delete them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub id: EventId,
    pub event_type: String,
    pub payload: Payload,
    pub aggregate_ref: AggregateId,
    pub created_at: DateTime<Utc>,
}

impl StoredEvent {
    pub fn to_record(&self) -> EventRecord {
        EventRecord::persisted(
            self.id,
            self.event_type.clone(),
            self.payload.clone(),
            self.aggregate_ref,
            self.created_at,
        )
    }

    /// Rehydrate the stored row as a concrete event type.
    pub fn to_event<E: Event>(&self) -> E {
        E::from_record(self.to_record())
    }
}

/// Record store operation error.
///
/// These are **infrastructure errors** as opposed to domain errors
/// (validation, invariants). The apply engine maps them onto its own
/// taxonomy with the offending event type attached.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("no row {id} in '{table}'")]
    NotFound { table: &'static str, id: AggregateId },

    #[error("lock on '{table}' row {id} not acquired within {waited:?}")]
    LockTimeout {
        table: &'static str,
        id: AggregateId,
        waited: Duration,
    },

    #[error("constraint violated: {0}")]
    Constraint(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("backend failure: {0}")]
    Backend(String),
}

/// Transactional record store the apply engine runs against.
///
/// ## Design Principles
///
/// - **One transaction per application**: every read and write of a single
///   event application goes through one [`StoreTransaction`].
/// - **Pessimistic row locks**: [`StoreTransaction::lock_aggregate`] holds an
///   exclusive lock until commit or rollback.
/// - **All or nothing**: dropping a transaction without committing discards
///   its writes and releases its locks.
#[async_trait]
pub trait RecordStore: Send + Sync {
    type Transaction: StoreTransaction;

    async fn begin(&self) -> Result<Self::Transaction, StoreError>;
}

/// Operations available inside one store transaction.
///
/// Reads observe committed data plus the transaction's own writes.
#[async_trait]
pub trait StoreTransaction: Send {
    /// Plain read of an aggregate row; takes no lock.
    async fn find_aggregate(
        &mut self,
        table: &'static str,
        id: AggregateId,
    ) -> Result<Option<AggregateRow>, StoreError>;

    /// Take an exclusive lock on an aggregate row, waiting at most `timeout`,
    /// and return the row's latest committed state.
    async fn lock_aggregate(
        &mut self,
        table: &'static str,
        id: AggregateId,
        timeout: Duration,
    ) -> Result<AggregateRow, StoreError>;

    /// Insert a new aggregate row and return its freshly assigned identity.
    async fn insert_aggregate(
        &mut self,
        table: &'static str,
        state: JsonValue,
    ) -> Result<AggregateId, StoreError>;

    async fn update_aggregate(
        &mut self,
        table: &'static str,
        id: AggregateId,
        state: JsonValue,
    ) -> Result<(), StoreError>;

    /// Append an event row, assigning its id and creation timestamp.
    async fn insert_event(
        &mut self,
        binding: &BindingInfo,
        event: NewEvent,
    ) -> Result<StoredEvent, StoreError>;

    /// All events referencing `aggregate_ref`, in insertion order.
    async fn load_events(
        &mut self,
        binding: &BindingInfo,
        aggregate_ref: AggregateId,
    ) -> Result<Vec<StoredEvent>, StoreError>;

    async fn commit(self) -> Result<(), StoreError>;

    async fn rollback(self) -> Result<(), StoreError>;
}
