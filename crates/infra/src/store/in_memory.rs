use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value as JsonValue;
use tokio::sync::{Mutex as RowLock, OwnedMutexGuard};

use keel_core::{AggregateId, EventId};
use keel_events::BindingInfo;

use super::r#trait::{
    AggregateRow, NewEvent, RecordStore, StoreError, StoreTransaction, StoredEvent,
};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
struct RowKey {
    table: &'static str,
    id: AggregateId,
}

#[derive(Debug, Clone)]
struct EventRow {
    reference_field: &'static str,
    stored: StoredEvent,
}

/// A top-level state attribute that must be unique across one table.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
struct UniqueField {
    table: &'static str,
    field: &'static str,
}

#[derive(Debug, Default)]
struct Tables {
    aggregates: HashMap<RowKey, JsonValue>,
    events: HashMap<&'static str, Vec<EventRow>>,
}

#[derive(Debug, Default)]
struct Shared {
    tables: RwLock<Tables>,
    row_locks: Mutex<HashMap<RowKey, Arc<RowLock<()>>>>,
}

impl Shared {
    fn row_lock(&self, key: RowKey) -> Result<Arc<RowLock<()>>, StoreError> {
        let mut locks = self.row_locks.lock().map_err(|_| poisoned())?;
        Ok(locks.entry(key).or_default().clone())
    }

    /// Drop the lock entry for `key` once nobody holds or waits on it.
    fn release_row_lock(&self, key: RowKey) {
        let Ok(mut locks) = self.row_locks.lock() else {
            return;
        };
        if locks.get(&key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(&key);
        }
    }
}

fn poisoned() -> StoreError {
    StoreError::Backend("lock poisoned".to_string())
}

/// In-memory transactional record store.
///
/// Intended for tests/dev. Not optimized for performance.
///
/// - Writes are buffered per transaction and become visible together on commit.
/// - Row locks are per-aggregate `tokio` mutexes held until the transaction
///   commits, rolls back or is dropped.
/// - Optional unique constraints on top-level state attributes stand in for
///   the database constraints a real backend would enforce.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRecordStore {
    shared: Arc<Shared>,
    unique: Vec<UniqueField>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject saves that would give two rows of `table` the same `field` value.
    #[must_use]
    pub fn with_unique_field(mut self, table: &'static str, field: &'static str) -> Self {
        self.unique.push(UniqueField { table, field });
        self
    }

    /// Committed state of an aggregate row.
    pub fn aggregate_state(&self, table: &'static str, id: AggregateId) -> Option<JsonValue> {
        let tables = self.shared.tables.read().ok()?;
        tables.aggregates.get(&RowKey { table, id }).cloned()
    }

    pub fn aggregate_count(&self, table: &str) -> usize {
        self.shared
            .tables
            .read()
            .map(|t| t.aggregates.keys().filter(|k| k.table == table).count())
            .unwrap_or(0)
    }

    /// Committed rows of an events table, in insertion order.
    pub fn events(&self, events_table: &str) -> Vec<StoredEvent> {
        self.shared
            .tables
            .read()
            .ok()
            .and_then(|t| {
                t.events
                    .get(events_table)
                    .map(|rows| rows.iter().map(|r| r.stored.clone()).collect())
            })
            .unwrap_or_default()
    }

    /// Whether some open transaction currently holds the row lock.
    pub fn is_locked(&self, table: &'static str, id: AggregateId) -> bool {
        let Ok(locks) = self.shared.row_locks.lock() else {
            return false;
        };
        locks
            .get(&RowKey { table, id })
            .is_some_and(|lock| lock.try_lock().is_err())
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    type Transaction = InMemoryTransaction;

    async fn begin(&self) -> Result<Self::Transaction, StoreError> {
        Ok(InMemoryTransaction {
            shared: self.shared.clone(),
            unique: self.unique.clone(),
            aggregates: HashMap::new(),
            events: Vec::new(),
            held: HashMap::new(),
        })
    }
}

/// Transaction over an [`InMemoryRecordStore`].
#[derive(Debug)]
pub struct InMemoryTransaction {
    shared: Arc<Shared>,
    unique: Vec<UniqueField>,
    aggregates: HashMap<RowKey, JsonValue>,
    events: Vec<(&'static str, EventRow)>,
    held: HashMap<RowKey, OwnedMutexGuard<()>>,
}

impl InMemoryTransaction {
    fn read_row(&self, key: RowKey) -> Result<Option<AggregateRow>, StoreError> {
        if let Some(state) = self.aggregates.get(&key) {
            return Ok(Some(AggregateRow {
                id: key.id,
                state: state.clone(),
            }));
        }
        let tables = self.shared.tables.read().map_err(|_| poisoned())?;
        Ok(tables.aggregates.get(&key).map(|state| AggregateRow {
            id: key.id,
            state: state.clone(),
        }))
    }

    fn row_exists(&self, key: RowKey) -> Result<bool, StoreError> {
        if self.aggregates.contains_key(&key) {
            return Ok(true);
        }
        let tables = self.shared.tables.read().map_err(|_| poisoned())?;
        Ok(tables.aggregates.contains_key(&key))
    }

    /// Check `state` for `key` against committed rows and this transaction's
    /// own pending rows.
    fn check_unique(&self, key: RowKey, state: &JsonValue) -> Result<(), StoreError> {
        let tables = self.shared.tables.read().map_err(|_| poisoned())?;
        check_unique(&self.unique, &tables.aggregates, key, state)?;
        check_unique(&self.unique, &self.aggregates, key, state)
    }

    fn write_through(&self) -> Result<(), StoreError> {
        let mut tables = self.shared.tables.write().map_err(|_| poisoned())?;

        // Re-check against rows other transactions committed meanwhile.
        for (key, state) in &self.aggregates {
            check_unique(&self.unique, &tables.aggregates, *key, state)?;
        }

        for (key, state) in &self.aggregates {
            tables.aggregates.insert(*key, state.clone());
        }
        for (events_table, row) in &self.events {
            tables
                .events
                .entry(*events_table)
                .or_default()
                .push(row.clone());
        }
        Ok(())
    }

    fn committed_events(
        &self,
        binding: &BindingInfo,
        aggregate_ref: AggregateId,
    ) -> Result<Vec<StoredEvent>, StoreError> {
        let tables = self.shared.tables.read().map_err(|_| poisoned())?;
        Ok(tables
            .events
            .get(binding.events_table)
            .map(|rows| {
                rows.iter()
                    .filter(|r| {
                        r.reference_field == binding.reference_field
                            && r.stored.aggregate_ref == aggregate_ref
                    })
                    .map(|r| r.stored.clone())
                    .collect()
            })
            .unwrap_or_default())
    }
}

fn check_unique(
    constraints: &[UniqueField],
    rows: &HashMap<RowKey, JsonValue>,
    key: RowKey,
    state: &JsonValue,
) -> Result<(), StoreError> {
    for constraint in constraints.iter().filter(|c| c.table == key.table) {
        let Some(value) = state.get(constraint.field).filter(|v| !v.is_null()) else {
            continue;
        };
        let clash = rows.iter().any(|(other, other_state)| {
            other.table == key.table
                && other.id != key.id
                && other_state.get(constraint.field) == Some(value)
        });
        if clash {
            return Err(StoreError::Constraint(format!(
                "{}.{} must be unique, {} is already taken",
                constraint.table, constraint.field, value
            )));
        }
    }
    Ok(())
}

#[async_trait]
impl StoreTransaction for InMemoryTransaction {
    async fn find_aggregate(
        &mut self,
        table: &'static str,
        id: AggregateId,
    ) -> Result<Option<AggregateRow>, StoreError> {
        self.read_row(RowKey { table, id })
    }

    async fn lock_aggregate(
        &mut self,
        table: &'static str,
        id: AggregateId,
        timeout: Duration,
    ) -> Result<AggregateRow, StoreError> {
        let key = RowKey { table, id };

        if !self.held.contains_key(&key) {
            let lock = self.shared.row_lock(key)?;
            let Ok(guard) = tokio::time::timeout(timeout, lock.lock_owned()).await else {
                self.shared.release_row_lock(key);
                return Err(StoreError::LockTimeout {
                    table,
                    id,
                    waited: timeout,
                });
            };
            self.held.insert(key, guard);
        }

        self.read_row(key)?.ok_or(StoreError::NotFound { table, id })
    }

    async fn insert_aggregate(
        &mut self,
        table: &'static str,
        state: JsonValue,
    ) -> Result<AggregateId, StoreError> {
        let key = RowKey {
            table,
            id: AggregateId::new(),
        };
        self.check_unique(key, &state)?;
        self.aggregates.insert(key, state);
        Ok(key.id)
    }

    async fn update_aggregate(
        &mut self,
        table: &'static str,
        id: AggregateId,
        state: JsonValue,
    ) -> Result<(), StoreError> {
        let key = RowKey { table, id };
        if !self.row_exists(key)? {
            return Err(StoreError::NotFound { table, id });
        }
        self.check_unique(key, &state)?;
        self.aggregates.insert(key, state);
        Ok(())
    }

    async fn insert_event(
        &mut self,
        binding: &BindingInfo,
        event: NewEvent,
    ) -> Result<StoredEvent, StoreError> {
        let key = RowKey {
            table: binding.aggregate_table,
            id: event.aggregate_ref,
        };
        if !self.row_exists(key)? {
            return Err(StoreError::Constraint(format!(
                "{}.{} references missing {} {}",
                binding.events_table, binding.reference_field, binding.aggregate_type, event.aggregate_ref
            )));
        }

        let stored = StoredEvent {
            id: EventId::new(),
            event_type: event.event_type,
            payload: event.payload,
            aggregate_ref: event.aggregate_ref,
            created_at: Utc::now(),
        };
        self.events.push((
            binding.events_table,
            EventRow {
                reference_field: binding.reference_field,
                stored: stored.clone(),
            },
        ));
        Ok(stored)
    }

    async fn load_events(
        &mut self,
        binding: &BindingInfo,
        aggregate_ref: AggregateId,
    ) -> Result<Vec<StoredEvent>, StoreError> {
        let mut events = self.committed_events(binding, aggregate_ref)?;
        events.extend(
            self.events
                .iter()
                .filter(|(table, row)| {
                    *table == binding.events_table
                        && row.reference_field == binding.reference_field
                        && row.stored.aggregate_ref == aggregate_ref
                })
                .map(|(_, row)| row.stored.clone()),
        );
        Ok(events)
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.write_through()?;
        tracing::trace!(
            aggregates = self.aggregates.len(),
            events = self.events.len(),
            locks = self.held.len(),
            "in-memory transaction committed"
        );
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        Ok(())
    }
}

impl Drop for InMemoryTransaction {
    fn drop(&mut self) {
        let keys: Vec<RowKey> = self.held.drain().map(|(key, _guard)| key).collect();
        for key in keys {
            self.shared.release_row_lock(key);
        }
    }
}
