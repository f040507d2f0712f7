//! Event application pipeline (application-level orchestration).
//!
//! This module turns one concrete event into one atomic state change: the
//! bound aggregate is resolved, locked, transformed by the event's apply
//! rule, saved, and the event row is appended, all inside one store
//! transaction.
//!
//! ## Apply Flow
//!
//! ```text
//! Event
//!   ↓
//! 1. Resolve aggregate (load by reference, or build a new one)
//!   ↓
//! 2. Lock the aggregate row (existing aggregates only, bounded wait)
//!   ↓
//! 3. Apply the event's rule (pure: current state -> new state)
//!   ↓
//! 4. Validate and save the aggregate (insert or update)
//!   ↓
//! 5. Backfill the event's aggregate reference
//!   ↓
//! 6. Append the event row, commit
//! ```
//!
//! Any failure rolls the transaction back, so either both the aggregate
//! write and the event row become visible or neither does.

use std::sync::Arc;

use tracing::{debug, instrument, warn};

use keel_core::{Aggregate, AggregateId, DomainError};
use keel_events::{AggregateBinding, Apply, BindingInfo, Event, EventRegistry, RecordError};

use crate::config::ApplierConfig;
use crate::error::ApplyError;
use crate::resolver::{resolve, Resolution};
use crate::store::{NewEvent, RecordStore, StoreError, StoreTransaction, StoredEvent};

/// Lifecycle of one application, as reported in logs.
///
/// `Draft -> Resolved -> Locked -> Applied -> AggregateSaved -> Persisted`.
/// `Locked` is skipped for newly built aggregates. Any stage before
/// `Persisted` can end in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyStage {
    Draft,
    Resolved,
    Locked,
    Applied,
    AggregateSaved,
    Persisted,
    Failed,
}

/// A successful application.
#[derive(Debug)]
pub struct Applied<E: AggregateBinding> {
    /// The event, now persisted: id and `created_at` assigned, aggregate
    /// reference filled in.
    pub event: E,
    /// The aggregate state as saved.
    pub aggregate: E::Aggregate,
    /// The appended event row.
    pub stored: StoredEvent,
}

/// Applies events to their bound aggregates.
///
/// ## Concurrency
///
/// Applications on the same existing aggregate serialize on its row lock;
/// each sees the state the previous one committed. Applications on different
/// aggregates do not coordinate.
///
/// Two events *without* an aggregate reference always create two aggregates:
/// nothing serializes creations, so deduplicating "create" requests is the
/// caller's job (for example with a unique constraint on the aggregate
/// table, which surfaces as [`ApplyError::AggregatePersistenceFailure`]).
///
/// ## Generic Parameters
///
/// - `S`: record store implementation (in-memory for tests, Postgres in production)
#[derive(Debug, Clone)]
pub struct EventApplier<S> {
    store: S,
    config: ApplierConfig,
    registry: Option<Arc<EventRegistry>>,
}

impl<S> EventApplier<S> {
    pub fn new(store: S) -> Self {
        Self::with_config(store, ApplierConfig::default())
    }

    pub fn with_config(store: S, config: ApplierConfig) -> Self {
        Self {
            store,
            config,
            registry: None,
        }
    }

    /// Check every applied event's type name against `registry`.
    ///
    /// Events whose (possibly overridden) type name is not registered fail
    /// with [`ApplyError::MissingAggregateBinding`].
    #[must_use]
    pub fn with_registry(mut self, registry: Arc<EventRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &ApplierConfig {
        &self.config
    }

    pub fn registry(&self) -> Option<&EventRegistry> {
        self.registry.as_deref()
    }

    fn check_binding<E>(&self, event: &E) -> Result<(), ApplyError>
    where
        E: Event + AggregateBinding,
    {
        let Some(registry) = &self.registry else {
            return Ok(());
        };

        let registered = registry.binding_for(event.event_type())?;
        let declared = BindingInfo::of::<E>();
        if !registered.same_target(&declared) {
            return Err(ApplyError::BindingMismatch {
                event_type: event.event_type().to_string(),
                registered: *registered,
                declared,
            });
        }
        Ok(())
    }
}

impl<S> EventApplier<S>
where
    S: RecordStore,
{
    /// Apply `event` to its aggregate and persist both atomically.
    ///
    /// With an aggregate reference the referenced aggregate is updated; it
    /// must exist. Without one a new aggregate is created from default state
    /// and the event's reference is backfilled with its fresh identity.
    ///
    /// Returns the persisted event, the saved aggregate and the event row.
    /// On error nothing from this call is visible in the store.
    #[instrument(
        skip(self, event),
        fields(event_type = %event.event_type(), aggregate_ref = ?event.aggregate_ref())
    )]
    pub async fn apply<E>(&self, mut event: E) -> Result<Applied<E>, ApplyError>
    where
        E: Apply,
    {
        if let Some(id) = event.record().id() {
            return Err(ApplyError::AlreadyPersisted {
                event_type: event.event_type().to_string(),
                aggregate_ref: event.aggregate_ref(),
                id,
            });
        }
        self.check_binding(&event)?;

        let mut tx = self
            .store
            .begin()
            .await
            .map_err(|e| ApplyError::store(event.event_type(), event.aggregate_ref(), e))?;

        let mut stage = ApplyStage::Draft;
        let (aggregate, stored) = match self.run(&mut tx, &mut event, &mut stage).await {
            Ok(done) => done,
            Err(err) => {
                warn!(
                    stage = ?ApplyStage::Failed,
                    reached = ?stage,
                    error = %err,
                    "event application failed, rolling back"
                );
                if let Err(rollback) = tx.rollback().await {
                    warn!(error = %rollback, "rollback failed");
                }
                return Err(err);
            }
        };

        // Backends may defer constraint checks to commit.
        if let Err(e) = tx.commit().await {
            let err = match e {
                StoreError::Constraint(detail) => ApplyError::AggregatePersistenceFailure {
                    event_type: event.event_type().to_string(),
                    aggregate_type: <E::Aggregate as Aggregate>::AGGREGATE_TYPE,
                    aggregate_ref: Some(stored.aggregate_ref),
                    detail,
                },
                e => ApplyError::store(event.event_type(), Some(stored.aggregate_ref), e),
            };
            warn!(
                stage = ?ApplyStage::Failed,
                reached = ?stage,
                error = %err,
                "event application failed at commit"
            );
            return Err(err);
        }

        // Checked to be a draft on entry and owned by this call since.
        if let Err(err) = event.record_mut().mark_persisted(stored.id, stored.created_at) {
            warn!(error = %err, "committed event was already stamped");
        }

        debug!(
            stage = ?ApplyStage::Persisted,
            event_id = %stored.id,
            aggregate_ref = %stored.aggregate_ref,
            "event applied"
        );
        Ok(Applied {
            event,
            aggregate,
            stored,
        })
    }

    async fn run<E>(
        &self,
        tx: &mut S::Transaction,
        event: &mut E,
        stage: &mut ApplyStage,
    ) -> Result<(E::Aggregate, StoredEvent), ApplyError>
    where
        E: Apply,
    {
        let event_type = event.event_type().to_string();
        let table = <E::Aggregate as Aggregate>::TABLE;

        // 1) Resolve
        let resolution = resolve(&mut *tx, &*event).await?;
        *stage = ApplyStage::Resolved;
        debug!(stage = ?stage, found = resolution.is_found(), "aggregate resolved");

        // 2) Lock, re-reading the freshest committed state
        let current = match (resolution, event.aggregate_ref()) {
            (Resolution::Found(_), Some(id)) => {
                let row = tx
                    .lock_aggregate(table, id, self.config.lock_timeout)
                    .await
                    .map_err(|e| match e {
                        StoreError::NotFound { .. } => ApplyError::AggregateNotFound {
                            event_type: event_type.clone(),
                            aggregate_type: <E::Aggregate as Aggregate>::AGGREGATE_TYPE,
                            aggregate_ref: id,
                        },
                        e => ApplyError::store(&event_type, Some(id), e),
                    })?;
                *stage = ApplyStage::Locked;
                debug!(stage = ?stage, "aggregate locked");
                row.decode::<E::Aggregate>()
                    .map_err(|e| ApplyError::store(&event_type, Some(id), e))?
            }
            (resolution, _) => resolution.into_inner(),
        };

        // 3) Apply
        let identity = current.id();
        let mut next = event
            .apply(current)
            .map_err(|e| ApplyError::rejected(&event_type, identity, e))?;
        if next.id() != identity {
            return Err(ApplyError::rejected(
                &event_type,
                identity,
                DomainError::invariant("apply must not change the aggregate identity"),
            ));
        }
        *stage = ApplyStage::Applied;
        debug!(stage = ?stage, "event rule applied");

        // 4) Validate and save
        let id = self.save(tx, &event_type, &next).await?;
        next.assign_id(id);
        *stage = ApplyStage::AggregateSaved;
        debug!(stage = ?stage, aggregate_id = %id, "aggregate saved");

        // 5) Backfill
        if event.aggregate_ref().is_none() {
            event
                .record_mut()
                .set_aggregate_ref(id)
                .map_err(|e| record_error(&event_type, id, e))?;
        }

        // 6) Append
        let binding = BindingInfo::of::<E>();
        let stored = tx
            .insert_event(
                &binding,
                NewEvent {
                    event_type: event_type.clone(),
                    payload: event.payload().clone(),
                    aggregate_ref: id,
                },
            )
            .await
            .map_err(|e| ApplyError::store(&event_type, Some(id), e))?;

        Ok((next, stored))
    }

    async fn save<A>(
        &self,
        tx: &mut S::Transaction,
        event_type: &str,
        aggregate: &A,
    ) -> Result<AggregateId, ApplyError>
    where
        A: Aggregate,
    {
        let failure = |detail: String| ApplyError::AggregatePersistenceFailure {
            event_type: event_type.to_string(),
            aggregate_type: A::AGGREGATE_TYPE,
            aggregate_ref: aggregate.id(),
            detail,
        };

        aggregate.validate().map_err(|e| failure(e.to_string()))?;
        let state = serde_json::to_value(aggregate).map_err(|e| failure(e.to_string()))?;

        let saved = match aggregate.id() {
            Some(id) => tx.update_aggregate(A::TABLE, id, state).await.map(|()| id),
            None => tx.insert_aggregate(A::TABLE, state).await,
        };

        saved.map_err(|e| match e {
            StoreError::Constraint(_) | StoreError::NotFound { .. } | StoreError::Serialization(_) => {
                failure(e.to_string())
            }
            e => ApplyError::store(event_type, aggregate.id(), e),
        })
    }

    /// Persisted events of one aggregate, in insertion order.
    ///
    /// `E` selects the binding (events table and reference column); the
    /// result holds every event type stored for the aggregate.
    #[instrument(skip(self), fields(event_type = E::EVENT_TYPE), err)]
    pub async fn history<E>(&self, aggregate_ref: AggregateId) -> Result<Vec<StoredEvent>, StoreError>
    where
        E: Event + AggregateBinding,
    {
        let mut tx = self.store.begin().await?;
        let events = tx
            .load_events(&BindingInfo::of::<E>(), aggregate_ref)
            .await;
        tx.rollback().await?;
        events
    }

    /// Current committed state of an aggregate.
    #[instrument(skip(self), fields(aggregate_type = A::AGGREGATE_TYPE), err)]
    pub async fn load<A>(&self, id: AggregateId) -> Result<Option<A>, StoreError>
    where
        A: Aggregate,
    {
        let mut tx = self.store.begin().await?;
        let row = tx.find_aggregate(A::TABLE, id).await;
        tx.rollback().await?;
        row?.map(|r| r.decode::<A>()).transpose()
    }
}

fn record_error(event_type: &str, aggregate_ref: AggregateId, err: RecordError) -> ApplyError {
    match err {
        RecordError::Persisted(id) => ApplyError::AlreadyPersisted {
            event_type: event_type.to_string(),
            aggregate_ref: Some(aggregate_ref),
            id,
        },
        other => ApplyError::store(
            event_type,
            Some(aggregate_ref),
            StoreError::Serialization(other.to_string()),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use keel_core::DomainResult;
    use keel_events::{define_event, EventRecord, PayloadSchema};
    use serde::{Deserialize, Serialize};
    use serde_json::Value as JsonValue;

    use crate::store::{AggregateRow, InMemoryRecordStore, InMemoryTransaction};

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Wallet {
        #[serde(skip)]
        id: Option<AggregateId>,
        owner: String,
        balance: i64,
    }

    impl Aggregate for Wallet {
        const AGGREGATE_TYPE: &'static str = "wallet";
        const TABLE: &'static str = "wallets";

        fn id(&self) -> Option<AggregateId> {
            self.id
        }

        fn assign_id(&mut self, id: AggregateId) {
            self.id = Some(id);
        }

        fn validate(&self) -> DomainResult<()> {
            if self.owner.trim().is_empty() {
                return Err(DomainError::validation("owner cannot be empty"));
            }
            Ok(())
        }
    }

    define_event! {
        struct WalletOpened for Wallet {
            reference_field: "wallet_id",
            events_table: "wallet_events",
            payload {
                owner, set_owner: String,
            }
        }
    }

    impl Apply for WalletOpened {
        fn apply(&self, mut wallet: Wallet) -> DomainResult<Wallet> {
            wallet.owner = self.owner().map_err(|e| DomainError::validation(e.to_string()))?.unwrap_or_default();
            Ok(wallet)
        }
    }

    define_event! {
        struct Deposited for Wallet {
            reference_field: "wallet_id",
            events_table: "wallet_events",
            payload {
                amount, set_amount: i64,
            }
        }
    }

    impl Apply for Deposited {
        fn apply(&self, mut wallet: Wallet) -> DomainResult<Wallet> {
            let amount = self.amount().map_err(|e| DomainError::validation(e.to_string()))?.unwrap_or(0);
            if amount < 0 {
                return Err(DomainError::invariant("balance would go negative"));
            }
            wallet.balance += amount;
            Ok(wallet)
        }
    }

    define_event! {
        struct WalletAudited for Wallet {
            reference_field: "wallet_id",
            events_table: "wallet_events",
            payload {}
        }
    }

    impl Apply for WalletAudited {}

    fn opened(owner: &str) -> WalletOpened {
        let mut event = WalletOpened::new();
        event.set_owner(owner.to_string()).unwrap();
        event
    }

    fn deposited(id: AggregateId, amount: i64) -> Deposited {
        let mut event = Deposited::for_aggregate(id);
        event.set_amount(amount).unwrap();
        event
    }

    async fn open_wallet<S: RecordStore>(applier: &EventApplier<S>, owner: &str) -> AggregateId {
        applier
            .apply(opened(owner))
            .await
            .unwrap()
            .aggregate
            .id
            .unwrap()
    }

    /// Store wrapper that records the order of store operations.
    #[derive(Debug, Clone, Default)]
    struct RecordingStore {
        inner: InMemoryRecordStore,
        log: Arc<Mutex<Vec<&'static str>>>,
        gate: Option<Arc<CommitGate>>,
    }

    /// Holds a transaction at commit until released.
    #[derive(Debug, Default)]
    struct CommitGate {
        reached: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    impl RecordingStore {
        fn take_log(&self) -> Vec<&'static str> {
            std::mem::take(&mut *self.log.lock().unwrap())
        }
    }

    struct RecordingTransaction {
        inner: InMemoryTransaction,
        log: Arc<Mutex<Vec<&'static str>>>,
        gate: Option<Arc<CommitGate>>,
    }

    impl RecordingTransaction {
        fn note(&self, op: &'static str) {
            self.log.lock().unwrap().push(op);
        }
    }

    #[async_trait]
    impl RecordStore for RecordingStore {
        type Transaction = RecordingTransaction;

        async fn begin(&self) -> Result<Self::Transaction, StoreError> {
            self.log.lock().unwrap().push("begin");
            Ok(RecordingTransaction {
                inner: self.inner.begin().await?,
                log: self.log.clone(),
                gate: self.gate.clone(),
            })
        }
    }

    #[async_trait]
    impl StoreTransaction for RecordingTransaction {
        async fn find_aggregate(
            &mut self,
            table: &'static str,
            id: AggregateId,
        ) -> Result<Option<AggregateRow>, StoreError> {
            self.note("find_aggregate");
            self.inner.find_aggregate(table, id).await
        }

        async fn lock_aggregate(
            &mut self,
            table: &'static str,
            id: AggregateId,
            timeout: Duration,
        ) -> Result<AggregateRow, StoreError> {
            self.note("lock_aggregate");
            self.inner.lock_aggregate(table, id, timeout).await
        }

        async fn insert_aggregate(
            &mut self,
            table: &'static str,
            state: JsonValue,
        ) -> Result<AggregateId, StoreError> {
            self.note("insert_aggregate");
            self.inner.insert_aggregate(table, state).await
        }

        async fn update_aggregate(
            &mut self,
            table: &'static str,
            id: AggregateId,
            state: JsonValue,
        ) -> Result<(), StoreError> {
            self.note("update_aggregate");
            self.inner.update_aggregate(table, id, state).await
        }

        async fn insert_event(
            &mut self,
            binding: &BindingInfo,
            event: NewEvent,
        ) -> Result<StoredEvent, StoreError> {
            self.note("insert_event");
            self.inner.insert_event(binding, event).await
        }

        async fn load_events(
            &mut self,
            binding: &BindingInfo,
            aggregate_ref: AggregateId,
        ) -> Result<Vec<StoredEvent>, StoreError> {
            self.note("load_events");
            self.inner.load_events(binding, aggregate_ref).await
        }

        async fn commit(self) -> Result<(), StoreError> {
            self.note("commit");
            if let Some(gate) = &self.gate {
                gate.reached.notify_one();
                gate.release.notified().await;
            }
            self.inner.commit().await
        }

        async fn rollback(self) -> Result<(), StoreError> {
            self.note("rollback");
            self.inner.rollback().await
        }
    }

    /// Event whose rule observes whether the wallet row is locked while it runs.
    #[derive(Debug, Default)]
    struct LockProbe {
        record: EventRecord,
        store: InMemoryRecordStore,
        saw_lock: Arc<AtomicBool>,
    }

    impl Event for LockProbe {
        const EVENT_TYPE: &'static str = "LockProbe";

        fn payload_schema() -> PayloadSchema {
            PayloadSchema::new()
        }

        fn from_record(record: EventRecord) -> Self {
            Self {
                record,
                ..Self::default()
            }
        }

        fn record(&self) -> &EventRecord {
            &self.record
        }

        fn record_mut(&mut self) -> &mut EventRecord {
            &mut self.record
        }

        fn into_record(self) -> EventRecord {
            self.record
        }
    }

    impl AggregateBinding for LockProbe {
        type Aggregate = Wallet;
        const REFERENCE_FIELD: &'static str = "wallet_id";
        const EVENTS_TABLE: &'static str = "wallet_events";
    }

    impl Apply for LockProbe {
        fn apply(&self, wallet: Wallet) -> DomainResult<Wallet> {
            if let Some(id) = wallet.id {
                self.saw_lock
                    .store(self.store.is_locked(Wallet::TABLE, id), Ordering::SeqCst);
            }
            Ok(wallet)
        }
    }

    #[tokio::test]
    async fn absent_reference_creates_aggregate_and_backfills_event() {
        let store = InMemoryRecordStore::new();
        let applier = EventApplier::new(store.clone());

        let applied = applier.apply(opened("ada")).await.unwrap();

        let id = applied.aggregate.id.expect("saved aggregate has an id");
        assert_eq!(applied.aggregate.owner, "ada");
        assert_eq!(applied.event.aggregate_ref(), Some(id));
        assert_eq!(applied.stored.aggregate_ref, id);
        assert_eq!(applied.stored.event_type, "WalletOpened");
        assert_eq!(applied.event.record().id(), Some(applied.stored.id));
        assert_eq!(applied.event.record().created_at(), Some(applied.stored.created_at));

        let rows = store.events("wallet_events");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].aggregate_ref, id);
        assert_eq!(
            store.aggregate_state("wallets", id).unwrap()["owner"],
            "ada"
        );
    }

    #[tokio::test]
    async fn creation_never_reads_and_backfills_before_insert() {
        let store = RecordingStore::default();
        let applier = EventApplier::new(store.clone());

        applier.apply(opened("ada")).await.unwrap();

        assert_eq!(
            store.take_log(),
            vec!["begin", "insert_aggregate", "insert_event", "commit"]
        );
    }

    #[tokio::test]
    async fn present_reference_loads_once_then_locks_before_saving() {
        let store = RecordingStore::default();
        let applier = EventApplier::new(store.clone());
        let id = open_wallet(&applier, "ada").await;
        store.take_log();

        let applied = applier.apply(deposited(id, 10)).await.unwrap();
        assert_eq!(applied.aggregate.balance, 10);

        assert_eq!(
            store.take_log(),
            vec![
                "begin",
                "find_aggregate",
                "lock_aggregate",
                "update_aggregate",
                "insert_event",
                "commit"
            ]
        );
    }

    #[tokio::test]
    async fn rule_runs_while_the_row_lock_is_held() {
        let store = InMemoryRecordStore::new();
        let applier = EventApplier::new(store.clone());
        let id = open_wallet(&applier, "ada").await;

        let probe = LockProbe {
            record: EventRecord::for_aggregate(id),
            store: store.clone(),
            saw_lock: Arc::new(AtomicBool::new(false)),
        };
        let saw_lock = probe.saw_lock.clone();

        applier.apply(probe).await.unwrap();

        assert!(saw_lock.load(Ordering::SeqCst));
        assert!(!store.is_locked(Wallet::TABLE, id));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_applications_on_one_aggregate_serialize() {
        let store = InMemoryRecordStore::new();
        let applier = Arc::new(EventApplier::new(store.clone()));
        let id = open_wallet(&*applier, "ada").await;

        let tasks: Vec<_> = (0..20)
            .map(|_| {
                let applier = applier.clone();
                tokio::spawn(async move { applier.apply(deposited(id, 5)).await.map(|_| ()) })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let wallet = applier.load::<Wallet>(id).await.unwrap().unwrap();
        assert_eq!(wallet.balance, 100);
        assert_eq!(applier.history::<Deposited>(id).await.unwrap().len(), 21);
    }

    #[tokio::test]
    async fn rejected_rule_rolls_back_everything() {
        let store = RecordingStore::default();
        let applier = EventApplier::new(store.clone());
        let id = open_wallet(&applier, "ada").await;
        applier.apply(deposited(id, 7)).await.unwrap();
        store.take_log();

        let err = applier.apply(deposited(id, -50)).await.unwrap_err();
        assert!(matches!(err, ApplyError::Rejected { ref event_type, .. } if event_type == "Deposited"));
        assert_eq!(store.take_log().last(), Some(&"rollback"));

        let wallet = applier.load::<Wallet>(id).await.unwrap().unwrap();
        assert_eq!(wallet.balance, 7);
        assert_eq!(store.inner.events("wallet_events").len(), 2);
        assert!(!store.inner.is_locked(Wallet::TABLE, id));
    }

    #[tokio::test]
    async fn unknown_reference_is_aggregate_not_found() {
        let store = InMemoryRecordStore::new();
        let applier = EventApplier::new(store.clone());
        let missing = AggregateId::new();

        let err = applier.apply(deposited(missing, 1)).await.unwrap_err();
        assert!(matches!(
            err,
            ApplyError::AggregateNotFound { aggregate_type: "wallet", aggregate_ref, .. } if aggregate_ref == missing
        ));
        assert!(store.events("wallet_events").is_empty());
    }

    #[tokio::test]
    async fn missing_rule_is_apply_not_implemented() {
        let store = InMemoryRecordStore::new();
        let applier = EventApplier::new(store.clone());
        let id = open_wallet(&applier, "ada").await;

        let err = applier
            .apply(WalletAudited::for_aggregate(id))
            .await
            .unwrap_err();
        assert!(matches!(err, ApplyError::ApplyNotImplemented { ref event_type, .. } if event_type == "WalletAudited"));
        assert_eq!(err.aggregate_ref(), Some(id));
        assert_eq!(store.events("wallet_events").len(), 1);
    }

    #[tokio::test]
    async fn invalid_state_is_a_persistence_failure() {
        let store = InMemoryRecordStore::new();
        let applier = EventApplier::new(store.clone());

        let err = applier.apply(opened("   ")).await.unwrap_err();
        assert!(matches!(err, ApplyError::AggregatePersistenceFailure { aggregate_ref: None, .. }));
        assert_eq!(store.aggregate_count("wallets"), 0);
        assert!(store.events("wallet_events").is_empty());
    }

    #[tokio::test]
    async fn unique_violation_is_a_persistence_failure() {
        let store = InMemoryRecordStore::new().with_unique_field("wallets", "owner");
        let applier = EventApplier::new(store.clone());
        open_wallet(&applier, "ada").await;

        let err = applier.apply(opened("ada")).await.unwrap_err();
        assert!(matches!(err, ApplyError::AggregatePersistenceFailure { .. }));
        assert_eq!(store.aggregate_count("wallets"), 1);
        assert_eq!(store.events("wallet_events").len(), 1);
    }

    #[tokio::test]
    async fn blocked_lock_times_out() {
        let store = InMemoryRecordStore::new();
        let config = ApplierConfig::default().with_lock_timeout(Duration::from_millis(50));
        let applier = EventApplier::with_config(store.clone(), config);
        let id = open_wallet(&applier, "ada").await;

        let mut holder = store.begin().await.unwrap();
        holder
            .lock_aggregate(Wallet::TABLE, id, Duration::from_secs(1))
            .await
            .unwrap();

        let err = applier.apply(deposited(id, 1)).await.unwrap_err();
        assert!(matches!(err, ApplyError::LockTimeout { aggregate_ref, .. } if aggregate_ref == id));
        assert!(err.is_retryable());

        holder.rollback().await.unwrap();
        applier.apply(deposited(id, 1)).await.unwrap();
    }

    #[tokio::test]
    async fn persisted_events_cannot_be_applied_again() {
        let applier = EventApplier::new(InMemoryRecordStore::new());
        let id = open_wallet(&applier, "ada").await;

        let applied = applier.apply(deposited(id, 3)).await.unwrap();
        let err = applier.apply(applied.event).await.unwrap_err();
        assert!(matches!(err, ApplyError::AlreadyPersisted { id, .. } if id == applied.stored.id));
    }

    #[tokio::test]
    async fn registry_rejects_unregistered_event_types() {
        let mut registry = EventRegistry::new();
        registry.register::<WalletOpened>().unwrap();
        let applier = EventApplier::new(InMemoryRecordStore::new()).with_registry(Arc::new(registry));

        let id = open_wallet(&applier, "ada").await;
        let err = applier.apply(deposited(id, 1)).await.unwrap_err();
        assert!(matches!(err, ApplyError::MissingAggregateBinding { ref event_type } if event_type == "Deposited"));
    }

    #[tokio::test]
    async fn explicit_event_type_is_stored() {
        let store = InMemoryRecordStore::new();
        let applier = EventApplier::new(store.clone());
        let id = open_wallet(&applier, "ada").await;

        let applied = applier
            .apply(deposited(id, 2).with_event_type("wallet.deposited"))
            .await
            .unwrap();
        assert_eq!(applied.stored.event_type, "wallet.deposited");
        assert_eq!(applied.event.event_type(), "wallet.deposited");
    }

    #[tokio::test]
    async fn history_lists_the_aggregate_stream_in_order() {
        let applier = EventApplier::new(InMemoryRecordStore::new());
        let id = open_wallet(&applier, "ada").await;
        let other = open_wallet(&applier, "grace").await;
        applier.apply(deposited(id, 1)).await.unwrap();
        applier.apply(deposited(other, 9)).await.unwrap();
        applier.apply(deposited(id, 2)).await.unwrap();

        let history = applier.history::<Deposited>(id).await.unwrap();
        let types: Vec<_> = history.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(types, vec!["WalletOpened", "Deposited", "Deposited"]);

        let last: Deposited = history[2].to_event();
        assert_eq!(last.amount().unwrap(), Some(2));
        assert!(last.record().is_persisted());
    }

    #[tokio::test]
    async fn unique_conflict_found_at_commit_is_a_persistence_failure() {
        let inner = InMemoryRecordStore::new().with_unique_field("wallets", "owner");
        let gate = Arc::new(CommitGate::default());
        let gated = EventApplier::new(RecordingStore {
            inner: inner.clone(),
            gate: Some(gate.clone()),
            ..RecordingStore::default()
        });
        let plain = EventApplier::new(inner.clone());

        let first = tokio::spawn(async move { gated.apply(opened("ada")).await.map(|_| ()) });
        gate.reached.notified().await;
        let winner = open_wallet(&plain, "ada").await;
        gate.release.notify_one();

        let err = first.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            ApplyError::AggregatePersistenceFailure { aggregate_type: "wallet", aggregate_ref: Some(_), .. }
        ));
        assert!(!err.is_retryable());
        assert_eq!(inner.aggregate_count("wallets"), 1);
        assert_eq!(inner.events("wallet_events").len(), 1);
        assert_eq!(inner.events("wallet_events")[0].aggregate_ref, winner);
    }

    #[tokio::test]
    async fn rejections_name_the_target_aggregate() {
        let applier = EventApplier::new(InMemoryRecordStore::new());
        let id = open_wallet(&applier, "ada").await;

        let err = applier.apply(deposited(id, -1)).await.unwrap_err();
        assert!(matches!(err, ApplyError::Rejected { aggregate_ref: Some(r), .. } if r == id));
        assert!(err.to_string().contains(&id.to_string()));

        let applied = applier.apply(deposited(id, 1)).await.unwrap();
        let err = applier.apply(applied.event).await.unwrap_err();
        assert_eq!(err.aggregate_ref(), Some(id));
    }

    #[tokio::test]
    async fn failed_run_reports_the_last_stage_reached() {
        let store = InMemoryRecordStore::new();
        let applier = EventApplier::new(store.clone());
        let id = open_wallet(&applier, "ada").await;

        let mut stage = ApplyStage::Draft;
        let mut tx = store.begin().await.unwrap();
        applier
            .run(&mut tx, &mut deposited(id, -1), &mut stage)
            .await
            .unwrap_err();
        tx.rollback().await.unwrap();
        assert_eq!(stage, ApplyStage::Locked);

        let mut stage = ApplyStage::Draft;
        let mut tx = store.begin().await.unwrap();
        applier
            .run(&mut tx, &mut opened("  "), &mut stage)
            .await
            .unwrap_err();
        tx.rollback().await.unwrap();
        assert_eq!(stage, ApplyStage::Applied);

        let mut stage = ApplyStage::Draft;
        let mut tx = store.begin().await.unwrap();
        applier
            .run(&mut tx, &mut deposited(AggregateId::new(), 1), &mut stage)
            .await
            .unwrap_err();
        tx.rollback().await.unwrap();
        assert_eq!(stage, ApplyStage::Draft);
    }
}
