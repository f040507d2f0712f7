//! Apply engine error taxonomy.

use std::time::Duration;

use thiserror::Error;

use keel_core::{AggregateId, DomainError, EventId};
use keel_events::{BindingInfo, RegistryError};

use crate::store::StoreError;

/// Failure of one event application.
///
/// Every variant means the transaction was rolled back: no aggregate write
/// and no event row from the attempt is visible. The engine never retries.
#[derive(Debug, Error)]
pub enum ApplyError {
    /// The event type has no registered aggregate binding.
    #[error("event type '{event_type}' has no aggregate binding")]
    MissingAggregateBinding { event_type: String },

    /// The registry binds the event type to a different target than its type does.
    #[error(
        "event type '{event_type}' is registered for '{}' but the event binds '{}'",
        .registered.aggregate_type,
        .declared.aggregate_type
    )]
    BindingMismatch {
        event_type: String,
        registered: BindingInfo,
        declared: BindingInfo,
    },

    /// Events are immutable once stored; re-applying one is refused.
    #[error("event {id} ('{event_type}') has already been persisted")]
    AlreadyPersisted {
        event_type: String,
        aggregate_ref: Option<AggregateId>,
        id: EventId,
    },

    #[error("{aggregate_type} {aggregate_ref} referenced by '{event_type}' does not exist")]
    AggregateNotFound {
        event_type: String,
        aggregate_type: &'static str,
        aggregate_ref: AggregateId,
    },

    /// The event type declares a binding but no apply rule.
    #[error("apply is not implemented for event type '{event_type}'")]
    ApplyNotImplemented {
        event_type: String,
        aggregate_ref: Option<AggregateId>,
    },

    /// The apply rule refused the change.
    #[error("'{event_type}' rejected for {}: {source}", display_ref(.aggregate_ref))]
    Rejected {
        event_type: String,
        aggregate_ref: Option<AggregateId>,
        #[source]
        source: DomainError,
    },

    /// The new aggregate state failed validation or could not be saved.
    #[error("could not persist {aggregate_type} for '{event_type}': {detail}")]
    AggregatePersistenceFailure {
        event_type: String,
        aggregate_type: &'static str,
        aggregate_ref: Option<AggregateId>,
        detail: String,
    },

    #[error("timed out after {waited:?} waiting for the lock on {aggregate_ref} ('{event_type}')")]
    LockTimeout {
        event_type: String,
        aggregate_ref: AggregateId,
        waited: Duration,
    },

    /// Backend failure outside the cases above.
    #[error("store failure while applying '{event_type}' to {}: {source}", display_ref(.aggregate_ref))]
    Store {
        event_type: String,
        aggregate_ref: Option<AggregateId>,
        #[source]
        source: StoreError,
    },
}

impl ApplyError {
    /// Event type of the failed application.
    pub fn event_type(&self) -> &str {
        match self {
            ApplyError::MissingAggregateBinding { event_type }
            | ApplyError::BindingMismatch { event_type, .. }
            | ApplyError::AlreadyPersisted { event_type, .. }
            | ApplyError::AggregateNotFound { event_type, .. }
            | ApplyError::ApplyNotImplemented { event_type, .. }
            | ApplyError::Rejected { event_type, .. }
            | ApplyError::AggregatePersistenceFailure { event_type, .. }
            | ApplyError::LockTimeout { event_type, .. }
            | ApplyError::Store { event_type, .. } => event_type,
        }
    }

    /// Aggregate the failed application targeted, when one was known.
    ///
    /// `None` only for bindings checks and for creations that failed before
    /// the new aggregate received an identity.
    pub fn aggregate_ref(&self) -> Option<AggregateId> {
        match self {
            ApplyError::MissingAggregateBinding { .. } | ApplyError::BindingMismatch { .. } => None,
            ApplyError::AggregateNotFound { aggregate_ref, .. }
            | ApplyError::LockTimeout { aggregate_ref, .. } => Some(*aggregate_ref),
            ApplyError::AlreadyPersisted { aggregate_ref, .. }
            | ApplyError::ApplyNotImplemented { aggregate_ref, .. }
            | ApplyError::Rejected { aggregate_ref, .. }
            | ApplyError::AggregatePersistenceFailure { aggregate_ref, .. }
            | ApplyError::Store { aggregate_ref, .. } => *aggregate_ref,
        }
    }

    /// Whether retrying the same event later may succeed.
    ///
    /// Only contention and backend failures qualify; everything else fails
    /// the same way every time.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ApplyError::LockTimeout { .. } | ApplyError::Store { .. }
        )
    }

    pub(crate) fn store(
        event_type: &str,
        aggregate_ref: Option<AggregateId>,
        source: StoreError,
    ) -> Self {
        match source {
            StoreError::LockTimeout { id, waited, .. } => ApplyError::LockTimeout {
                event_type: event_type.to_string(),
                aggregate_ref: id,
                waited,
            },
            source => ApplyError::Store {
                event_type: event_type.to_string(),
                aggregate_ref,
                source,
            },
        }
    }

    pub(crate) fn rejected(
        event_type: &str,
        aggregate_ref: Option<AggregateId>,
        source: DomainError,
    ) -> Self {
        match source {
            DomainError::ApplyNotImplemented(_) => ApplyError::ApplyNotImplemented {
                event_type: event_type.to_string(),
                aggregate_ref,
            },
            source => ApplyError::Rejected {
                event_type: event_type.to_string(),
                aggregate_ref,
                source,
            },
        }
    }
}

fn display_ref(aggregate_ref: &Option<AggregateId>) -> String {
    aggregate_ref.map_or_else(|| "a new aggregate".to_string(), |id| id.to_string())
}

impl From<RegistryError> for ApplyError {
    fn from(value: RegistryError) -> Self {
        match value {
            RegistryError::MissingAggregateBinding { event_type } => {
                ApplyError::MissingAggregateBinding { event_type }
            }
            RegistryError::ConflictingBinding {
                event_type,
                existing,
                attempted,
            } => ApplyError::BindingMismatch {
                event_type,
                registered: existing,
                declared: attempted,
            },
        }
    }
}
