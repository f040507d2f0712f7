use keel_core::{AggregateId, DomainError, DomainResult};

use crate::binding::AggregateBinding;
use crate::payload::{Payload, PayloadSchema};
use crate::record::EventRecord;

/// A concrete event kind.
///
/// Events are:
/// - **immutable** once persisted (treat them as facts)
/// - backed by a generic [`EventRecord`]
/// - designed to be **append-only**
///
/// Implementations are normally generated by [`define_event!`](crate::define_event).
pub trait Event: core::fmt::Debug + Send + Sync + 'static {
    /// Default event type name, used when the record carries no explicit one.
    const EVENT_TYPE: &'static str;

    /// Payload fields this event type declares.
    fn payload_schema() -> PayloadSchema;

    fn from_record(record: EventRecord) -> Self;

    fn record(&self) -> &EventRecord;

    fn record_mut(&mut self) -> &mut EventRecord;

    fn into_record(self) -> EventRecord;

    /// Stable event name/type identifier.
    fn event_type(&self) -> &str {
        self.record().event_type_or(Self::EVENT_TYPE)
    }

    fn payload(&self) -> &Payload {
        self.record().payload()
    }

    fn aggregate_ref(&self) -> Option<AggregateId> {
        self.record().aggregate_ref()
    }
}

/// The domain rule `(current state, event) -> new state` for one event type.
///
/// This is the only place business rules live. The default body exists so
/// the binding can be declared before the rule is written; reaching it is a
/// programming error reported as [`DomainError::ApplyNotImplemented`].
pub trait Apply: Event + AggregateBinding {
    fn apply(&self, aggregate: Self::Aggregate) -> DomainResult<Self::Aggregate> {
        let _ = aggregate;
        Err(DomainError::apply_not_implemented(self.event_type()))
    }
}
