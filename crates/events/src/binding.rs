//! Static event → aggregate bindings.

use keel_core::Aggregate;

use crate::event::Event;

/// Declares which aggregate type an event type mutates and how the event row
/// references it.
///
/// The binding is a property of the event *type*: every instance of the type
/// targets the same aggregate type through the same reference column.
pub trait AggregateBinding {
    type Aggregate: Aggregate;

    /// Column on the event row holding the aggregate's id (e.g. `"user_id"`).
    const REFERENCE_FIELD: &'static str;

    /// Table the event rows are appended to (e.g. `"user_events"`).
    const EVENTS_TABLE: &'static str;
}

/// Type-erased view of a binding, as stored in the [`crate::EventRegistry`]
/// and handed to record stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindingInfo {
    pub event_type: &'static str,
    pub aggregate_type: &'static str,
    pub aggregate_table: &'static str,
    pub reference_field: &'static str,
    pub events_table: &'static str,
}

impl BindingInfo {
    pub fn of<E>() -> Self
    where
        E: Event + AggregateBinding,
    {
        Self {
            event_type: E::EVENT_TYPE,
            aggregate_type: <E::Aggregate as Aggregate>::AGGREGATE_TYPE,
            aggregate_table: <E::Aggregate as Aggregate>::TABLE,
            reference_field: E::REFERENCE_FIELD,
            events_table: E::EVENTS_TABLE,
        }
    }

    /// Whether two bindings write to the same aggregate and event tables.
    pub fn same_target(&self, other: &BindingInfo) -> bool {
        self.aggregate_type == other.aggregate_type
            && self.aggregate_table == other.aggregate_table
            && self.reference_field == other.reference_field
            && self.events_table == other.events_table
    }
}
