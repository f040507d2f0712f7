//! Aggregate resolution: find the aggregate an event targets, or start a new one.

use keel_core::Aggregate;
use keel_events::{AggregateBinding, Event};

use crate::error::ApplyError;
use crate::store::StoreTransaction;

/// Outcome of resolving an event's target aggregate.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution<A> {
    /// Loaded from the store by the event's aggregate reference.
    Found(A),
    /// Freshly constructed with default state and no identity.
    Built(A),
}

impl<A> Resolution<A> {
    pub fn is_found(&self) -> bool {
        matches!(self, Resolution::Found(_))
    }

    pub fn into_inner(self) -> A {
        match self {
            Resolution::Found(a) | Resolution::Built(a) => a,
        }
    }
}

/// Resolve the aggregate `event` targets inside `tx`.
///
/// With an aggregate reference this is one plain read of the bound aggregate
/// table; a missing row is [`ApplyError::AggregateNotFound`]. Without one,
/// nothing is read and a default aggregate is built.
pub async fn resolve<E, T>(tx: &mut T, event: &E) -> Result<Resolution<E::Aggregate>, ApplyError>
where
    E: Event + AggregateBinding,
    T: StoreTransaction,
{
    let Some(aggregate_ref) = event.aggregate_ref() else {
        return Ok(Resolution::Built(E::Aggregate::default()));
    };

    let table = <E::Aggregate as Aggregate>::TABLE;
    let row = tx
        .find_aggregate(table, aggregate_ref)
        .await
        .map_err(|e| ApplyError::store(event.event_type(), Some(aggregate_ref), e))?
        .ok_or_else(|| ApplyError::AggregateNotFound {
            event_type: event.event_type().to_string(),
            aggregate_type: <E::Aggregate as Aggregate>::AGGREGATE_TYPE,
            aggregate_ref,
        })?;

    let aggregate = row
        .decode::<E::Aggregate>()
        .map_err(|e| ApplyError::store(event.event_type(), Some(aggregate_ref), e))?;

    Ok(Resolution::Found(aggregate))
}
