//! Aggregate contract for event-applied domain models.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::DomainResult;
use crate::id::AggregateId;

/// A mutable domain entity that only ever changes through event application.
///
/// The attribute set is persisted as a serialized document next to the
/// aggregate's identity, so implementations keep the id out of their serde
/// representation (`#[serde(skip)]`) and hand it back through [`Aggregate::id`]
/// and [`Aggregate::assign_id`].
///
/// `Default` is the "new, unsaved" instance the resolver builds when an event
/// carries no aggregate reference.
pub trait Aggregate:
    Clone + Default + core::fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Stable aggregate type name (e.g. `"user"`).
    const AGGREGATE_TYPE: &'static str;

    /// Record table owned by this aggregate (e.g. `"users"`).
    const TABLE: &'static str;

    /// Identity assigned on first save; `None` while the aggregate is new.
    fn id(&self) -> Option<AggregateId>;

    /// Attach the identity loaded from, or assigned by, the record store.
    fn assign_id(&mut self, id: AggregateId);

    /// Whether this instance already has a row in the store.
    fn is_persisted(&self) -> bool {
        self.id().is_some()
    }

    /// Check the attribute set before it is saved.
    ///
    /// A failure here aborts the whole application; nothing is written.
    fn validate(&self) -> DomainResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DomainError;
    use serde::Deserialize;

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    struct Counter {
        #[serde(skip)]
        id: Option<AggregateId>,
        value: i64,
    }

    impl Aggregate for Counter {
        const AGGREGATE_TYPE: &'static str = "counter";
        const TABLE: &'static str = "counters";

        fn id(&self) -> Option<AggregateId> {
            self.id
        }

        fn assign_id(&mut self, id: AggregateId) {
            self.id = Some(id);
        }

        fn validate(&self) -> DomainResult<()> {
            if self.value < 0 {
                return Err(DomainError::validation("value must not be negative"));
            }
            Ok(())
        }
    }

    #[test]
    fn default_instance_is_not_persisted() {
        let counter = Counter::default();
        assert!(!counter.is_persisted());
    }

    #[test]
    fn assigned_id_marks_instance_persisted() {
        let mut counter = Counter::default();
        let id = AggregateId::new();
        counter.assign_id(id);
        assert!(counter.is_persisted());
        assert_eq!(counter.id(), Some(id));
    }

    #[test]
    fn identity_is_not_part_of_the_state_document() {
        let mut counter = Counter { value: 3, ..Default::default() };
        counter.assign_id(AggregateId::new());
        let state = serde_json::to_value(&counter).unwrap();
        assert_eq!(state, serde_json::json!({ "value": 3 }));
    }

    #[test]
    fn validate_reports_domain_error() {
        let counter = Counter { value: -1, ..Default::default() };
        assert!(matches!(counter.validate(), Err(DomainError::Validation(_))));
    }
}
