use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use keel_core::{AggregateId, EventId};

use crate::payload::Payload;

/// Errors raised while reading or writing an event record.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("payload field '{field}' could not be decoded: {source}")]
    Decode {
        field: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("payload field '{field}' could not be encoded: {source}")]
    Encode {
        field: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("payload must be a JSON object, got {0}")]
    NotAnObject(&'static str),

    /// Persisted events are append-only facts.
    #[error("event {0} is already persisted and cannot be modified")]
    Persisted(EventId),
}

/// The generic event row every concrete event type wraps.
///
/// A record starts as a draft (no `id`, no `created_at`) with an empty
/// payload. The record store fills in identity and timestamp when it inserts
/// the row; from then on the payload and aggregate reference are frozen.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    id: Option<EventId>,
    event_type: Option<String>,
    payload: Payload,
    aggregate_ref: Option<AggregateId>,
    created_at: Option<DateTime<Utc>>,
}

impl EventRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Draft record targeting an existing aggregate.
    pub fn for_aggregate(aggregate_ref: AggregateId) -> Self {
        Self {
            aggregate_ref: Some(aggregate_ref),
            ..Self::default()
        }
    }

    /// Rebuild a record from persisted columns.
    pub fn persisted(
        id: EventId,
        event_type: impl Into<String>,
        payload: Payload,
        aggregate_ref: AggregateId,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Some(id),
            event_type: Some(event_type.into()),
            payload,
            aggregate_ref: Some(aggregate_ref),
            created_at: Some(created_at),
        }
    }

    #[must_use]
    pub fn with_event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    #[must_use]
    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    pub fn id(&self) -> Option<EventId> {
        self.id
    }

    pub fn is_persisted(&self) -> bool {
        self.id.is_some()
    }

    /// The explicitly assigned event type, if any.
    pub fn explicit_event_type(&self) -> Option<&str> {
        self.event_type.as_deref()
    }

    /// The explicit event type, or `default` when none was assigned.
    pub fn event_type_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.event_type.as_deref().unwrap_or(default)
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> Result<&mut Payload, RecordError> {
        self.ensure_draft()?;
        Ok(&mut self.payload)
    }

    pub fn aggregate_ref(&self) -> Option<AggregateId> {
        self.aggregate_ref
    }

    pub fn set_aggregate_ref(&mut self, aggregate_ref: AggregateId) -> Result<(), RecordError> {
        self.ensure_draft()?;
        self.aggregate_ref = Some(aggregate_ref);
        Ok(())
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    /// Stamp identity and creation time once the row has been inserted.
    ///
    /// A record is stamped at most once; a second call fails with
    /// [`RecordError::Persisted`] and leaves the first stamp in place.
    pub fn mark_persisted(
        &mut self,
        id: EventId,
        created_at: DateTime<Utc>,
    ) -> Result<(), RecordError> {
        self.ensure_draft()?;
        self.id = Some(id);
        self.created_at = Some(created_at);
        Ok(())
    }

    fn ensure_draft(&self) -> Result<(), RecordError> {
        match self.id {
            Some(id) => Err(RecordError::Persisted(id)),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn draft_has_empty_payload_and_no_identity() {
        let record = EventRecord::new();
        assert!(record.payload().is_empty());
        assert_eq!(record.id(), None);
        assert_eq!(record.aggregate_ref(), None);
        assert_eq!(record.created_at(), None);
    }

    #[test]
    fn event_type_falls_back_to_default() {
        let record = EventRecord::new();
        assert_eq!(record.event_type_or("UserCreated"), "UserCreated");

        let record = record.with_event_type("Registered");
        assert_eq!(record.event_type_or("UserCreated"), "Registered");
    }

    #[test]
    fn persisted_record_is_frozen() {
        let mut record = EventRecord::new();
        let id = EventId::new();
        record.set_aggregate_ref(AggregateId::new()).unwrap();
        record.mark_persisted(id, Utc::now()).unwrap();

        assert!(matches!(record.payload_mut(), Err(RecordError::Persisted(e)) if e == id));
        assert!(matches!(
            record.set_aggregate_ref(AggregateId::new()),
            Err(RecordError::Persisted(_))
        ));
    }

    #[test]
    fn persisted_record_cannot_be_restamped() {
        let mut record = EventRecord::new();
        let id = EventId::new();
        let created_at = Utc::now();
        record.mark_persisted(id, created_at).unwrap();

        let err = record.mark_persisted(EventId::new(), Utc::now()).unwrap_err();
        assert!(matches!(err, RecordError::Persisted(e) if e == id));
        assert_eq!(record.id(), Some(id));
        assert_eq!(record.created_at(), Some(created_at));
    }
}
