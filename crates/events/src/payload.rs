//! Event payloads: the structured field set every event record carries.
//!
//! A [`Payload`] is a plain JSON object keyed by field name. Concrete event
//! types never touch it by key directly; `define_event!` generates typed
//! accessors for the fields declared in the type's [`PayloadSchema`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::record::RecordError;

/// Field name → value mapping attached to an event record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(Map<String, JsonValue>);

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a payload from a JSON document, which must be an object.
    pub fn from_value(value: JsonValue) -> Result<Self, RecordError> {
        match value {
            JsonValue::Object(map) => Ok(Self(map)),
            JsonValue::Null => Ok(Self::default()),
            other => Err(RecordError::NotAnObject(json_kind(&other))),
        }
    }

    pub fn into_value(self) -> JsonValue {
        JsonValue::Object(self.0)
    }

    pub fn get(&self, field: &str) -> Option<&JsonValue> {
        self.0.get(field)
    }

    pub fn set(&mut self, field: impl Into<String>, value: JsonValue) {
        self.0.insert(field.into(), value);
    }

    /// Decode a field into `T`. Missing and `null` fields both read as `None`.
    pub fn get_as<T>(&self, field: &str) -> Result<Option<T>, RecordError>
    where
        T: DeserializeOwned,
    {
        match self.0.get(field) {
            None | Some(JsonValue::Null) => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|source| RecordError::Decode {
                    field: field.to_string(),
                    source,
                }),
        }
    }

    pub fn set_as<T>(&mut self, field: &str, value: &T) -> Result<(), RecordError>
    where
        T: Serialize + ?Sized,
    {
        let encoded = serde_json::to_value(value).map_err(|source| RecordError::Encode {
            field: field.to_string(),
            source,
        })?;
        self.0.insert(field.to_string(), encoded);
        Ok(())
    }

    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Map<String, JsonValue>> for Payload {
    fn from(value: Map<String, JsonValue>) -> Self {
        Self(value)
    }
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

/// Ordered set of payload field names declared by one event type.
///
/// Declaring a name that is already present is a no-op, so the schema never
/// holds duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PayloadSchema {
    fields: Vec<&'static str>,
}

impl PayloadSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_fields(fields: &[&'static str]) -> Self {
        fields
            .iter()
            .copied()
            .fold(Self::new(), |schema, field| schema.declare(field))
    }

    #[must_use]
    pub fn declare(mut self, field: &'static str) -> Self {
        if !self.fields.contains(&field) {
            self.fields.push(field);
        }
        self
    }

    pub fn fields(&self) -> &[&'static str] {
        &self.fields
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.iter().any(|f| *f == field)
    }

    /// Payload keys that this schema does not declare.
    pub fn undeclared<'a>(&self, payload: &'a Payload) -> Vec<&'a str> {
        payload.fields().filter(|f| !self.contains(f)).collect()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}
