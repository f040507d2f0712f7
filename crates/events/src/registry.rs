//! Startup-time table of event type names and their aggregate bindings.
//!
//! Typed code never needs this: the binding of `E` is `<E as AggregateBinding>`.
//! The registry serves the places that only have a type *name* in hand, such
//! as stored rows, explicitly renamed events, and configuration checks run
//! once at startup.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::binding::{AggregateBinding, BindingInfo};
use crate::event::Event;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("event type '{event_type}' has no registered aggregate binding")]
    MissingAggregateBinding { event_type: String },

    #[error(
        "event type '{event_type}' is already bound to aggregate '{}', cannot rebind to '{}'",
        .existing.aggregate_type,
        .attempted.aggregate_type
    )]
    ConflictingBinding {
        event_type: String,
        existing: BindingInfo,
        attempted: BindingInfo,
    },
}

/// Registry of event type names → [`BindingInfo`].
#[derive(Debug, Clone, Default)]
pub struct EventRegistry {
    bindings: BTreeMap<String, BindingInfo>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `E` under its default type name.
    pub fn register<E>(&mut self) -> Result<&mut Self, RegistryError>
    where
        E: Event + AggregateBinding,
    {
        self.register_as::<E>(E::EVENT_TYPE)
    }

    /// Register `E` under an explicit type name (for records whose
    /// `event_type` differs from the Rust type name).
    ///
    /// Registering the same name for the same target again is a no-op.
    pub fn register_as<E>(&mut self, event_type: impl Into<String>) -> Result<&mut Self, RegistryError>
    where
        E: Event + AggregateBinding,
    {
        let event_type = event_type.into();
        let info = BindingInfo::of::<E>();

        if let Some(existing) = self.bindings.get(&event_type) {
            if !existing.same_target(&info) {
                return Err(RegistryError::ConflictingBinding {
                    event_type,
                    existing: *existing,
                    attempted: info,
                });
            }
            return Ok(self);
        }

        self.bindings.insert(event_type, info);
        Ok(self)
    }

    pub fn binding_for(&self, event_type: &str) -> Result<&BindingInfo, RegistryError> {
        self.bindings
            .get(event_type)
            .ok_or_else(|| RegistryError::MissingAggregateBinding {
                event_type: event_type.to_string(),
            })
    }

    pub fn aggregate_type_of(&self, event_type: &str) -> Result<&'static str, RegistryError> {
        self.binding_for(event_type).map(|b| b.aggregate_type)
    }

    pub fn reference_field_of(&self, event_type: &str) -> Result<&'static str, RegistryError> {
        self.binding_for(event_type).map(|b| b.reference_field)
    }

    /// Fail on the first listed event type that has no binding.
    pub fn ensure_bound<'a>(
        &self,
        event_types: impl IntoIterator<Item = &'a str>,
    ) -> Result<(), RegistryError> {
        for event_type in event_types {
            self.binding_for(event_type)?;
        }
        Ok(())
    }

    pub fn event_types(&self) -> impl Iterator<Item = &str> {
        self.bindings.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}
