//! Declarative event definitions.

/// Define a concrete event type: its record wrapper, typed payload
/// accessors, and its aggregate binding.
///
/// Each payload entry names the getter (which is also the payload key), the
/// setter, and the field type. Only declared fields get accessors, so reading
/// an undeclared field through the event type does not compile.
///
/// ```ignore
/// define_event! {
///     /// A user was registered.
///     pub struct UserCreated for User {
///         reference_field: "user_id",
///         events_table: "user_events",
///         payload {
///             name, set_name: String,
///             email, set_email: String,
///         }
///     }
/// }
///
/// let mut event = UserCreated::new();
/// event.set_name("Alice".to_string())?;
/// assert_eq!(event.name()?, Some("Alice".to_string()));
/// ```
///
/// The `Apply` impl (the domain rule) is written by hand next to the definition.
#[macro_export]
macro_rules! define_event {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident for $aggregate:ty {
            reference_field: $reference:literal,
            events_table: $table:literal,
            payload {
                $(
                    $(#[$field_meta:meta])*
                    $getter:ident, $setter:ident : $ty:ty
                ),* $(,)?
            }
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq)]
        $vis struct $name {
            record: $crate::EventRecord,
        }

        #[allow(dead_code)]
        impl $name {
            /// Draft event with an empty payload and no aggregate reference.
            pub fn new() -> Self {
                Self::default()
            }

            /// Draft event targeting an existing aggregate.
            pub fn for_aggregate(aggregate_ref: $crate::__core::AggregateId) -> Self {
                Self {
                    record: $crate::EventRecord::for_aggregate(aggregate_ref),
                }
            }

            #[must_use]
            pub fn with_event_type(mut self, event_type: impl Into<String>) -> Self {
                self.record = self.record.with_event_type(event_type);
                self
            }

            $(
                $(#[$field_meta])*
                pub fn $getter(&self) -> Result<Option<$ty>, $crate::RecordError> {
                    self.record.payload().get_as::<$ty>(stringify!($getter))
                }

                pub fn $setter(&mut self, value: $ty) -> Result<(), $crate::RecordError> {
                    self.record.payload_mut()?.set_as(stringify!($getter), &value)
                }
            )*
        }

        impl $crate::Event for $name {
            const EVENT_TYPE: &'static str = stringify!($name);

            fn payload_schema() -> $crate::PayloadSchema {
                $crate::PayloadSchema::from_fields(&[$(stringify!($getter)),*])
            }

            fn from_record(record: $crate::EventRecord) -> Self {
                Self { record }
            }

            fn record(&self) -> &$crate::EventRecord {
                &self.record
            }

            fn record_mut(&mut self) -> &mut $crate::EventRecord {
                &mut self.record
            }

            fn into_record(self) -> $crate::EventRecord {
                self.record
            }
        }

        impl $crate::AggregateBinding for $name {
            type Aggregate = $aggregate;
            const REFERENCE_FIELD: &'static str = $reference;
            const EVENTS_TABLE: &'static str = $table;
        }
    };
}
