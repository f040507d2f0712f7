//! `keel-events`: event records, typed payloads and aggregate bindings.

pub mod binding;
pub mod event;
mod macros;
pub mod payload;
pub mod record;
pub mod registry;

pub use binding::{AggregateBinding, BindingInfo};
pub use event::{Apply, Event};
pub use payload::{Payload, PayloadSchema};
pub use record::{EventRecord, RecordError};
pub use registry::{EventRegistry, RegistryError};

#[doc(hidden)]
pub use keel_core as __core;
