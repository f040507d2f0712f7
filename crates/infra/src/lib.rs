//! Infrastructure layer: record stores, configuration and the apply engine.

pub mod applier;
pub mod config;
pub mod error;
pub mod resolver;
pub mod store;

pub use applier::{Applied, ApplyStage, EventApplier};
pub use config::{ApplierConfig, ConfigError, StoreConfig};
pub use error::ApplyError;
pub use resolver::{resolve, Resolution};
pub use store::{
    InMemoryRecordStore, PostgresRecordStore, RecordStore, StoreError, StoreTransaction,
    StoredEvent,
};
