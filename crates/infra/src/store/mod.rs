//! Transactional record store boundary.
//!
//! The apply engine reads and writes aggregate rows and appends event rows
//! through these traits, without making any storage assumptions. Two
//! backends ship: an in-memory store for tests/dev and a Postgres store.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::{InMemoryRecordStore, InMemoryTransaction};
pub use postgres::{PostgresRecordStore, PostgresTransaction};
pub use r#trait::{
    AggregateRow, NewEvent, RecordStore, StoreError, StoreTransaction, StoredEvent,
};
