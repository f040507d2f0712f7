//! `keel-users`: user aggregate, events and apply rules.

pub mod events;
pub mod user;

pub use events::{registry, UserCreated, UserDestroyed, UserRenamed};
pub use user::User;
