//! User events and their apply rules.
//!
//! All user events append to `user_events` and reference the user through
//! `user_id`.

use chrono::{DateTime, Utc};

use keel_core::{DomainError, DomainResult};
use keel_events::{define_event, Apply, EventRegistry, RecordError, RegistryError};

use crate::user::User;

define_event! {
    /// A user signed up. Carries no aggregate reference: applying it creates
    /// the user.
    ///
    /// The stored user gets `name` and `email` trimmed, and `email`
    /// lowercased, so `Alice@Example.com` and `alice@example.com` collide on
    /// the unique email. The event row keeps the payload as given.
    pub struct UserCreated for User {
        reference_field: "user_id",
        events_table: "user_events",
        payload {
            name, set_name: String,
            email, set_email: String,
        }
    }
}

define_event! {
    /// A user changed their display name.
    pub struct UserRenamed for User {
        reference_field: "user_id",
        events_table: "user_events",
        payload {
            name, set_name: String,
        }
    }
}

define_event! {
    /// A user was removed (soft delete).
    pub struct UserDestroyed for User {
        reference_field: "user_id",
        events_table: "user_events",
        payload {
            /// When the deletion happened; defaults to the time of application.
            occurred_at, set_occurred_at: DateTime<Utc>,
        }
    }
}

fn payload_error(err: RecordError) -> DomainError {
    DomainError::validation(err.to_string())
}

fn required(field: &str, value: Option<String>) -> DomainResult<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| DomainError::validation(format!("{field} is required")))
}

impl Apply for UserCreated {
    fn apply(&self, mut user: User) -> DomainResult<User> {
        if user.id.is_some() {
            return Err(DomainError::invariant("user already exists"));
        }

        user.name = required("name", self.name().map_err(payload_error)?)?;
        user.email = required("email", self.email().map_err(payload_error)?)?.to_lowercase();
        Ok(user)
    }
}

impl Apply for UserRenamed {
    fn apply(&self, mut user: User) -> DomainResult<User> {
        user.ensure_exists()?;
        user.ensure_not_deleted()?;

        user.name = required("name", self.name().map_err(payload_error)?)?;
        Ok(user)
    }
}

impl Apply for UserDestroyed {
    fn apply(&self, mut user: User) -> DomainResult<User> {
        user.ensure_exists()?;
        if user.is_deleted() {
            return Err(DomainError::invariant("user already deleted"));
        }

        let occurred_at = self.occurred_at().map_err(payload_error)?;
        user.deleted_at = Some(occurred_at.unwrap_or_else(Utc::now));
        Ok(user)
    }
}

/// Registry of every user event type, for startup checks and for reading
/// stored rows back by type name.
pub fn registry() -> Result<EventRegistry, RegistryError> {
    let mut registry = EventRegistry::new();
    registry
        .register::<UserCreated>()?
        .register::<UserRenamed>()?
        .register::<UserDestroyed>()?;
    Ok(registry)
}
