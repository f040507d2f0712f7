//! User aggregate (event-applied).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use keel_core::{Aggregate, AggregateId, DomainError, DomainResult};

// ─────────────────────────────────────────────────────────────────────────────
// User Aggregate
// ─────────────────────────────────────────────────────────────────────────────

/// A registered user.
///
/// # Invariants
/// - A saved user always has a non-empty name and an email containing `@`.
/// - Destroying is a soft delete: the row stays and `deleted_at` is set.
/// - A destroyed user accepts no further changes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    #[serde(skip)]
    pub id: Option<AggregateId>,
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl User {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub(crate) fn ensure_exists(&self) -> DomainResult<()> {
        if self.id.is_none() {
            return Err(DomainError::invariant("user does not exist yet"));
        }
        Ok(())
    }

    pub(crate) fn ensure_not_deleted(&self) -> DomainResult<()> {
        if self.is_deleted() {
            return Err(DomainError::invariant("user is deleted"));
        }
        Ok(())
    }
}

impl Aggregate for User {
    const AGGREGATE_TYPE: &'static str = "user";
    const TABLE: &'static str = "users";

    fn id(&self) -> Option<AggregateId> {
        self.id
    }

    fn assign_id(&mut self, id: AggregateId) {
        self.id = Some(id);
    }

    fn validate(&self) -> DomainResult<()> {
        if self.name.trim().is_empty() {
            return Err(DomainError::validation("name cannot be empty"));
        }
        if self.email.trim().is_empty() || !self.email.contains('@') {
            return Err(DomainError::validation("invalid email format"));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
