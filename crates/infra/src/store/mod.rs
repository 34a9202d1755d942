//! Contact store adapters.
//!
//! The store exclusively owns persisted contacts and states. Every `apply` is
//! idempotent: running the same command twice converges to the same end state,
//! which is what makes at-least-once delivery safe.
//!
//! | Command | Identifier present | Identifier absent |
//! |---------|--------------------|-------------------|
//! | Add     | success, no change | insert            |
//! | Edit    | update fields      | `NotFound` (permanent) |
//! | Delete  | remove             | success, no change |

pub mod in_memory;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use contacts_core::{Contact, ContactId, State, StateId};
use contacts_events::ContactCommand;

pub use in_memory::InMemoryContactStore;
pub use postgres::PostgresContactStore;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached or the operation was interrupted.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// An Edit targeted an identifier that does not exist.
    #[error("contact not found: {0}")]
    NotFound(ContactId),

    /// The contact references a state that does not exist.
    #[error("unknown state: {0}")]
    UnknownState(StateId),

    /// The store rejected the data (constraint violation, bad row, ...).
    #[error("rejected by store: {0}")]
    Rejected(String),
}

impl StoreError {
    /// Whether redelivering the same command may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// What an `apply` did to the store.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Inserted,
    Updated,
    Deleted,
    /// The store already reflected the command (duplicate Add, Delete of an
    /// absent contact).
    Unchanged,
}

/// Persistent contact store.
#[async_trait]
pub trait ContactStore: Send + Sync {
    /// Apply one command in its own transaction.
    async fn apply(&self, command: &ContactCommand) -> Result<ApplyOutcome, StoreError>;

    async fn get_contact(&self, id: &ContactId) -> Result<Option<Contact>, StoreError>;

    /// All contacts ordered by identifier.
    async fn list_contacts(&self) -> Result<Vec<Contact>, StoreError>;

    async fn get_state(&self, id: StateId) -> Result<Option<State>, StoreError>;

    /// All states ordered by identifier.
    async fn list_states(&self) -> Result<Vec<State>, StoreError>;

    /// Insert or replace a state (reference data seeding).
    async fn upsert_state(&self, state: &State) -> Result<(), StoreError>;
}

#[async_trait]
impl<S> ContactStore for Arc<S>
where
    S: ContactStore + ?Sized,
{
    async fn apply(&self, command: &ContactCommand) -> Result<ApplyOutcome, StoreError> {
        (**self).apply(command).await
    }

    async fn get_contact(&self, id: &ContactId) -> Result<Option<Contact>, StoreError> {
        (**self).get_contact(id).await
    }

    async fn list_contacts(&self) -> Result<Vec<Contact>, StoreError> {
        (**self).list_contacts().await
    }

    async fn get_state(&self, id: StateId) -> Result<Option<State>, StoreError> {
        (**self).get_state(id).await
    }

    async fn list_states(&self) -> Result<Vec<State>, StoreError> {
        (**self).list_states().await
    }

    async fn upsert_state(&self, state: &State) -> Result<(), StoreError> {
        (**self).upsert_state(state).await
    }
}
