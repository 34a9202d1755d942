use serde::{Deserialize, Serialize};

use crate::entity::Entity;
use crate::error::{DomainError, DomainResult};
use crate::id::{ContactId, StateId};

/// Detail fields of a contact.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactDetails {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
}

/// A contact record.
///
/// This is both the persisted shape and the payload of Add/Edit commands: the
/// wire representation is flat (`id`, `name`, detail fields, `state_id`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub id: ContactId,
    pub name: String,
    #[serde(flatten)]
    pub details: ContactDetails,
    pub state_id: StateId,
}

impl Contact {
    pub fn new(id: ContactId, name: impl Into<String>, state_id: StateId) -> Self {
        Self {
            id,
            name: name.into(),
            details: ContactDetails::default(),
            state_id,
        }
    }

    pub fn with_details(mut self, details: ContactDetails) -> Self {
        self.details = details;
        self
    }

    /// Structural checks that do not need the store.
    ///
    /// Whether `state_id` resolves to an existing state is checked by the store
    /// at apply time.
    pub fn validate(&self) -> DomainResult<()> {
        if !self.id.is_valid() {
            return Err(DomainError::invalid_id("contact id must not be empty"));
        }
        if self.name.trim().is_empty() {
            return Err(DomainError::validation("contact name must not be empty"));
        }
        if self.state_id.get() <= 0 {
            return Err(DomainError::validation(format!(
                "state_id must be positive (got {})",
                self.state_id
            )));
        }
        Ok(())
    }
}

impl Entity for Contact {
    type Id = ContactId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

/// Reference data: a federative state (e.g. `SP` / `São Paulo`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    pub id: StateId,
    pub code: String,
    pub name: String,
}

impl State {
    pub fn new(id: StateId, code: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id,
            code: code.into(),
            name: name.into(),
        }
    }
}

impl Entity for State {
    type Id = StateId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}
