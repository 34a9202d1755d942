use serde::{Deserialize, Serialize};

use contacts_core::{Contact, ContactId, DomainError, DomainResult};

/// Name of the durable direct exchange all contact commands are published to.
pub const EXCHANGE: &str = "tech.challenge.direct";

/// The three kinds of contact mutation.
///
/// Each kind owns exactly one routing key and one queue. The mapping is fixed in
/// code; it is part of the wire contract and is not configurable.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Add,
    Edit,
    Delete,
}

impl CommandKind {
    pub const ALL: [CommandKind; 3] = [CommandKind::Add, CommandKind::Edit, CommandKind::Delete];

    pub fn routing_key(self) -> &'static str {
        match self {
            CommandKind::Add => "add.contact",
            CommandKind::Edit => "update.contact",
            CommandKind::Delete => "delete.contact",
        }
    }

    pub fn queue(self) -> &'static str {
        match self {
            CommandKind::Add => "add-contact",
            CommandKind::Edit => "update-contact",
            CommandKind::Delete => "delete-contact",
        }
    }

    /// Delay queue holding messages waiting for their next attempt.
    pub fn retry_queue(self) -> String {
        format!("{}.retry", self.queue())
    }

    /// Failure sink for messages that will never succeed as-is.
    pub fn failed_queue(self) -> String {
        format!("{}.failed", self.queue())
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CommandKind::Add => "add",
            CommandKind::Edit => "edit",
            CommandKind::Delete => "delete",
        }
    }
}

impl core::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of a Delete: only the identifier travels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteContact {
    pub id: ContactId,
}

/// A contact mutation intent.
///
/// Serialized adjacently tagged: `{"kind": "add", "payload": {...}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum ContactCommand {
    Add(Contact),
    Edit(Contact),
    Delete(DeleteContact),
}

impl ContactCommand {
    pub fn add(contact: Contact) -> Self {
        Self::Add(contact)
    }

    pub fn edit(contact: Contact) -> Self {
        Self::Edit(contact)
    }

    pub fn delete(id: ContactId) -> Self {
        Self::Delete(DeleteContact { id })
    }

    pub fn kind(&self) -> CommandKind {
        match self {
            ContactCommand::Add(_) => CommandKind::Add,
            ContactCommand::Edit(_) => CommandKind::Edit,
            ContactCommand::Delete(_) => CommandKind::Delete,
        }
    }

    pub fn contact_id(&self) -> &ContactId {
        match self {
            ContactCommand::Add(c) | ContactCommand::Edit(c) => &c.id,
            ContactCommand::Delete(d) => &d.id,
        }
    }

    /// Payload shape checks (no store access).
    pub fn validate(&self) -> DomainResult<()> {
        match self {
            ContactCommand::Add(c) | ContactCommand::Edit(c) => c.validate(),
            ContactCommand::Delete(d) => {
                if d.id.is_valid() {
                    Ok(())
                } else {
                    Err(DomainError::invalid_id("contact id must not be empty"))
                }
            }
        }
    }
}
