use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use contacts_core::MessageId;

use crate::command::{CommandKind, ContactCommand};

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("failed to encode envelope: {0}")]
    Encode(String),

    #[error("failed to decode envelope: {0}")]
    Decode(String),
}

/// Envelope for a contact command, containing delivery metadata.
///
/// This is the unit that travels through the broker.
///
/// Notes:
/// - `attempt` starts at 0 on publish and is incremented each time the message
///   is rescheduled after a failed apply.
/// - `published_at` is the time of the *original* publish; it survives retries
///   and replays unchanged.
/// - Unknown fields are ignored on decode, so newer producers can add metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    message_id: MessageId,
    #[serde(default)]
    attempt: u32,
    published_at: DateTime<Utc>,
    #[serde(default)]
    last_error: Option<String>,

    command: ContactCommand,
}

impl CommandEnvelope {
    pub fn new(command: ContactCommand) -> Self {
        Self::with_id(MessageId::new(), Utc::now(), command)
    }

    pub fn with_id(message_id: MessageId, published_at: DateTime<Utc>, command: ContactCommand) -> Self {
        Self {
            message_id,
            attempt: 0,
            published_at,
            last_error: None,
            command,
        }
    }

    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn published_at(&self) -> DateTime<Utc> {
        self.published_at
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn kind(&self) -> CommandKind {
        self.command.kind()
    }

    pub fn command(&self) -> &ContactCommand {
        &self.command
    }

    /// Copy of this envelope for the given attempt, recording why the previous
    /// attempt failed.
    pub fn rescheduled(&self, attempt: u32, error: impl Into<String>) -> Self {
        Self {
            attempt,
            last_error: Some(error.into()),
            ..self.clone()
        }
    }

    /// Copy of this envelope with a fresh retry budget (failure-sink replay).
    pub fn replayed(&self) -> Self {
        Self {
            attempt: 0,
            last_error: None,
            ..self.clone()
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(self).map_err(|e| EnvelopeError::Encode(e.to_string()))
    }

    pub fn from_bytes(body: &[u8]) -> Result<Self, EnvelopeError> {
        serde_json::from_slice(body).map_err(|e| EnvelopeError::Decode(e.to_string()))
    }
}
