use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Why a message ended up in a failure sink.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Body could not be decoded, or the payload failed shape validation.
    Validation,
    /// The store rejected the command for a reason redelivery cannot fix.
    Permanent,
    /// Transient failures persisted past the retry budget.
    RetriesExhausted,
}

/// How `FailedCommand::body` holds the original bytes.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BodyEncoding {
    /// The body was valid UTF-8 and is stored as-is.
    #[default]
    Utf8,
    /// The body was not UTF-8; `body` is its standard base64 encoding.
    Base64,
}

/// Entry in a failure sink.
///
/// The original message body is kept byte for byte, so a record can be
/// replayed even when it never decoded. Readable bodies stay readable; any
/// other body is base64-encoded and flagged through `body_encoding`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedCommand {
    pub queue: String,
    pub routing_key: String,
    pub failure: FailureKind,
    pub reason: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
    pub body: String,
    #[serde(default)]
    pub body_encoding: BodyEncoding,
}

impl FailedCommand {
    pub fn new(
        queue: impl Into<String>,
        routing_key: impl Into<String>,
        failure: FailureKind,
        reason: impl Into<String>,
        attempts: u32,
        body: &[u8],
    ) -> Self {
        let (body, body_encoding) = match std::str::from_utf8(body) {
            Ok(text) => (text.to_string(), BodyEncoding::Utf8),
            Err(_) => (BASE64.encode(body), BodyEncoding::Base64),
        };
        Self {
            queue: queue.into(),
            routing_key: routing_key.into(),
            failure,
            reason: reason.into(),
            attempts,
            failed_at: Utc::now(),
            body,
            body_encoding,
        }
    }

    /// The original message body.
    pub fn body_bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
        match self.body_encoding {
            BodyEncoding::Utf8 => Ok(self.body.as_bytes().to_vec()),
            BodyEncoding::Base64 => BASE64.decode(&self.body),
        }
    }
}
