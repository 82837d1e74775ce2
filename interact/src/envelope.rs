//! Wire envelope for every payload exchanged over the broker.
//!
//! An [`Envelope`] pairs a payload with its schema tag and encodes to UTF-8 JSON:
//!
//! ```json
//! {"Type": "Ping", "Payload": {"Time": "2024-01-01T00:00:00Z"}}
//! ```
//!
//! Receivers decode with the type they expect and then call [`Envelope::validate`],
//! which reports a tag mismatch before delegating to the payload's own rules.

use bytes::Bytes;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::error::InteractError;

#[cfg(test)]
#[path = "envelope.test.rs"]
mod tests;

/// A single validation failure, optionally tied to a payload field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: Option<String>,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: Some(field.into()),
            message: message.into(),
        }
    }

    pub fn message(message: impl Into<String>) -> Self {
        Self {
            field: None,
            message: message.into(),
        }
    }

    /// Adds an error for `field` when it is blank.
    pub fn require(errors: &mut Vec<FieldError>, field: &str, value: &str) {
        if value.trim().is_empty() {
            errors.push(FieldError::new(field, "is required"));
        }
    }
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.field {
            Some(field) => write!(f, "{}: {}", field, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

/// A message schema that can travel inside an [`Envelope`].
///
/// `TAG` is the stable wire discriminator. It also names rpc request queues, so it
/// must not change once peers depend on it.
pub trait Payload: Serialize + DeserializeOwned + Clone + std::fmt::Debug + Send + Sync + 'static {
    const TAG: &'static str;

    /// Field level validation. An empty list means the payload is valid.
    fn validate(&self) -> Vec<FieldError> {
        Vec::new()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<P> {
    #[serde(rename = "Type")]
    pub type_tag: String,
    #[serde(rename = "Payload")]
    pub payload: P,
}

impl<P: Payload> Envelope<P> {
    pub fn new(payload: P) -> Self {
        Self {
            type_tag: P::TAG.to_string(),
            payload,
        }
    }

    /// Encodes the envelope, always stamping the payload's own tag.
    pub fn to_bytes(&self) -> Result<Bytes, InteractError> {
        let wire = Envelope {
            type_tag: P::TAG.to_string(),
            payload: &self.payload,
        };
        Ok(Bytes::from(serde_json::to_vec(&wire)?))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, InteractError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn validate(&self) -> Vec<FieldError> {
        if self.type_tag != P::TAG {
            return vec![FieldError::new(
                "Type",
                format!("expected '{}' but got '{}'", P::TAG, self.type_tag),
            )];
        }
        self.payload.validate()
    }

    /// Fails with the first validation error, if any.
    pub fn ensure_valid(&self) -> Result<(), InteractError> {
        match self.validate().into_iter().next() {
            None => Ok(()),
            Some(error) if error.message.trim().is_empty() => Err(InteractError::Validation(
                FieldError::message("unknown validation error"),
            )),
            Some(error) => Err(InteractError::Validation(error)),
        }
    }

    pub fn into_payload(self) -> P {
        self.payload
    }
}

#[derive(Deserialize)]
struct TagOnly {
    #[serde(rename = "Type")]
    type_tag: String,
}

/// Reads the tag of an encoded envelope without decoding its payload.
pub fn peek_tag(bytes: &[u8]) -> Result<String, InteractError> {
    let tag: TagOnly = serde_json::from_slice(bytes)?;
    Ok(tag.type_tag)
}
