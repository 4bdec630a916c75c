//! Envelope types for the Scribe protocol.
//!
//! The envelope is transport-agnostic: the same structure is carried as
//! MessagePack in binary frames and as JSON in text frames.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind tag carried by every envelope.
///
/// The hub forwards the kind verbatim; interpretation belongs to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Document content update.
    Patch,
    /// Presence signal (joined, idle, away...).
    Presence,
    /// Cursor or selection position.
    Cursor,
    /// Application-level control message.
    Control,
}

impl MessageKind {
    /// Wire name of the kind.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Patch => "patch",
            MessageKind::Presence => "presence",
            MessageKind::Cursor => "cursor",
            MessageKind::Control => "control",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// A protocol envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Document the envelope belongs to.
    pub document_id: String,
    /// Kind tag.
    pub kind: MessageKind,
    /// Opaque payload.
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
    /// Ask the hub not to echo this envelope back to its sender.
    #[serde(default, skip_serializing_if = "is_false")]
    pub exclude_sender: bool,
}

impl Envelope {
    /// Create a new envelope.
    #[must_use]
    pub fn new(
        document_id: impl Into<String>,
        kind: MessageKind,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            document_id: document_id.into(),
            kind,
            payload: payload.into(),
            exclude_sender: false,
        }
    }

    /// Create a patch envelope.
    #[must_use]
    pub fn patch(document_id: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self::new(document_id, MessageKind::Patch, payload)
    }

    /// Create a presence envelope.
    #[must_use]
    pub fn presence(document_id: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self::new(document_id, MessageKind::Presence, payload)
    }

    /// Create a cursor envelope.
    #[must_use]
    pub fn cursor(document_id: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self::new(document_id, MessageKind::Cursor, payload)
    }

    /// Create a control envelope.
    #[must_use]
    pub fn control(document_id: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self::new(document_id, MessageKind::Control, payload)
    }

    /// Mark the envelope so the sender does not receive its own copy.
    #[must_use]
    pub fn excluding_sender(mut self) -> Self {
        self.exclude_sender = true;
        self
    }
}
