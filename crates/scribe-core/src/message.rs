//! Messages routed by the hub.
//!
//! A [`Message`] is built once from an inbound envelope and then shared
//! between every member of the room as an `Arc<Message>`.

use bytes::Bytes;
use scribe_protocol::{Envelope, MessageKind};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::room::DocumentId;
use crate::session::SessionId;

/// A unique message identifier.
pub type MessageId = u64;

static ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Generate a unique message ID.
#[must_use]
pub fn generate_message_id() -> MessageId {
    ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// An immutable message addressed to one document.
#[derive(Debug, Clone)]
pub struct Message {
    id: MessageId,
    document_id: DocumentId,
    kind: MessageKind,
    payload: Bytes,
    source: Option<SessionId>,
    exclude_sender: bool,
}

impl Message {
    /// Create a new message.
    #[must_use]
    pub fn new(
        document_id: impl Into<DocumentId>,
        kind: MessageKind,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            id: generate_message_id(),
            document_id: document_id.into(),
            kind,
            payload: payload.into(),
            source: None,
            exclude_sender: false,
        }
    }

    /// Build a message from a decoded envelope.
    #[must_use]
    pub fn from_envelope(envelope: Envelope) -> Self {
        let exclude_sender = envelope.exclude_sender;
        let mut message = Self::new(envelope.document_id, envelope.kind, envelope.payload);
        message.exclude_sender = exclude_sender;
        message
    }

    /// Attach the session that published the message.
    #[must_use]
    pub fn with_source(mut self, source: SessionId) -> Self {
        self.source = Some(source);
        self
    }

    /// Do not deliver the message back to its source session.
    #[must_use]
    pub fn excluding_sender(mut self) -> Self {
        self.exclude_sender = true;
        self
    }

    /// Message identifier.
    #[must_use]
    pub fn id(&self) -> MessageId {
        self.id
    }

    /// Target document.
    #[must_use]
    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    /// Kind tag.
    #[must_use]
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Opaque payload.
    #[must_use]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Publishing session, if any.
    #[must_use]
    pub fn source(&self) -> Option<SessionId> {
        self.source
    }

    /// Whether the source session is skipped during fan-out.
    #[must_use]
    pub fn exclude_sender(&self) -> bool {
        self.exclude_sender
    }

    /// Whether fan-out should deliver this message to `session`.
    #[must_use]
    pub fn is_addressed_to(&self, session: SessionId) -> bool {
        !(self.exclude_sender && self.source == Some(session))
    }

    /// Convert back to the wire form.
    #[must_use]
    pub fn to_envelope(&self) -> Envelope {
        Envelope {
            document_id: self.document_id.clone(),
            kind: self.kind,
            payload: self.payload.to_vec(),
            exclude_sender: self.exclude_sender,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_creation() {
        let msg = Message::new("doc-1", MessageKind::Patch, b"hello".to_vec());
        assert_eq!(msg.document_id(), "doc-1");
        assert_eq!(msg.kind(), MessageKind::Patch);
        assert_eq!(&msg.payload()[..], b"hello");
        assert!(msg.source().is_none());
        assert!(!msg.exclude_sender());
    }

    #[test]
    fn test_message_from_envelope() {
        let sender = SessionId::next();
        let envelope = Envelope::cursor("doc-2", b"3:14".to_vec()).excluding_sender();
        let msg = Message::from_envelope(envelope.clone()).with_source(sender);

        assert_eq!(msg.source(), Some(sender));
        assert!(msg.exclude_sender());
        assert_eq!(msg.to_envelope(), envelope);
    }

    #[test]
    fn test_sender_exclusion() {
        let sender = SessionId::next();
        let other = SessionId::next();

        let echoed = Message::new("doc", MessageKind::Presence, vec![]).with_source(sender);
        assert!(echoed.is_addressed_to(sender));
        assert!(echoed.is_addressed_to(other));

        let excluded = echoed.excluding_sender();
        assert!(!excluded.is_addressed_to(sender));
        assert!(excluded.is_addressed_to(other));

        // Without a source there is nobody to exclude.
        let anonymous = Message::new("doc", MessageKind::Control, vec![]).excluding_sender();
        assert!(anonymous.is_addressed_to(sender));
    }

    #[test]
    fn test_unique_message_ids() {
        let id1 = generate_message_id();
        let id2 = generate_message_id();
        assert_ne!(id1, id2);
    }
}
