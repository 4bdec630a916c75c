//! Rooms: the live set of sessions editing one document.
//!
//! A room has no concurrency of its own. It is only ever touched from the hub
//! loop, which also creates it on first join and drops it once empty.

use std::collections::HashMap;

use crate::session::{SessionHandle, SessionId};
use tracing::debug;

/// Maximum document identifier length.
pub const MAX_DOCUMENT_ID_LENGTH: usize = 256;

/// A document identifier.
pub type DocumentId = String;

/// Validate a document identifier.
///
/// # Errors
///
/// Returns an error message if the identifier is invalid.
pub fn validate_document_id(id: &str) -> Result<(), &'static str> {
    if id.is_empty() {
        return Err("Document id cannot be empty");
    }
    if id.len() > MAX_DOCUMENT_ID_LENGTH {
        return Err("Document id too long");
    }
    if id.contains('/') {
        return Err("Document id cannot contain '/'");
    }
    if id.chars().any(char::is_control) {
        return Err("Document id contains control characters");
    }
    Ok(())
}

/// The members of one document.
#[derive(Debug)]
pub struct Room {
    document_id: DocumentId,
    members: HashMap<SessionId, SessionHandle>,
}

impl Room {
    /// Create an empty room.
    #[must_use]
    pub fn new(document_id: impl Into<DocumentId>) -> Self {
        Self {
            document_id: document_id.into(),
            members: HashMap::new(),
        }
    }

    /// Document this room belongs to.
    #[must_use]
    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    /// Number of members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Check if the room has no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Check if a session is a member.
    #[must_use]
    pub fn contains(&self, session: SessionId) -> bool {
        self.members.contains_key(&session)
    }

    /// Add a member.
    ///
    /// Returns `false` and drops `handle` if the session was already a member.
    pub fn insert(&mut self, handle: SessionHandle) -> bool {
        let id = handle.id();
        if self.members.contains_key(&id) {
            return false;
        }
        self.members.insert(id, handle);
        debug!(document = %self.document_id, session = %id, members = self.members.len(), "Member added");
        true
    }

    /// Remove a member, returning its handle.
    pub fn remove(&mut self, session: SessionId) -> Option<SessionHandle> {
        let removed = self.members.remove(&session);
        if removed.is_some() {
            debug!(document = %self.document_id, session = %session, members = self.members.len(), "Member removed");
        }
        removed
    }

    /// Iterate over members.
    pub fn members(&self) -> impl Iterator<Item = &SessionHandle> {
        self.members.values()
    }

    /// Member session IDs.
    #[must_use]
    pub fn member_ids(&self) -> Vec<SessionId> {
        self.members.keys().copied().collect()
    }

    /// Remove every member, returning their handles.
    pub fn drain(&mut self) -> Vec<SessionHandle> {
        self.members.drain().map(|(_, handle)| handle).collect()
    }
}
