//! # scribe-core
//!
//! The real-time collaboration hub for Scribe.
//!
//! Editors of the same document exchange live updates through the hub. The
//! hub is a transport and fan-out layer only: payloads are opaque, nothing is
//! persisted, and a message that cannot be queued for a peer right now is
//! lost for that peer.
//!
//! - **Hub** - single task owning the document → room map
//! - **Room** - the sessions currently editing one document
//! - **Session** - one admitted connection, with a bounded outbound queue
//! - **Admission** - identity and access checks before a session exists
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐ join/leave/publish ┌─────────────┐      ┌─────────────┐
//! │   Session   │───────────────────▶│     Hub     │─────▶│    Room     │
//! └─────────────┘                    └─────────────┘      └─────────────┘
//!        ▲                                  │
//!        └────────── outbound queue ────────┘
//! ```

pub mod admission;
pub mod hub;
pub mod message;
pub mod room;
pub mod session;

pub use admission::{admit, AccessPolicy, AdmissionError, AllowAuthenticated, Identity};
pub use hub::{Hub, HubConfig, HubError, HubHandle, HubStats};
pub use message::Message;
pub use room::{validate_document_id, DocumentId, Room};
pub use session::{
    Lifecycle, Session, SessionConfig, SessionHandle, SessionId, SessionOutcome, SessionQueue,
    SessionState,
};
