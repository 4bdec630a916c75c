//! The collaboration hub.
//!
//! The hub is a single task that owns the document → room map. Sessions talk
//! to it through a [`HubHandle`], which turns every operation into a command
//! on the hub's mailbox. Because the loop is the only code that touches the
//! map, membership changes and fan-out never race with each other.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::message::Message;
use crate::room::{DocumentId, Room};
use crate::session::{OfferError, SessionHandle, SessionId};

/// Default mailbox capacity.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 1024;

/// Hub errors.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum HubError {
    /// The hub loop is no longer running.
    #[error("Hub is closed")]
    Closed,
}

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Number of commands that may wait in the mailbox.
    pub mailbox_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
        }
    }
}

/// Hub statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    /// Number of live rooms.
    pub room_count: usize,
    /// Number of joined sessions.
    pub session_count: usize,
    /// Messages accepted for fan-out.
    pub messages_published: u64,
    /// Messages placed on session queues.
    pub messages_delivered: u64,
    /// Sessions evicted for backpressure.
    pub sessions_evicted: u64,
}

enum Command {
    Join {
        session: SessionHandle,
        document_id: DocumentId,
    },
    Leave {
        session_id: SessionId,
    },
    Publish {
        message: Arc<Message>,
    },
    Stats {
        reply: oneshot::Sender<HubStats>,
    },
    RoomSize {
        document_id: DocumentId,
        reply: oneshot::Sender<Option<usize>>,
    },
    DocumentOf {
        session_id: SessionId,
        reply: oneshot::Sender<Option<DocumentId>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable entry point to the hub.
#[derive(Clone)]
pub struct HubHandle {
    mailbox: mpsc::Sender<Command>,
}

impl HubHandle {
    async fn send(&self, command: Command) -> Result<(), HubError> {
        self.mailbox.send(command).await.map_err(|_| HubError::Closed)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, HubError> {
        let (reply, response) = oneshot::channel();
        self.send(build(reply)).await?;
        response.await.map_err(|_| HubError::Closed)
    }

    /// Register a session as a member of the room for `document_id`.
    ///
    /// If the session is already a member of that room nothing changes. If it
    /// is a member of another room it is moved, keeping its existing queue;
    /// in both cases `session` is discarded.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub has stopped.
    pub async fn join(
        &self,
        session: SessionHandle,
        document_id: impl Into<DocumentId>,
    ) -> Result<(), HubError> {
        self.send(Command::Join {
            session,
            document_id: document_id.into(),
        })
        .await
    }

    /// Remove a session from its room. Leaving twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub has stopped.
    pub async fn leave(&self, session_id: SessionId) -> Result<(), HubError> {
        self.send(Command::Leave { session_id }).await
    }

    /// Fan a message out to every member of its document's room.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub has stopped.
    pub async fn publish(&self, message: Message) -> Result<(), HubError> {
        self.send(Command::Publish {
            message: Arc::new(message),
        })
        .await
    }

    /// Current statistics.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub has stopped.
    pub async fn stats(&self) -> Result<HubStats, HubError> {
        self.request(|reply| Command::Stats { reply }).await
    }

    /// Number of members in the room for `document_id`, `None` if no room exists.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub has stopped.
    pub async fn room_size(&self, document_id: &str) -> Result<Option<usize>, HubError> {
        let document_id = document_id.to_string();
        self.request(|reply| Command::RoomSize { document_id, reply })
            .await
    }

    /// Document the session is currently joined to.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub has stopped.
    pub async fn document_of(&self, session_id: SessionId) -> Result<Option<DocumentId>, HubError> {
        self.request(|reply| Command::DocumentOf { session_id, reply })
            .await
    }

    /// Release every session and stop the hub loop.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub had already stopped.
    pub async fn shutdown(&self) -> Result<(), HubError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    /// Whether the hub loop has stopped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.mailbox.is_closed()
    }
}

/// The hub state, owned by its loop.
pub struct Hub {
    rooms: HashMap<DocumentId, Room>,
    memberships: HashMap<SessionId, DocumentId>,
    mailbox: mpsc::Receiver<Command>,
    stats: HubStats,
}

impl Hub {
    /// Create a hub and its handle without starting the loop.
    #[must_use]
    pub fn new(config: HubConfig) -> (Self, HubHandle) {
        let (tx, rx) = mpsc::channel(config.mailbox_capacity.max(1));
        let hub = Self {
            rooms: HashMap::new(),
            memberships: HashMap::new(),
            mailbox: rx,
            stats: HubStats::default(),
        };
        (hub, HubHandle { mailbox: tx })
    }

    /// Create a hub and run its loop on a new task.
    #[must_use]
    pub fn spawn(config: HubConfig) -> (HubHandle, JoinHandle<()>) {
        info!("Starting hub with config: {:?}", config);
        let (hub, handle) = Self::new(config);
        (handle, tokio::spawn(hub.run()))
    }

    /// Process commands until shutdown or until every handle is dropped.
    pub async fn run(mut self) {
        while let Some(command) = self.mailbox.recv().await {
            match command {
                Command::Join {
                    session,
                    document_id,
                } => self.join(session, document_id),
                Command::Leave { session_id } => {
                    self.remove_member(session_id);
                }
                Command::Publish { message } => self.publish(message),
                Command::Stats { reply } => {
                    let _ = reply.send(self.stats());
                }
                Command::RoomSize { document_id, reply } => {
                    let _ = reply.send(self.rooms.get(&document_id).map(Room::len));
                }
                Command::DocumentOf { session_id, reply } => {
                    let _ = reply.send(self.memberships.get(&session_id).cloned());
                }
                Command::Shutdown { reply } => {
                    self.release_all();
                    let _ = reply.send(());
                    break;
                }
            }
            debug_assert!(self.invariants_hold(), "hub membership invariants violated");
        }

        info!("Hub stopped");
    }

    fn stats(&self) -> HubStats {
        HubStats {
            room_count: self.rooms.len(),
            session_count: self.memberships.len(),
            ..self.stats
        }
    }

    fn join(&mut self, session: SessionHandle, document_id: DocumentId) {
        let session_id = session.id();

        match self.memberships.get(&session_id) {
            Some(current) if *current == document_id => {
                trace!(session = %session_id, document = %document_id, "Already joined");
                return;
            }
            Some(_) => {
                // Move the existing membership, keeping its queue.
                if let Some(existing) = self.remove_member(session_id) {
                    self.insert_member(existing, document_id);
                }
                return;
            }
            None => {}
        }

        self.insert_member(session, document_id);
    }

    fn insert_member(&mut self, session: SessionHandle, document_id: DocumentId) {
        let session_id = session.id();
        let room = self.rooms.entry(document_id.clone()).or_insert_with(|| {
            debug!(document = %document_id, "Creating room");
            Room::new(document_id.clone())
        });

        if room.insert(session) {
            debug!(session = %session_id, document = %document_id, members = room.len(), "Joined");
            self.memberships.insert(session_id, document_id);
        }
    }

    /// Remove a member and delete its room if it became empty.
    fn remove_member(&mut self, session_id: SessionId) -> Option<SessionHandle> {
        let document_id = self.memberships.remove(&session_id)?;
        let room = self.rooms.get_mut(&document_id)?;
        let handle = room.remove(session_id);

        debug!(session = %session_id, document = %document_id, members = room.len(), "Left");
        if room.is_empty() {
            self.rooms.remove(&document_id);
            debug!(document = %document_id, "Deleted empty room");
        }
        handle
    }

    fn publish(&mut self, message: Arc<Message>) {
        if let Some(source) = message.source() {
            if self.memberships.get(&source).map(String::as_str) != Some(message.document_id()) {
                // Sent by a session that was removed before its publish arrived.
                trace!(
                    session = %source,
                    document = %message.document_id(),
                    "Dropping publish from non-member"
                );
                return;
            }
        }

        let Some(room) = self.rooms.get(message.document_id()) else {
            trace!(document = %message.document_id(), "Publish to document without room");
            return;
        };

        self.stats.messages_published += 1;
        let mut failed: Vec<(SessionId, OfferError)> = Vec::new();

        for member in room.members() {
            if !message.is_addressed_to(member.id()) {
                continue;
            }
            match member.offer(Arc::clone(&message)) {
                Ok(()) => self.stats.messages_delivered += 1,
                Err(reason) => failed.push((member.id(), reason)),
            }
        }

        trace!(
            document = %message.document_id(),
            message = message.id(),
            kind = %message.kind(),
            "Published"
        );

        for (session_id, reason) in failed {
            match reason {
                OfferError::Full => self.evict(session_id),
                OfferError::Closed => {
                    // The write half already ended; its session is on the way out.
                    if self.remove_member(session_id).is_some() {
                        debug!(session = %session_id, "Removed session with closed queue");
                    }
                }
            }
        }
    }

    /// Forced leave: the session's queue is released and other members are untouched.
    fn evict(&mut self, session_id: SessionId) {
        if let Some(handle) = self.remove_member(session_id) {
            warn!(session = %session_id, reason = OfferError::Full.as_str(), "Evicting session");
            handle.state().mark_evicted();
            self.stats.sessions_evicted += 1;
        }
    }

    fn release_all(&mut self) {
        let sessions = self.memberships.len();
        for (_, mut room) in self.rooms.drain() {
            drop(room.drain());
        }
        self.memberships.clear();
        info!(sessions, "Released all sessions");
    }

    fn invariants_hold(&self) -> bool {
        let members: usize = self.rooms.values().map(Room::len).sum();
        members == self.memberships.len()
            && self.rooms.values().all(|room| !room.is_empty())
            && self.memberships.iter().all(|(session, document)| {
                self.rooms
                    .get(document)
                    .is_some_and(|room| room.contains(*session))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Lifecycle, SessionQueue, SessionState};
    use scribe_protocol::MessageKind;

    fn member(capacity: usize) -> (SessionHandle, SessionQueue) {
        SessionHandle::new(SessionId::next(), capacity)
    }

    fn patch(document: &str, payload: &[u8]) -> Message {
        Message::new(document, MessageKind::Patch, payload.to_vec())
    }

    #[tokio::test]
    async fn test_join_creates_room_and_leave_deletes_it() {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let (session, _queue) = member(4);
        let id = session.id();

        hub.join(session, "doc-1").await.unwrap();
        assert_eq!(hub.room_size("doc-1").await.unwrap(), Some(1));
        assert_eq!(hub.document_of(id).await.unwrap(), Some("doc-1".to_string()));

        hub.leave(id).await.unwrap();
        assert_eq!(hub.room_size("doc-1").await.unwrap(), None);
        assert_eq!(hub.stats().await.unwrap().room_count, 0);
    }

    #[tokio::test]
    async fn test_leave_is_idempotent() {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let (first, _q1) = member(4);
        let (second, _q2) = member(4);
        let first_id = first.id();

        hub.join(first, "doc").await.unwrap();
        hub.join(second, "doc").await.unwrap();

        hub.leave(first_id).await.unwrap();
        hub.leave(first_id).await.unwrap();
        hub.leave(SessionId::next()).await.unwrap();

        assert_eq!(hub.room_size("doc").await.unwrap(), Some(1));
        assert_eq!(hub.stats().await.unwrap().session_count, 1);
    }

    #[tokio::test]
    async fn test_rejoin_same_document_is_noop() {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let (session, mut queue) = member(4);
        let id = session.id();
        hub.join(session, "doc").await.unwrap();

        let (duplicate, mut duplicate_queue) = SessionHandle::new(id, 4);
        hub.join(duplicate, "doc").await.unwrap();
        assert_eq!(hub.room_size("doc").await.unwrap(), Some(1));

        // The first queue is still the one being fed.
        hub.publish(patch("doc", b"a")).await.unwrap();
        hub.stats().await.unwrap();
        assert!(queue.try_recv().is_some());
        assert!(duplicate_queue.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_join_other_document_moves_membership() {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let (session, mut queue) = member(4);
        let id = session.id();
        hub.join(session, "doc-a").await.unwrap();

        let (again, _unused) = SessionHandle::new(id, 4);
        hub.join(again, "doc-b").await.unwrap();

        assert_eq!(hub.room_size("doc-a").await.unwrap(), None);
        assert_eq!(hub.room_size("doc-b").await.unwrap(), Some(1));
        assert_eq!(hub.document_of(id).await.unwrap(), Some("doc-b".to_string()));

        hub.publish(patch("doc-a", b"old")).await.unwrap();
        hub.publish(patch("doc-b", b"new")).await.unwrap();
        hub.stats().await.unwrap();

        let delivered = queue.try_recv().unwrap();
        assert_eq!(delivered.document_id(), "doc-b");
        assert!(queue.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_publish_includes_sender_unless_excluded() {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let (author, mut author_queue) = member(4);
        let (reader, mut reader_queue) = member(4);
        let author_id = author.id();
        hub.join(author, "doc").await.unwrap();
        hub.join(reader, "doc").await.unwrap();

        hub.publish(patch("doc", b"echo").with_source(author_id))
            .await
            .unwrap();
        hub.publish(
            patch("doc", b"quiet")
                .with_source(author_id)
                .excluding_sender(),
        )
        .await
        .unwrap();
        hub.stats().await.unwrap();

        assert_eq!(&author_queue.try_recv().unwrap().payload()[..], b"echo");
        assert!(author_queue.try_recv().is_none());

        assert_eq!(&reader_queue.try_recv().unwrap().payload()[..], b"echo");
        assert_eq!(&reader_queue.try_recv().unwrap().payload()[..], b"quiet");
    }

    #[tokio::test]
    async fn test_full_queue_evicts_only_that_member() {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let (slow, mut slow_queue) = member(1);
        let (fast, mut fast_queue) = member(8);
        let slow_state = Arc::clone(slow.state());
        let slow_id = slow.id();
        hub.join(slow, "doc").await.unwrap();
        hub.join(fast, "doc").await.unwrap();

        for i in 0..3u8 {
            hub.publish(patch("doc", &[i])).await.unwrap();
        }

        let stats = hub.stats().await.unwrap();
        assert_eq!(stats.sessions_evicted, 1);
        assert_eq!(hub.room_size("doc").await.unwrap(), Some(1));
        assert_eq!(hub.document_of(slow_id).await.unwrap(), None);
        assert!(slow_state.is_evicted());

        for i in 0..3u8 {
            assert_eq!(&fast_queue.try_recv().unwrap().payload()[..], &[i]);
        }

        // The evicted queue keeps what was accepted, then reports release.
        assert_eq!(&slow_queue.recv().await.unwrap().payload()[..], &[0]);
        assert!(slow_queue.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_closed_queue_is_removed_without_eviction() {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let (gone, queue) = member(4);
        let gone_state = Arc::clone(gone.state());
        drop(queue);
        hub.join(gone, "doc").await.unwrap();

        hub.publish(patch("doc", b"x")).await.unwrap();
        assert_eq!(hub.room_size("doc").await.unwrap(), None);

        let stats = hub.stats().await.unwrap();
        assert_eq!(stats.sessions_evicted, 0);
        assert_eq!(stats.session_count, 0);
        assert!(!gone_state.is_evicted());
    }

    #[tokio::test]
    async fn test_publish_from_non_member_is_dropped() {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let (reader, mut reader_queue) = member(4);
        let (other, _other_queue) = member(4);
        let other_id = other.id();
        hub.join(reader, "doc").await.unwrap();
        hub.join(other, "elsewhere").await.unwrap();

        // A session that was never joined, or has already been removed.
        let stranger = SessionId::next();
        hub.publish(patch("doc", b"late").with_source(stranger))
            .await
            .unwrap();
        // A member of another room.
        hub.publish(patch("doc", b"wrong room").with_source(other_id))
            .await
            .unwrap();

        let stats = hub.stats().await.unwrap();
        assert_eq!(stats.messages_published, 0);
        assert!(reader_queue.try_recv().is_none());

        // Unattributed messages are still fanned out.
        hub.publish(patch("doc", b"server")).await.unwrap();
        hub.stats().await.unwrap();
        assert_eq!(&reader_queue.try_recv().unwrap().payload()[..], b"server");
    }

    #[tokio::test]
    async fn test_publish_to_unknown_document_is_noop() {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        hub.publish(patch("nobody-here", b"x")).await.unwrap();

        let stats = hub.stats().await.unwrap();
        assert_eq!(stats.room_count, 0);
        assert_eq!(stats.messages_published, 0);
    }

    #[tokio::test]
    async fn test_shutdown_releases_queues_and_stops() {
        let (hub, task) = Hub::spawn(HubConfig::default());
        let state = Arc::new(SessionState::new());
        let (session, mut queue) = SessionHandle::with_state(SessionId::next(), 4, Arc::clone(&state));
        hub.join(session, "doc").await.unwrap();

        hub.shutdown().await.unwrap();
        task.await.unwrap();

        assert!(queue.recv().await.is_none());
        assert!(!state.is_evicted());
        assert_eq!(state.lifecycle(), Lifecycle::Connected);
        assert!(hub.is_closed());
        assert_eq!(hub.stats().await, Err(HubError::Closed));
        assert_eq!(hub.publish(patch("doc", b"late")).await, Err(HubError::Closed));
    }

    #[tokio::test]
    async fn test_hub_stops_when_handles_dropped() {
        let (hub, task) = Hub::spawn(HubConfig::default());
        drop(hub);
        task.await.unwrap();
    }
}
