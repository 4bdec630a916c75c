//! Sessions: one admitted connection bridged to the hub.
//!
//! A session owns a bounded outbound queue. The hub holds the only sender of
//! that queue inside a [`SessionHandle`] and only ever *offers* messages to
//! it; when an offer fails the hub evicts the session and drops the handle,
//! which closes the queue.
//!
//! ```text
//!            ┌──────────── Session ────────────┐
//! socket ───▶│ read half ──publish──▶ Hub      │
//!            │                         │       │
//! socket ◀───│ write half ◀──queue─────┘       │
//!            └─────────────────────────────────┘
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use scribe_protocol::Envelope;
use scribe_transport::{Connection, FrameReader, FrameWriter, TransportError};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::admission::Identity;
use crate::hub::HubHandle;
use crate::message::Message;
use crate::room::DocumentId;

/// Default outbound queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// How long the write half may keep flushing after the session started leaving.
const WRITE_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique per-connection session token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    /// Allocate a fresh session ID.
    #[must_use]
    pub fn next() -> Self {
        Self(SESSION_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sess-{}", self.0)
    }
}

/// Session lifecycle.
///
/// `Connected → Joined → Leaving → Closed`; `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Lifecycle {
    /// Admitted, not yet a room member.
    Connected = 0,
    /// Member of exactly one room.
    Joined = 1,
    /// Teardown in progress.
    Leaving = 2,
    /// Queue released and connection closed.
    Closed = 3,
}

impl Lifecycle {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Lifecycle::Connected,
            1 => Lifecycle::Joined,
            2 => Lifecycle::Leaving,
            _ => Lifecycle::Closed,
        }
    }
}

/// State shared between a session and its hub handle.
#[derive(Debug)]
pub struct SessionState {
    lifecycle: AtomicU8,
    evicted: AtomicBool,
    close_requested: AtomicBool,
    evicted_notify: Notify,
    close_notify: Notify,
}

impl SessionState {
    /// Create state for a freshly admitted session.
    #[must_use]
    pub fn new() -> Self {
        Self {
            lifecycle: AtomicU8::new(Lifecycle::Connected as u8),
            evicted: AtomicBool::new(false),
            close_requested: AtomicBool::new(false),
            evicted_notify: Notify::new(),
            close_notify: Notify::new(),
        }
    }

    /// Current lifecycle stage.
    #[must_use]
    pub fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_u8(self.lifecycle.load(Ordering::Acquire))
    }

    /// Move `Connected → Joined`. Returns `false` from any other stage.
    pub fn mark_joined(&self) -> bool {
        self.lifecycle
            .compare_exchange(
                Lifecycle::Connected as u8,
                Lifecycle::Joined as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Move to `Leaving`.
    ///
    /// Returns `true` for exactly one caller; later calls are no-ops.
    pub fn begin_leaving(&self) -> bool {
        self.lifecycle
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                match Lifecycle::from_u8(current) {
                    Lifecycle::Connected | Lifecycle::Joined => Some(Lifecycle::Leaving as u8),
                    Lifecycle::Leaving | Lifecycle::Closed => None,
                }
            })
            .is_ok()
    }

    /// Move to the terminal `Closed` stage.
    pub fn mark_closed(&self) {
        self.lifecycle
            .store(Lifecycle::Closed as u8, Ordering::Release);
    }

    /// Record that the hub evicted this session.
    ///
    /// Returns `true` the first time only.
    pub fn mark_evicted(&self) -> bool {
        let first = !self.evicted.swap(true, Ordering::AcqRel);
        if first {
            self.evicted_notify.notify_one();
        }
        first
    }

    /// Whether the hub evicted this session.
    #[must_use]
    pub fn is_evicted(&self) -> bool {
        self.evicted.load(Ordering::Acquire)
    }

    /// Ask the session to terminate.
    ///
    /// Returns `true` the first time only.
    pub fn request_close(&self) -> bool {
        let first = !self.close_requested.swap(true, Ordering::AcqRel);
        if first {
            self.close_notify.notify_one();
        }
        first
    }

    /// Whether a close was requested.
    #[must_use]
    pub fn is_close_requested(&self) -> bool {
        self.close_requested.load(Ordering::Acquire)
    }

    async fn evicted(&self) {
        if !self.is_evicted() {
            self.evicted_notify.notified().await;
        }
    }

    async fn close_requested(&self) {
        if !self.is_close_requested() {
            self.close_notify.notified().await;
        }
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

/// Why an offer to a session's queue failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferError {
    /// The queue is at capacity.
    Full,
    /// The receiving side is gone.
    Closed,
}

impl OfferError {
    /// Label used in logs and metrics.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            OfferError::Full => "queue_full",
            OfferError::Closed => "queue_closed",
        }
    }
}

/// The hub's side of a session: the sender of its outbound queue.
///
/// Not `Clone`: dropping the handle is what releases the queue.
#[derive(Debug)]
pub struct SessionHandle {
    id: SessionId,
    outbound: mpsc::Sender<Arc<Message>>,
    state: Arc<SessionState>,
}

impl SessionHandle {
    /// Create a handle with a fresh queue of `capacity` (minimum 1).
    #[must_use]
    pub fn new(id: SessionId, capacity: usize) -> (Self, SessionQueue) {
        Self::with_state(id, capacity, Arc::new(SessionState::new()))
    }

    /// Create a handle sharing an existing session state.
    #[must_use]
    pub fn with_state(
        id: SessionId,
        capacity: usize,
        state: Arc<SessionState>,
    ) -> (Self, SessionQueue) {
        let (outbound, inbound) = mpsc::channel(capacity.max(1));
        let handle = Self {
            id,
            outbound,
            state,
        };
        (handle, SessionQueue { inbound })
    }

    /// Session identifier.
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Shared session state.
    #[must_use]
    pub fn state(&self) -> &Arc<SessionState> {
        &self.state
    }

    /// Offer a message without waiting.
    ///
    /// # Errors
    ///
    /// Returns why the message could not be queued.
    pub fn offer(&self, message: Arc<Message>) -> Result<(), OfferError> {
        self.outbound.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => OfferError::Full,
            mpsc::error::TrySendError::Closed(_) => OfferError::Closed,
        })
    }
}

/// The session's side of its outbound queue.
#[derive(Debug)]
pub struct SessionQueue {
    inbound: mpsc::Receiver<Arc<Message>>,
}

impl SessionQueue {
    /// Wait for the next message; `None` once the hub released the queue.
    pub async fn recv(&mut self) -> Option<Arc<Message>> {
        self.inbound.recv().await
    }

    /// Take a message if one is queued.
    pub fn try_recv(&mut self) -> Option<Arc<Message>> {
        self.inbound.try_recv().ok()
    }

    /// Whether the hub released the queue and it is fully drained.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.inbound.is_closed() && self.inbound.is_empty()
    }
}

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Outbound queue capacity.
    pub queue_capacity: usize,
    /// Terminate the session after this long without inbound frames.
    pub idle_timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            idle_timeout: None,
        }
    }
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Peer closed the connection, or the session was closed on request.
    Closed,
    /// The hub evicted the session because its queue overflowed.
    Evicted,
    /// The peer sent a malformed frame or addressed another document.
    ProtocolViolation,
    /// Reading from or writing to the connection failed.
    TransportError,
    /// No inbound frame within the idle timeout.
    IdleTimeout,
    /// The hub was not running.
    HubUnavailable,
}

impl SessionOutcome {
    /// Label used in logs and metrics.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionOutcome::Closed => "closed",
            SessionOutcome::Evicted => "evicted",
            SessionOutcome::ProtocolViolation => "protocol_violation",
            SessionOutcome::TransportError => "transport_error",
            SessionOutcome::IdleTimeout => "idle_timeout",
            SessionOutcome::HubUnavailable => "hub_unavailable",
        }
    }
}

impl fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the write half stopped.
#[derive(Debug)]
enum WriteEnd {
    Released,
    Evicted,
    Failed(TransportError),
}

enum ReadError {
    Idle,
    Transport(TransportError),
}

/// An admitted connection bound to one document.
pub struct Session {
    id: SessionId,
    document_id: DocumentId,
    identity: Identity,
    config: SessionConfig,
    state: Arc<SessionState>,
}

impl Session {
    /// Create a session for an admitted identity.
    #[must_use]
    pub fn new(document_id: impl Into<DocumentId>, identity: Identity, config: SessionConfig) -> Self {
        Self {
            id: SessionId::next(),
            document_id: document_id.into(),
            identity,
            config,
            state: Arc::new(SessionState::new()),
        }
    }

    /// Session identifier.
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Document the session is bound to.
    #[must_use]
    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    /// Shared state, usable to observe the lifecycle or request a close.
    #[must_use]
    pub fn state(&self) -> Arc<SessionState> {
        Arc::clone(&self.state)
    }

    /// Drive the connection until it ends.
    ///
    /// Joins the hub, spawns the write half, runs the read half on the
    /// current task, and leaves the hub exactly once on the way out.
    pub async fn run(self, hub: HubHandle, connection: Box<dyn Connection>) -> SessionOutcome {
        let connection_id = connection.id();
        let remote = connection.remote_addr();
        let (mut reader, mut writer) = connection.split();
        let (handle, queue) =
            SessionHandle::with_state(self.id, self.config.queue_capacity, Arc::clone(&self.state));

        if hub.join(handle, self.document_id.clone()).await.is_err() {
            warn!(session = %self.id, "Hub unavailable, dropping connection");
            let _ = writer.close().await;
            self.state.mark_closed();
            return SessionOutcome::HubUnavailable;
        }
        self.state.mark_joined();

        info!(
            session = %self.id,
            connection = %connection_id,
            remote = remote.as_deref().unwrap_or("unknown"),
            document = %self.document_id,
            user = %self.identity.user_id,
            "Session joined"
        );

        let mut write_half = Some(tokio::spawn(write_loop(
            self.id,
            queue,
            writer,
            Arc::clone(&self.state),
        )));

        let outcome = self.read_loop(&hub, reader.as_mut(), &mut write_half).await;
        self.teardown(&hub, write_half, outcome).await
    }

    async fn read_loop(
        &self,
        hub: &HubHandle,
        reader: &mut dyn FrameReader,
        write_half: &mut Option<JoinHandle<WriteEnd>>,
    ) -> SessionOutcome {
        loop {
            let Some(writer_task) = write_half.as_mut() else {
                return SessionOutcome::Closed;
            };

            tokio::select! {
                inbound = recv_with_timeout(reader, self.config.idle_timeout) => match inbound {
                    Ok(Some(envelope)) => {
                        if let Some(outcome) = self.publish(hub, envelope).await {
                            return outcome;
                        }
                    }
                    Ok(None) => {
                        debug!(session = %self.id, "Peer closed connection");
                        return SessionOutcome::Closed;
                    }
                    Err(ReadError::Idle) => {
                        debug!(session = %self.id, "Idle timeout");
                        return SessionOutcome::IdleTimeout;
                    }
                    Err(ReadError::Transport(e)) if e.is_protocol() => {
                        warn!(session = %self.id, error = %e, "Malformed frame");
                        return SessionOutcome::ProtocolViolation;
                    }
                    Err(ReadError::Transport(e)) => {
                        debug!(session = %self.id, error = %e, "Read failed");
                        return SessionOutcome::TransportError;
                    }
                },
                finished = writer_task => {
                    *write_half = None;
                    return match finished {
                        Ok(WriteEnd::Evicted) => SessionOutcome::Evicted,
                        Ok(WriteEnd::Released) if self.state.is_evicted() => SessionOutcome::Evicted,
                        Ok(WriteEnd::Released) => SessionOutcome::Closed,
                        Ok(WriteEnd::Failed(e)) => {
                            debug!(session = %self.id, error = %e, "Write failed");
                            SessionOutcome::TransportError
                        }
                        Err(e) => {
                            warn!(session = %self.id, error = %e, "Write half panicked");
                            SessionOutcome::TransportError
                        }
                    };
                },
                _ = self.state.close_requested() => {
                    debug!(session = %self.id, "Close requested");
                    return SessionOutcome::Closed;
                },
            }
        }
    }

    /// Publish one inbound envelope; returns an outcome if the session must end.
    async fn publish(&self, hub: &HubHandle, envelope: Envelope) -> Option<SessionOutcome> {
        if envelope.document_id != self.document_id {
            warn!(
                session = %self.id,
                expected = %self.document_id,
                received = %envelope.document_id,
                "Envelope addressed to another document"
            );
            return Some(SessionOutcome::ProtocolViolation);
        }

        let message = Message::from_envelope(envelope).with_source(self.id);
        trace!(session = %self.id, kind = %message.kind(), bytes = message.payload().len(), "Inbound message");

        if hub.publish(message).await.is_err() {
            return Some(SessionOutcome::HubUnavailable);
        }
        None
    }

    async fn teardown(
        self,
        hub: &HubHandle,
        write_half: Option<JoinHandle<WriteEnd>>,
        outcome: SessionOutcome,
    ) -> SessionOutcome {
        if self.state.begin_leaving() {
            // Leaving releases the hub's sender, which lets the write half finish.
            if hub.leave(self.id).await.is_err() {
                debug!(session = %self.id, "Hub already stopped");
            }
        }

        if let Some(mut task) = write_half {
            if tokio::time::timeout(WRITE_DRAIN_TIMEOUT, &mut task)
                .await
                .is_err()
            {
                debug!(session = %self.id, "Write half did not drain in time");
                task.abort();
            }
        }

        self.state.mark_closed();
        info!(session = %self.id, document = %self.document_id, outcome = %outcome, "Session closed");
        outcome
    }
}

async fn recv_with_timeout(
    reader: &mut dyn FrameReader,
    idle_timeout: Option<Duration>,
) -> Result<Option<Envelope>, ReadError> {
    match idle_timeout {
        Some(limit) => match tokio::time::timeout(limit, reader.recv()).await {
            Ok(result) => result.map_err(ReadError::Transport),
            Err(_) => Err(ReadError::Idle),
        },
        None => reader.recv().await.map_err(ReadError::Transport),
    }
}

/// Drain the outbound queue onto the connection in FIFO order.
async fn write_loop(
    id: SessionId,
    mut queue: SessionQueue,
    mut writer: Box<dyn FrameWriter>,
    state: Arc<SessionState>,
) -> WriteEnd {
    let end = loop {
        let message = tokio::select! {
            biased;
            _ = state.evicted() => break WriteEnd::Evicted,
            next = queue.recv() => match next {
                Some(message) => message,
                None => break WriteEnd::Released,
            },
        };

        let envelope = message.to_envelope();
        tokio::select! {
            biased;
            _ = state.evicted() => break WriteEnd::Evicted,
            sent = writer.send(&envelope) => {
                if let Err(e) = sent {
                    break WriteEnd::Failed(e);
                }
            }
        }
    };

    trace!(session = %id, end = ?end, "Write half finished");
    match tokio::time::timeout(WRITE_DRAIN_TIMEOUT, writer.close()).await {
        Ok(Err(e)) => debug!(session = %id, error = %e, "Close failed"),
        Err(_) => debug!(session = %id, "Close timed out"),
        Ok(Ok(())) => {}
    }
    end
}
