//! Transport abstraction traits for Scribe.
//!
//! These traits define what a session needs from a physical connection,
//! keeping the hub and sessions independent of the wire transport.

use async_trait::async_trait;
use scribe_protocol::Envelope;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a physical connection, used in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate the next connection ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{:x}", self.0)
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] scribe_protocol::ProtocolError),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Whether the error was caused by malformed data from the peer.
    #[must_use]
    pub fn is_protocol(&self) -> bool {
        matches!(self, TransportError::Protocol(_))
    }
}

/// The inbound half of a connection.
#[async_trait]
pub trait FrameReader: Send {
    /// Receive the next envelope from the connection.
    ///
    /// Returns `None` if the connection is closed cleanly.
    async fn recv(&mut self) -> Result<Option<Envelope>, TransportError>;
}

/// The outbound half of a connection.
#[async_trait]
pub trait FrameWriter: Send {
    /// Send an envelope to the connection.
    async fn send(&mut self, envelope: &Envelope) -> Result<(), TransportError>;

    /// Close the connection gracefully.
    ///
    /// Closing an already closed writer succeeds.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// An admitted connection, ready to be driven by a session.
pub trait Connection: Send {
    /// Identifier used in logs.
    fn id(&self) -> ConnectionId;

    /// Get the remote address of the connection, if available.
    fn remote_addr(&self) -> Option<String> {
        None
    }

    /// Split the connection into independently owned read and write halves.
    fn split(self: Box<Self>) -> (Box<dyn FrameReader>, Box<dyn FrameWriter>);
}
