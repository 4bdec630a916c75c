//! In-process connection pair.
//!
//! The server side implements [`Connection`]; the client side is a
//! [`MemoryPeer`] that sends encoded frames and receives envelopes. A peer
//! that stops calling [`MemoryPeer::recv`] behaves like a slow consumer: once
//! its buffer is full the session's write half stalls.

use async_trait::async_trait;
use bytes::Bytes;
use scribe_protocol::{codec, Envelope};
use tokio::sync::mpsc;

use crate::traits::{Connection, ConnectionId, FrameReader, FrameWriter, TransportError};

/// Create a connected pair.
///
/// `capacity` bounds the number of envelopes buffered towards the peer
/// (minimum 1).
#[must_use]
pub fn pair(capacity: usize) -> (MemoryConnection, MemoryPeer) {
    let (to_server, from_peer) = mpsc::channel(capacity.max(1));
    let (to_peer, from_server) = mpsc::channel(capacity.max(1));

    let connection = MemoryConnection {
        id: ConnectionId::generate(),
        inbound: from_peer,
        outbound: to_peer,
    };
    let peer = MemoryPeer {
        outbound: Some(to_server),
        inbound: from_server,
    };
    (connection, peer)
}

/// Server side of an in-process pair.
pub struct MemoryConnection {
    id: ConnectionId,
    inbound: mpsc::Receiver<Bytes>,
    outbound: mpsc::Sender<Envelope>,
}

impl Connection for MemoryConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn remote_addr(&self) -> Option<String> {
        Some("memory".to_string())
    }

    fn split(self: Box<Self>) -> (Box<dyn FrameReader>, Box<dyn FrameWriter>) {
        let this = *self;
        let reader = MemoryReader {
            inbound: this.inbound,
        };
        let writer = MemoryWriter {
            outbound: Some(this.outbound),
        };
        (Box::new(reader), Box::new(writer))
    }
}

struct MemoryReader {
    inbound: mpsc::Receiver<Bytes>,
}

#[async_trait]
impl FrameReader for MemoryReader {
    async fn recv(&mut self) -> Result<Option<Envelope>, TransportError> {
        match self.inbound.recv().await {
            Some(data) => Ok(Some(codec::decode(&data)?)),
            None => Ok(None),
        }
    }
}

struct MemoryWriter {
    outbound: Option<mpsc::Sender<Envelope>>,
}

#[async_trait]
impl FrameWriter for MemoryWriter {
    async fn send(&mut self, envelope: &Envelope) -> Result<(), TransportError> {
        let outbound = self
            .outbound
            .as_ref()
            .ok_or(TransportError::ConnectionClosed)?;
        outbound
            .send(envelope.clone())
            .await
            .map_err(|_| TransportError::SendFailed("peer dropped".into()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.outbound = None;
        Ok(())
    }
}

/// Client side of an in-process pair.
pub struct MemoryPeer {
    outbound: Option<mpsc::Sender<Bytes>>,
    inbound: mpsc::Receiver<Envelope>,
}

impl MemoryPeer {
    /// Encode and send an envelope to the server.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails or the server side is gone.
    pub async fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        self.send_raw(codec::encode(envelope)?).await
    }

    /// Send raw bytes, bypassing the encoder.
    ///
    /// # Errors
    ///
    /// Returns an error if the peer hung up or the server side is gone.
    pub async fn send_raw(&self, data: impl Into<Bytes>) -> Result<(), TransportError> {
        let outbound = self
            .outbound
            .as_ref()
            .ok_or(TransportError::ConnectionClosed)?;
        outbound
            .send(data.into())
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Receive the next envelope delivered by the server.
    ///
    /// Returns `None` once the server closed its write half.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.inbound.recv().await
    }

    /// Receive an envelope if one is already buffered.
    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.inbound.try_recv().ok()
    }

    /// Hang up: the server's read half observes a clean close.
    pub fn hang_up(&mut self) {
        self.outbound = None;
    }
}
