//! WebSocket connection adapter.
//!
//! Wraps a socket upgraded by axum. Binary messages carry length-prefixed
//! MessagePack envelopes, text messages carry JSON envelopes. Outbound
//! envelopes follow the framing the peer last used, so a browser speaking
//! JSON gets JSON back.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::BytesMut;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use scribe_protocol::{codec, Envelope, ProtocolError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::traits::{Connection, ConnectionId, FrameReader, FrameWriter, TransportError};

/// Default maximum inbound message size (64 KiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Framing of outbound envelopes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WireFormat {
    /// Length-prefixed MessagePack in binary messages.
    #[default]
    Binary,
    /// JSON in text messages.
    Json,
}

/// A connection over an upgraded axum WebSocket.
pub struct AxumConnection {
    id: ConnectionId,
    socket: WebSocket,
    remote_addr: Option<String>,
    max_message_size: usize,
    format: WireFormat,
}

impl AxumConnection {
    /// Wrap an upgraded socket.
    #[must_use]
    pub fn new(socket: WebSocket) -> Self {
        Self {
            id: ConnectionId::generate(),
            socket,
            remote_addr: None,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            format: WireFormat::Binary,
        }
    }

    /// Framing to use until the peer sends its first message.
    #[must_use]
    pub fn with_wire_format(mut self, format: WireFormat) -> Self {
        self.format = format;
        self
    }

    /// Set the maximum accepted inbound message size.
    #[must_use]
    pub fn with_max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    /// Record the peer address for logging.
    #[must_use]
    pub fn with_remote_addr(mut self, addr: impl Into<String>) -> Self {
        self.remote_addr = Some(addr.into());
        self
    }
}

impl Connection for AxumConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn remote_addr(&self) -> Option<String> {
        self.remote_addr.clone()
    }

    fn split(self: Box<Self>) -> (Box<dyn FrameReader>, Box<dyn FrameWriter>) {
        let this = *self;
        let (sink, stream) = this.socket.split();
        let text_peer = Arc::new(AtomicBool::new(this.format == WireFormat::Json));
        let reader = WebSocketReader {
            id: this.id,
            stream,
            read_buffer: BytesMut::with_capacity(4096),
            max_message_size: this.max_message_size,
            text_peer: Arc::clone(&text_peer),
        };
        let writer = WebSocketWriter {
            id: this.id,
            sink,
            closed: false,
            text_peer,
        };
        (Box::new(reader), Box::new(writer))
    }
}

/// Read half of an [`AxumConnection`].
pub struct WebSocketReader {
    id: ConnectionId,
    stream: SplitStream<WebSocket>,
    read_buffer: BytesMut,
    max_message_size: usize,
    text_peer: Arc<AtomicBool>,
}

#[async_trait]
impl FrameReader for WebSocketReader {
    async fn recv(&mut self) -> Result<Option<Envelope>, TransportError> {
        // A previous binary message may have carried more than one frame.
        if let Some(envelope) = codec::decode_from(&mut self.read_buffer)? {
            return Ok(Some(envelope));
        }

        loop {
            match self.stream.next().await {
                Some(Ok(Message::Binary(data))) => {
                    if data.len() > self.max_message_size {
                        warn!(
                            connection = %self.id,
                            size = data.len(),
                            max = self.max_message_size,
                            "Message too large"
                        );
                        return Err(ProtocolError::FrameTooLarge(data.len()).into());
                    }

                    self.text_peer.store(false, Ordering::Relaxed);
                    self.read_buffer.extend_from_slice(&data);
                    if self.read_buffer.len() > self.max_message_size {
                        return Err(ProtocolError::FrameTooLarge(self.read_buffer.len()).into());
                    }

                    if let Some(envelope) = codec::decode_from(&mut self.read_buffer)? {
                        return Ok(Some(envelope));
                    }
                    // Partial frame, keep reading
                }
                Some(Ok(Message::Text(text))) => {
                    if text.len() > self.max_message_size {
                        return Err(ProtocolError::FrameTooLarge(text.len()).into());
                    }
                    self.text_peer.store(true, Ordering::Relaxed);
                    return Ok(Some(codec::decode_json(&text)?));
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                    // Answered by the socket itself
                }
                Some(Ok(Message::Close(_))) => {
                    debug!(connection = %self.id, "Received close frame");
                    return Ok(None);
                }
                Some(Err(e)) => {
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
                None => {
                    debug!(connection = %self.id, "WebSocket stream ended");
                    return Ok(None);
                }
            }
        }
    }
}

/// Write half of an [`AxumConnection`].
pub struct WebSocketWriter {
    id: ConnectionId,
    sink: SplitSink<WebSocket, Message>,
    closed: bool,
    // Set by the read half when the peer speaks JSON.
    text_peer: Arc<AtomicBool>,
}

#[async_trait]
impl FrameWriter for WebSocketWriter {
    async fn send(&mut self, envelope: &Envelope) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::ConnectionClosed);
        }

        let message = if self.text_peer.load(Ordering::Relaxed) {
            Message::Text(codec::encode_json(envelope)?)
        } else {
            Message::Binary(codec::encode(envelope)?.to_vec())
        };
        self.sink
            .send(message)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        debug!(connection = %self.id, "Closing WebSocket");
        self.sink
            .close()
            .await
            .map_err(|e| TransportError::Other(format!("Failed to close: {}", e)))
    }
}
