//! # scribe-transport
//!
//! Connection adapters for the Scribe collaboration hub.
//!
//! A [`Connection`] is an already-admitted duplex stream of envelopes. It is
//! split into a [`FrameReader`] and a [`FrameWriter`] so the session can read
//! and write from independent tasks:
//!
//! - **WebSocket** - an upgraded axum socket (feature `websocket`, default)
//! - **Memory** - an in-process pair, used by tests and benchmarks
//!
//! ```rust,ignore
//! use scribe_transport::Connection;
//!
//! async fn pump(conn: Box<dyn Connection>) {
//!     let (mut reader, mut writer) = conn.split();
//!     while let Ok(Some(envelope)) = reader.recv().await {
//!         let _ = writer.send(&envelope).await;
//!     }
//! }
//! ```

pub mod memory;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use traits::{Connection, ConnectionId, FrameReader, FrameWriter, TransportError};

#[cfg(feature = "websocket")]
pub use websocket::{AxumConnection, WireFormat};
