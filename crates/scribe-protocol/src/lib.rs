//! # scribe-protocol
//!
//! Wire format for the Scribe collaboration hub.
//!
//! Every frame exchanged between an editor and the server is an [`Envelope`]:
//! the document it concerns, a kind tag, and an opaque payload. The hub never
//! looks inside the payload; merge logic lives in the clients.
//!
//! ## Kinds
//!
//! - `patch` - document updates produced by the editor
//! - `presence` - who is looking at the document
//! - `cursor` - caret and selection positions
//! - `control` - application-level signalling
//!
//! ## Example
//!
//! ```rust
//! use scribe_protocol::{codec, Envelope, MessageKind};
//!
//! let envelope = Envelope::new("doc-42", MessageKind::Patch, b"\x01\x02".to_vec());
//!
//! let encoded = codec::encode(&envelope).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(envelope, decoded);
//! ```

pub mod codec;
pub mod frames;

pub use codec::{decode, decode_json, encode, encode_json, ProtocolError};
pub use frames::{Envelope, MessageKind};
