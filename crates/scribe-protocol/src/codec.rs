//! Codec for encoding and decoding Scribe envelopes.
//!
//! Binary frames are MessagePack with a length prefix. Text frames carry the
//! same envelope as JSON.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::frames::Envelope;

/// Maximum frame size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// Not enough data to decode frame.
    #[error("Incomplete frame: need {0} more bytes")]
    Incomplete(usize),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// JSON decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid frame data.
    #[error("Invalid frame: {0}")]
    Invalid(String),
}

/// Encode an envelope to bytes.
///
/// The encoded format is:
/// - 4 bytes: Big-endian length prefix
/// - N bytes: MessagePack-encoded envelope
///
/// # Errors
///
/// Returns an error if the envelope is too large or encoding fails.
pub fn encode(envelope: &Envelope) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    encode_into(envelope, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode an envelope into an existing buffer.
///
/// # Errors
///
/// Returns an error if the envelope is too large or encoding fails.
pub fn encode_into(envelope: &Envelope, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let body = rmp_serde::to_vec_named(envelope)?;

    if body.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(body.len()));
    }

    buf.reserve(LENGTH_PREFIX_SIZE + body.len());
    buf.put_u32(body.len() as u32);
    buf.extend_from_slice(&body);

    Ok(())
}

/// Decode an envelope from a complete binary frame.
///
/// Trailing bytes after the declared length are rejected.
///
/// # Errors
///
/// Returns an error if the data is incomplete, too large, or invalid.
pub fn decode(data: &[u8]) -> Result<Envelope, ProtocolError> {
    let length = read_length(data)?.ok_or(ProtocolError::Incomplete(
        LENGTH_PREFIX_SIZE.saturating_sub(data.len()),
    ))?;

    let total_size = LENGTH_PREFIX_SIZE + length;
    if data.len() < total_size {
        return Err(ProtocolError::Incomplete(total_size - data.len()));
    }
    if data.len() > total_size {
        return Err(ProtocolError::Invalid(format!(
            "{} trailing bytes after frame",
            data.len() - total_size
        )));
    }

    let envelope = rmp_serde::from_slice(&data[LENGTH_PREFIX_SIZE..total_size])?;
    Ok(envelope)
}

/// Try to decode an envelope from a buffer, advancing it if successful.
///
/// Returns `Ok(Some(envelope))` if a complete frame was decoded,
/// `Ok(None)` if more data is needed, or `Err` on protocol error.
///
/// # Errors
///
/// Returns an error if the frame is too large or invalid.
pub fn decode_from(buf: &mut BytesMut) -> Result<Option<Envelope>, ProtocolError> {
    let Some(length) = read_length(buf)? else {
        return Ok(None);
    };

    if buf.len() < LENGTH_PREFIX_SIZE + length {
        return Ok(None);
    }

    buf.advance(LENGTH_PREFIX_SIZE);
    let body = buf.split_to(length);
    let envelope = rmp_serde::from_slice(&body)?;

    Ok(Some(envelope))
}

/// Decode an envelope from a JSON text frame.
///
/// The payload may be given either as a string or as an array of bytes.
///
/// # Errors
///
/// Returns an error if the text is too large or not a valid envelope.
pub fn decode_json(text: &str) -> Result<Envelope, ProtocolError> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }
    Ok(serde_json::from_str(text)?)
}

/// Encode an envelope as a JSON text frame, the payload as an array of bytes.
///
/// # Errors
///
/// Returns an error if the envelope is too large or encoding fails.
pub fn encode_json(envelope: &Envelope) -> Result<String, ProtocolError> {
    let text = serde_json::to_string(envelope)?;
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }
    Ok(text)
}

fn read_length(data: &[u8]) -> Result<Option<usize>, ProtocolError> {
    if data.len() < LENGTH_PREFIX_SIZE {
        return Ok(None);
    }

    let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }

    Ok(Some(length))
}
