//! Storage encoding of envelopes.
//!
//! A stored envelope is one format byte followed by the envelope as a
//! MessagePack map. Transports keep each encoded envelope in a record that
//! already carries its own length (a stream entry field, a log slot), so the
//! encoding has no framing of its own.

use thiserror::Error;

use crate::envelope::Envelope;

/// Format byte of the current encoding.
pub const FORMAT_V1: u8 = 1;

/// Maximum encoded envelope size (16 MiB).
pub const MAX_ENVELOPE_SIZE: usize = 16 * 1024 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Encoded envelope exceeds the maximum size.
    #[error("Envelope size {0} exceeds maximum {MAX_ENVELOPE_SIZE}")]
    EnvelopeTooLarge(usize),

    /// No bytes to decode.
    #[error("Empty envelope data")]
    Empty,

    /// Data written by an unknown encoding.
    #[error("Unsupported envelope format {0}")]
    UnsupportedFormat(u8),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// JSON error on a socket frame.
    #[error("Malformed JSON frame: {0}")]
    Json(#[from] serde_json::Error),

    /// Socket frame without a usable `topic` field.
    #[error("topic is required")]
    MissingTopic,

    /// Invalid frame data.
    #[error("Invalid frame: {0}")]
    Invalid(String),
}

/// Encode an envelope for storage.
///
/// # Errors
///
/// Returns an error if the envelope is too large or encoding fails.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = Vec::with_capacity(64 + envelope.payload.len());
    buf.push(FORMAT_V1);
    rmp_serde::encode::write_named(&mut buf, envelope)?;

    let size = buf.len() - 1;
    if size > MAX_ENVELOPE_SIZE {
        return Err(ProtocolError::EnvelopeTooLarge(size));
    }
    Ok(buf)
}

/// Decode a stored envelope.
///
/// # Errors
///
/// Returns an error if the data is empty, too large, of an unknown format,
/// or not a valid envelope.
pub fn decode(data: &[u8]) -> Result<Envelope, ProtocolError> {
    let (&format, body) = data.split_first().ok_or(ProtocolError::Empty)?;
    if format != FORMAT_V1 {
        return Err(ProtocolError::UnsupportedFormat(format));
    }
    if body.len() > MAX_ENVELOPE_SIZE {
        return Err(ProtocolError::EnvelopeTooLarge(body.len()));
    }
    Ok(rmp_serde::from_slice(body)?)
}
