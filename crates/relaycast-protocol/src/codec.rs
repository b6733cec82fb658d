//! Codec for encoding and decoding relaycast envelopes.
//!
//! Envelopes travel as JSON text frames over the transport. The codec is
//! symmetric: `decode` accepts anything `encode` produces, and malformed or
//! oversized input is rejected before anything reaches the hub.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::envelope::Envelope;

/// Maximum encoded message size (64 KiB).
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Message exceeds maximum size.
    #[error("Message size {0} exceeds maximum {MAX_MESSAGE_SIZE}")]
    MessageTooLarge(usize),

    /// JSON encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[source] serde_json::Error),

    /// JSON decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Encode an envelope to a JSON text frame.
///
/// # Errors
///
/// Returns an error if the envelope is too large or serialization fails.
pub fn encode<T: Serialize>(envelope: &Envelope<T>) -> Result<String, ProtocolError> {
    let text = serde_json::to_string(envelope).map_err(ProtocolError::Encode)?;

    if text.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge(text.len()));
    }

    Ok(text)
}

/// Decode an envelope from a JSON text frame.
///
/// # Errors
///
/// Returns an error if the input is too large or is not a well-formed
/// envelope.
pub fn decode<T: DeserializeOwned>(text: &str) -> Result<Envelope<T>, ProtocolError> {
    if text.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge(text.len()));
    }

    serde_json::from_str(text).map_err(ProtocolError::Decode)
}
