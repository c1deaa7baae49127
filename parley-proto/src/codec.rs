//! Serialization helpers shared by the client event surface and the broker bus.
//!
//! Client-facing events travel as JSON text frames; broker frames and fan-out
//! envelopes travel as postcard-encoded binary frames.

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Error type for codec encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// The frame is not valid for its channel (wrong kind, empty, oversized).
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
}

/// Encodes a value as a JSON string.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the value cannot be serialized.
pub fn to_json<T: Serialize>(value: &T) -> Result<String, CodecError> {
    serde_json::to_string(value).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Decodes a value from a JSON string.
///
/// # Errors
///
/// Returns `CodecError::InvalidFrame` for empty input and
/// `CodecError::Serialization` if the text does not match `T`.
pub fn from_json<T: DeserializeOwned>(text: &str) -> Result<T, CodecError> {
    if text.trim().is_empty() {
        return Err(CodecError::InvalidFrame("empty text frame".into()));
    }
    serde_json::from_str(text).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Encodes a value into bytes using postcard.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the value cannot be serialized.
pub fn to_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    postcard::to_allocvec(value).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Decodes a value from postcard bytes.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the bytes cannot be deserialized.
pub fn from_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    postcard::from_bytes(bytes).map_err(|e| CodecError::Serialization(e.to_string()))
}
