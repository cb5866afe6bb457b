//! Pluggable text codec.
//!
//! Both directions of the protocol carry one encoded value per message. The
//! codec turns a [`Value`] into the text placed in an SSE `data:` field or a
//! POST body, and back.

use std::fmt;

use serde_json::Value;
use thiserror::Error;

/// Failure while encoding or decoding a message.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// The value could not be turned into text.
    #[error("encode failed: {0}")]
    Encode(String),
    /// The text is not a valid message.
    #[error("{0}")]
    Decode(String),
}

impl CodecError {
    /// Human-readable description, without the variant prefix.
    pub fn description(&self) -> &str {
        match self {
            Self::Encode(msg) | Self::Decode(msg) => msg,
        }
    }
}

/// Text codec used on both ends of a connection.
pub trait Codec: Send + Sync + fmt::Debug {
    /// Serialize one message.
    fn encode(&self, value: &Value) -> Result<String, CodecError>;
    /// Parse one message.
    fn decode(&self, text: &str) -> Result<Value, CodecError>;
}

/// The default codec: JSON via `serde_json`.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, value: &Value) -> Result<String, CodecError> {
        serde_json::to_string(value).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, text: &str) -> Result<Value, CodecError> {
        serde_json::from_str(text).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_encode_object() {
        let text = JsonCodec.encode(&json!({"x": 1})).unwrap();
        assert_eq!(text, r#"{"x":1}"#);
    }

    #[test]
    fn json_decode_object() {
        let value = JsonCodec.decode(r#"{"x":1}"#).unwrap();
        assert_eq!(value["x"], 1);
    }

    #[test]
    fn json_decode_failure_has_description() {
        let err = JsonCodec.decode("not-json").unwrap_err();
        assert!(matches!(err, CodecError::Decode(_)));
        assert!(!err.description().is_empty());
        assert_eq!(err.to_string(), err.description());
    }

    #[test]
    fn json_encodes_strings_quoted() {
        let text = JsonCodec.encode(&Value::String("abc".into())).unwrap();
        assert_eq!(text, "\"abc\"");
    }

    #[test]
    fn encode_error_display() {
        let err = CodecError::Encode("boom".into());
        assert_eq!(err.to_string(), "encode failed: boom");
        assert_eq!(err.description(), "boom");
    }
}
