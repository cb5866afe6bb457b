//! Server-side error types.

use std::path::PathBuf;

use bidi_core::CodecError;
use thiserror::Error;

/// Failure writing a frame to a push channel.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PushError {
    /// The channel was ended or its stream is gone.
    #[error("push channel ended")]
    Ended,
    /// The outbound queue is full; the frame was dropped.
    #[error("push queue full, frame dropped")]
    QueueFull,
    /// Event names may not contain line breaks.
    #[error("invalid event name: {0:?}")]
    InvalidEventName(String),
}

/// Payload of a session `error` event.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    /// The message could not be encoded.
    #[error("failed to encode outgoing message: {0}")]
    Encode(#[from] CodecError),
    /// The encoded frame could not be queued.
    #[error("failed to push message: {0}")]
    Push(#[from] PushError),
}

/// Invalid server configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// `base_path` is not absolute.
    #[error("base path must start with '/': {0:?}")]
    InvalidBasePath(String),
    /// A configured header name is not a valid HTTP header name.
    #[error("invalid header name {name:?}: {reason}")]
    InvalidHeaderName {
        /// Header name as configured.
        name: String,
        /// Parser message.
        reason: String,
    },
    /// A configured header value is not a valid HTTP header value.
    #[error("invalid value for header {name:?}: {reason}")]
    InvalidHeaderValue {
        /// Header the value belongs to.
        name: String,
        /// Parser message.
        reason: String,
    },
    /// A handshake event or session parameter name is unusable.
    #[error("invalid {field}: {reason}")]
    InvalidName {
        /// Config field holding the name.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
    /// The config file exists but could not be read.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// File that was being read.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },
    /// The config file is not valid JSON for this schema.
    #[error("failed to parse config JSON: {0}")]
    Json(#[from] serde_json::Error),
}
