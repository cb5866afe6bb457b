//! Client-side error types.

use bidi_core::{CodecError, ReadyState};
use thiserror::Error;

/// Errors surfaced by [`ClientTransport`](crate::ClientTransport), either
/// returned from a call or carried by a `ClientEvent::Error`.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ClientError {
    /// The operation is not allowed in the current ready state.
    #[error("invalid state: {0}")]
    InvalidState(ReadyState),
    /// The stream URL could not be parsed.
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    /// The transport was created outside a Tokio runtime.
    #[error("no tokio runtime available")]
    NoRuntime,
    /// A pushed message or an outgoing value failed the codec.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    /// The push stream failed or ended.
    #[error("connection to {url} lost: {reason}")]
    ConnectionLost {
        /// Stream URL.
        url: String,
        /// What ended the stream.
        reason: String,
    },
    /// The server could not decode a message this client sent.
    #[error("server rejected message: {0}")]
    Unexpected(String),
}
