//! # bidi-client
//!
//! Peer side of bidi-sse: reads the server's push stream and posts
//! messages back, tagged with the session id from the handshake.

#![deny(unsafe_code)]

/// Client error type.
pub mod errors;
/// Incremental `text/event-stream` decoding.
pub mod sse;
/// The connection state machine.
pub mod transport;

pub use errors::ClientError;
pub use sse::{SseDecoder, SseFrame};
pub use transport::{ClientEvent, ClientEventKind, ClientOptions, ClientTransport};
