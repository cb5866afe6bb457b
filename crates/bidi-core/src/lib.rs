//! # bidi-core
//!
//! Types shared by the server and client halves of bidi-sse.
//!
//! - [`ids::SessionId`]: opaque per-connection session identifier
//! - [`state::ReadyState`]: `Connecting → Open → Closing → Closed`
//! - [`codec::Codec`]: pluggable text codec over [`serde_json::Value`]
//! - [`emitter::Emitter`]: closed-kind publish/subscribe surface
//! - [`protocol`]: wire constants (event names, query parameter, content type)

#![deny(unsafe_code)]

/// Message encoding.
pub mod codec;
/// Typed listener registry.
pub mod emitter;
/// Session identifiers.
pub mod ids;
/// Wire-level names and header helpers.
pub mod protocol;
/// Connection ready states.
pub mod state;

pub use codec::{Codec, CodecError, JsonCodec};
pub use emitter::{Emitter, Event, ListenerId};
pub use ids::SessionId;
pub use state::{AtomicReadyState, ReadyState};
