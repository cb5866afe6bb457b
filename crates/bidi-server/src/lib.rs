//! # bidi-server
//!
//! Server half of bidi-sse: full-duplex messaging where the server pushes
//! over a Server-Sent Events stream and the peer answers with plain `POST`
//! requests tagged with its session id.
//!
//! - [`BidiServer`]: axum router / middleware, server events, orchestrated close
//! - [`Dispatcher`]: decides which requests belong to the protocol
//! - [`SessionRegistry`]: id → open [`PeerSession`] routing table
//! - [`PeerSession`]: one peer bound to one push channel
//! - [`ServerConfig`]: configuration, loaded from JSON plus `BIDI_*` env vars

#![deny(unsafe_code)]

/// Push channels and their streams.
pub mod channel;
/// Server configuration and loading.
pub mod config;
/// Request routing for the protocol endpoint.
pub mod dispatcher;
/// Error types.
pub mod errors;
/// Live session bookkeeping.
pub mod registry;
/// The server facade and listener.
pub mod server;
/// Per-peer sessions.
pub mod session;

pub use channel::{PushChannel, PushFrame, PushStream, StreamChannel};
pub use config::{load_config_from_path, ServerConfig};
pub use dispatcher::{Dispatch, Dispatcher};
pub use errors::{ConfigError, PushError, SessionError};
pub use registry::{IdGenerator, SessionRegistry, SessionsView};
pub use server::{BidiServer, ServerEvent, ServerEventKind, ServerHandle};
pub use session::{PeerSession, SessionEvent, SessionEventKind};
