//! Request dispatcher: decides whether a request belongs to the protocol.
//!
//! Two request shapes are handled, everything else is handed back untouched:
//!
//! - `GET <base>` with `Accept: text/event-stream` opens a push stream and
//!   admits a new session.
//! - `POST <base>...?<param>=<id>` for a registered id delivers one
//!   reverse-direction message to that session.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{self, Body};
use axum::extract::{Query, Request};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::sse::{KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use bidi_core::protocol::{self, accepts_event_stream};
use bidi_core::{Codec, CodecError, Emitter};
use futures::StreamExt;
use serde_json::Value;
use tracing::{debug, info, instrument, warn, Instrument, Span};

use crate::channel::StreamChannel;
use crate::config::ServerConfig;
use crate::errors::ConfigError;
use crate::registry::SessionRegistry;
use crate::server::ServerEvent;
use crate::session::PeerSession;

/// Outcome of [`Dispatcher::dispatch`].
#[derive(Debug)]
pub enum Dispatch {
    /// The request was consumed and answered.
    Handled(Response),
    /// Not a protocol request; returned unchanged for the next handler.
    Unhandled(Request<Body>),
}

impl Dispatch {
    /// `true` for [`Dispatch::Handled`].
    pub fn is_handled(&self) -> bool {
        matches!(self, Self::Handled(_))
    }
}

/// Routes protocol requests to the session registry.
#[derive(Clone)]
pub struct Dispatcher {
    config: Arc<ServerConfig>,
    headers: HeaderMap,
    codec: Arc<dyn Codec>,
    registry: Arc<SessionRegistry>,
    events: Arc<Emitter<ServerEvent>>,
}

impl Dispatcher {
    pub(crate) fn new(
        config: ServerConfig,
        codec: Arc<dyn Codec>,
        registry: Arc<SessionRegistry>,
        events: Arc<Emitter<ServerEvent>>,
    ) -> Result<Self, ConfigError> {
        let headers = config.response_headers()?;
        Ok(Self {
            config: Arc::new(config),
            headers,
            codec,
            registry,
            events,
        })
    }

    /// The configuration this dispatcher was built from.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Registry sessions are admitted into.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub(crate) fn set_codec(&mut self, codec: Arc<dyn Codec>) {
        self.codec = codec;
    }

    pub(crate) fn set_registry(&mut self, registry: Arc<SessionRegistry>) {
        self.registry = registry;
    }

    /// Handle `req` if it is a protocol request.
    #[instrument(skip_all, fields(method = %req.method(), path = %req.uri().path()))]
    pub async fn dispatch(&self, req: Request<Body>) -> Dispatch {
        let path = req.uri().path();
        if !path.starts_with(self.config.base_path.as_str()) {
            return Dispatch::Unhandled(req);
        }

        if req.method() == Method::POST {
            if let Some(session) = self.session_for(&req) {
                return Dispatch::Handled(self.receive(session, req).await);
            }
            return Dispatch::Unhandled(req);
        }

        if req.method() == Method::GET && path == self.config.base_path && wants_event_stream(&req) {
            return Dispatch::Handled(self.admit());
        }

        Dispatch::Unhandled(req)
    }

    fn session_for(&self, req: &Request<Body>) -> Option<Arc<PeerSession>> {
        let Query(params) = Query::<HashMap<String, String>>::try_from_uri(req.uri()).ok()?;
        let id = params.get(&self.config.session_param)?;
        self.registry.lookup(id)
    }

    /// Open a push stream for a new peer.
    fn admit(&self) -> Response {
        let (channel, mut stream) = StreamChannel::pair(self.config.max_send_queue);
        let session = self.registry.register(channel, self.codec.clone());
        let id = session.id().clone();

        let registry = Arc::downgrade(&self.registry);
        let weak_session = Arc::downgrade(&session);
        stream.on_terminate(move || {
            let Some(session) = weak_session.upgrade() else {
                return;
            };
            if let Some(registry) = registry.upgrade() {
                let _ = registry.remove_session(&session);
            }
            debug!(session_id = %session.id(), "push stream terminated");
            let _ = session.mark_closed();
        });

        let _ = session.send_event(&self.config.handshake_event, &Value::String(id.to_string()));
        info!(session_id = %id, sessions = self.registry.len(), "peer connected");

        let sse = Sse::new(stream.map(|frame| Ok::<_, Infallible>(frame.into_sse_event())));
        let mut response = if self.config.keep_alive_secs > 0 {
            sse.keep_alive(KeepAlive::new().interval(Duration::from_secs(self.config.keep_alive_secs)))
                .into_response()
        } else {
            sse.into_response()
        };
        self.apply_headers(response.headers_mut());
        let headers = response.headers_mut();
        let _ = headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(protocol::EVENT_STREAM));
        let _ = headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        let _ = headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));

        let _ = self.events.emit(&ServerEvent::Connection(session));
        response
    }

    /// Buffer one reverse-direction message and answer it.
    ///
    /// Decoding and delivery run on a separate task once the body is read,
    /// so the response never waits on session listeners.
    #[instrument(skip_all, fields(session_id = %session.id()))]
    async fn receive(&self, session: Arc<PeerSession>, req: Request<Body>) -> Response {
        let bytes = match body::to_bytes(req.into_body(), self.config.max_body_bytes).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "failed to read message body");
                return self.empty_response(StatusCode::BAD_REQUEST);
            }
        };
        debug!(bytes = bytes.len(), "message received");

        let registry = self.registry.clone();
        let codec = self.codec.clone();
        let _ = tokio::spawn(
            async move { deliver(&registry, codec.as_ref(), &session, &bytes) }
                .instrument(Span::current()),
        );

        self.empty_response(StatusCode::OK)
    }

    fn empty_response(&self, status: StatusCode) -> Response {
        let mut response = (status, Body::empty()).into_response();
        self.apply_headers(response.headers_mut());
        response
    }

    fn apply_headers(&self, target: &mut HeaderMap) {
        for (name, value) in &self.headers {
            let _ = target.insert(name.clone(), value.clone());
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("base_path", &self.config.base_path)
            .field("codec", &self.codec)
            .finish_non_exhaustive()
    }
}

/// Decode `bytes` and hand the message to `session` if it is still the
/// registered, open holder of its id. Undecodable bodies are reported back
/// to the peer as an `unexpected` event.
fn deliver(registry: &SessionRegistry, codec: &dyn Codec, session: &Arc<PeerSession>, bytes: &[u8]) {
    let decoded = std::str::from_utf8(bytes)
        .map_err(|e| CodecError::Decode(e.to_string()))
        .and_then(|text| codec.decode(text));

    match decoded {
        Ok(value) => match registry.lookup(session.id().as_str()) {
            Some(current) if Arc::ptr_eq(&current, session) => {
                let _ = current.deliver(value);
            }
            _ => debug!("session closed before delivery"),
        },
        Err(e) => {
            warn!(error = %e, "undecodable message body");
            let _ = session.send_event(
                protocol::UNEXPECTED_EVENT,
                &Value::String(e.description().to_owned()),
            );
        }
    }
}

fn wants_event_stream(req: &Request<Body>) -> bool {
    req.headers()
        .get_all(header::ACCEPT)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(accepts_event_stream)
}
