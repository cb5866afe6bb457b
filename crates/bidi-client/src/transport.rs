//! `ClientTransport`: the peer side of a bidi-sse connection.
//!
//! One `GET` opens the push stream. The first handshake event carries the
//! session id, after which [`ClientTransport::send`] posts messages to the
//! stream URL tagged with that id.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bidi_core::protocol::{self, EVENT_STREAM};
use bidi_core::{AtomicReadyState, Codec, Emitter, Event, JsonCodec, ListenerId, ReadyState, SessionId};
use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::Url;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::errors::ClientError;
use crate::sse::{self, SseFrame};

/// Events emitted by a [`ClientTransport`].
#[derive(Debug)]
pub enum ClientEvent {
    /// Handshake received; `send` is now allowed.
    Open,
    /// A decoded `message` event.
    Message(Value),
    /// A non-fatal error, or the cause of a connection loss.
    Error(ClientError),
    /// Terminal. Emitted once.
    Close,
}

/// Discriminant of [`ClientEvent`], used to subscribe.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientEventKind {
    /// [`ClientEvent::Open`].
    Open,
    /// [`ClientEvent::Message`].
    Message,
    /// [`ClientEvent::Error`].
    Error,
    /// [`ClientEvent::Close`].
    Close,
}

impl Event for ClientEvent {
    type Kind = ClientEventKind;

    fn kind(&self) -> ClientEventKind {
        match self {
            Self::Open => ClientEventKind::Open,
            Self::Message(_) => ClientEventKind::Message,
            Self::Error(_) => ClientEventKind::Error,
            Self::Close => ClientEventKind::Close,
        }
    }
}

/// Options for a [`ClientTransport`].
#[derive(Clone, Debug)]
pub struct ClientOptions {
    /// Codec for messages in both directions.
    pub codec: Arc<dyn Codec>,
    /// Extra headers sent with the stream request and every message.
    pub headers: HeaderMap,
    /// HTTP client to use; carries cookies, TLS and proxy settings.
    pub http: Option<reqwest::Client>,
    /// Event name carrying the session id. Defaults to `id`.
    pub handshake_event: String,
    /// Query parameter that tags outgoing messages. Defaults to `id`.
    pub session_param: String,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            codec: Arc::new(JsonCodec),
            headers: HeaderMap::new(),
            http: None,
            handshake_event: protocol::HANDSHAKE_EVENT.into(),
            session_param: protocol::SESSION_PARAM.into(),
        }
    }
}

/// Client end of a bidi-sse connection. Clones share the connection.
#[derive(Clone)]
pub struct ClientTransport {
    inner: Arc<Inner>,
}

struct Inner {
    url: Url,
    options: ClientOptions,
    http: reqwest::Client,
    runtime: Handle,
    state: AtomicReadyState,
    events: Emitter<ClientEvent>,
    target: Mutex<Option<Url>>,
    session_id: Mutex<Option<SessionId>>,
    started: AtomicBool,
    cancel: CancellationToken,
}

impl ClientTransport {
    /// Create a transport for `url` in the `Connecting` state.
    ///
    /// Must be called inside a Tokio runtime. Nothing is requested until
    /// [`connect`](Self::connect), so listeners can be attached first.
    pub fn new(url: &str, options: ClientOptions) -> Result<Self, ClientError> {
        let url = Url::parse(url).map_err(|e| ClientError::InvalidUrl(format!("{url}: {e}")))?;
        let runtime = Handle::try_current().map_err(|_| ClientError::NoRuntime)?;
        let http = options.http.clone().unwrap_or_default();
        Ok(Self {
            inner: Arc::new(Inner {
                url,
                options,
                http,
                runtime,
                state: AtomicReadyState::new(ReadyState::Connecting),
                events: Emitter::new(),
                target: Mutex::new(None),
                session_id: Mutex::new(None),
                started: AtomicBool::new(false),
                cancel: CancellationToken::new(),
            }),
        })
    }

    /// Start the push stream. Later calls are no-ops.
    pub fn connect(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.ready_state() != ReadyState::Connecting {
            debug!(url = %self.inner.url, "connect after close ignored");
            return;
        }
        let inner = self.inner.clone();
        drop(self.inner.runtime.spawn(inner.run()));
    }

    /// Current ready state.
    pub fn ready_state(&self) -> ReadyState {
        self.inner.state.get()
    }

    /// The push stream URL.
    pub fn url(&self) -> &Url {
        &self.inner.url
    }

    /// URL messages are posted to; known once `Open`.
    pub fn target(&self) -> Option<Url> {
        self.inner.target.lock().clone()
    }

    /// Session id from the handshake, once open.
    pub fn session_id(&self) -> Option<SessionId> {
        self.inner.session_id.lock().clone()
    }

    /// The underlying event surface.
    pub fn events(&self) -> &Emitter<ClientEvent> {
        &self.inner.events
    }

    /// Subscribe to every event of `kind`.
    pub fn on<F>(&self, kind: ClientEventKind, listener: F) -> ListenerId
    where
        F: Fn(&ClientEvent) + Send + Sync + 'static,
    {
        self.inner.events.on(kind, listener)
    }

    /// Subscribe to the next event of `kind` only.
    pub fn once<F>(&self, kind: ClientEventKind, listener: F) -> ListenerId
    where
        F: Fn(&ClientEvent) + Send + Sync + 'static,
    {
        self.inner.events.once(kind, listener)
    }

    /// Remove a listener. Returns `false` if it was already gone.
    pub fn off(&self, id: ListenerId) -> bool {
        self.inner.events.off(id)
    }

    /// Post `value` to the session. Only allowed while `Open`.
    ///
    /// The request runs in the background; its outcome is only logged.
    pub fn send(&self, value: &Value) -> Result<(), ClientError> {
        let state = self.ready_state();
        if state != ReadyState::Open {
            return Err(ClientError::InvalidState(state));
        }
        let target = self.target().ok_or(ClientError::InvalidState(state))?;
        let body = self.inner.options.codec.encode(value)?;

        let request = self
            .inner
            .http
            .post(target)
            .headers(self.inner.options.headers.clone())
            .body(body);
        drop(self.inner.runtime.spawn(async move {
            match request.send().await {
                Ok(resp) if resp.status().is_success() => trace!(status = %resp.status(), "message posted"),
                Ok(resp) => warn!(status = %resp.status(), "message post rejected"),
                Err(e) => warn!(error = %e, "message post failed"),
            }
        }));
        Ok(())
    }

    /// Close the transport. Emits `Close` exactly once.
    pub fn close(&self) {
        self.inner.close();
    }
}

impl fmt::Debug for ClientTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientTransport")
            .field("url", &self.inner.url.as_str())
            .field("ready_state", &self.ready_state())
            .field("session_id", &self.session_id())
            .finish_non_exhaustive()
    }
}

impl Inner {
    async fn run(self: Arc<Self>) {
        let result = tokio::select! {
            () = self.cancel.cancelled() => Ok(()),
            result = self.stream() => result,
        };
        if let Err(reason) = result {
            self.fail(reason);
        }
    }

    /// Read the push stream until it fails. `Ok` means the transport was
    /// closed locally.
    async fn stream(&self) -> Result<(), String> {
        let response = self
            .http
            .get(self.url.clone())
            .headers(self.options.headers.clone())
            .header(ACCEPT, HeaderValue::from_static(EVENT_STREAM))
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("unexpected status {}", response.status()));
        }
        debug!(url = %self.url, "push stream connected");

        let mut frames = std::pin::pin!(sse::frames(response.bytes_stream()));
        while let Some(frame) = frames.next().await {
            let frame = frame.map_err(|e| e.to_string())?;
            self.handle_frame(frame)?;
            if self.cancel.is_cancelled() {
                return Ok(());
            }
        }
        Err("stream ended".into())
    }

    /// Apply one push event. An `Err` is a transport failure.
    fn handle_frame(&self, frame: SseFrame) -> Result<(), String> {
        if frame.event == self.options.handshake_event {
            return self.handshake(&frame.data);
        }
        match frame.event.as_str() {
            protocol::UNEXPECTED_EVENT => {
                if self.state.get() != ReadyState::Open {
                    trace!("ignoring unexpected before handshake");
                    return Ok(());
                }
                let description = match self.options.codec.decode(&frame.data) {
                    Ok(Value::String(text)) => text,
                    _ => frame.data,
                };
                warn!(%description, "server could not decode a message");
                let _ = self.events.emit(&ClientEvent::Error(ClientError::Unexpected(description)));
            }
            protocol::MESSAGE_EVENT => {
                if self.state.get() != ReadyState::Open {
                    trace!("ignoring message before handshake");
                    return Ok(());
                }
                match self.options.codec.decode(&frame.data) {
                    Ok(value) => {
                        let _ = self.events.emit(&ClientEvent::Message(value));
                    }
                    Err(e) => {
                        warn!(error = %e, "undecodable message");
                        let _ = self.events.emit(&ClientEvent::Error(e.into()));
                    }
                }
            }
            other => trace!(event = other, "ignoring unknown event"),
        }
        Ok(())
    }

    fn handshake(&self, data: &str) -> Result<(), String> {
        if self.state.get() != ReadyState::Connecting {
            trace!("ignoring repeated handshake");
            return Ok(());
        }
        let id = match self.options.codec.decode(data) {
            Ok(Value::String(id)) if !id.is_empty() => id,
            Ok(other) => return Err(format!("handshake carried no session id: {other}")),
            Err(e) => return Err(format!("undecodable handshake: {e}")),
        };

        let mut target = self.url.clone();
        let _ = target.query_pairs_mut().append_pair(&self.options.session_param, &id);
        *self.target.lock() = Some(target);
        *self.session_id.lock() = Some(SessionId::from_raw(id.clone()));

        if self.state.transition(ReadyState::Connecting, ReadyState::Open) {
            info!(session_id = %id, url = %self.url, "transport open");
            let _ = self.events.emit(&ClientEvent::Open);
        }
        Ok(())
    }

    fn fail(&self, reason: String) {
        if self.state.advance(ReadyState::Closing).is_none() {
            return;
        }
        warn!(url = %self.url, %reason, "connection lost");
        let _ = self.events.emit(&ClientEvent::Error(ClientError::ConnectionLost {
            url: self.url.to_string(),
            reason,
        }));
        self.close();
    }

    fn close(&self) {
        if self.state.advance(ReadyState::Closed).is_none() {
            return;
        }
        self.cancel.cancel();
        info!(url = %self.url, "transport closed");
        let _ = self.events.emit(&ClientEvent::Close);
    }
}
