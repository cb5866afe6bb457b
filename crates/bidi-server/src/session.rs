//! Server-side handle for one connected peer.

use std::fmt;
use std::sync::{Arc, Weak};

use bidi_core::{AtomicReadyState, Codec, Emitter, Event, ListenerId, ReadyState, SessionId};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::channel::PushChannel;
use crate::errors::SessionError;
use crate::registry::{self, SessionMap};

/// Events emitted by a [`PeerSession`].
#[derive(Debug)]
pub enum SessionEvent {
    /// A reverse-direction message, already decoded.
    Message(Value),
    /// The session closed. Emitted once.
    Close,
    /// An outgoing message could not be encoded or pushed.
    Error(SessionError),
}

/// Discriminant of [`SessionEvent`], used to subscribe.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionEventKind {
    /// [`SessionEvent::Message`].
    Message,
    /// [`SessionEvent::Close`].
    Close,
    /// [`SessionEvent::Error`].
    Error,
}

impl Event for SessionEvent {
    type Kind = SessionEventKind;

    fn kind(&self) -> SessionEventKind {
        match self {
            Self::Message(_) => SessionEventKind::Message,
            Self::Close => SessionEventKind::Close,
            Self::Error(_) => SessionEventKind::Error,
        }
    }
}

/// One peer bound to one push channel for its whole lifetime.
///
/// Owned by the [`SessionRegistry`](crate::registry::SessionRegistry); the
/// ready state goes `Open → Closed` exactly once.
pub struct PeerSession {
    id: SessionId,
    channel: Arc<dyn PushChannel>,
    codec: Arc<dyn Codec>,
    state: AtomicReadyState,
    events: Emitter<SessionEvent>,
    registry: Weak<SessionMap>,
}

impl PeerSession {
    pub(crate) fn new(
        id: SessionId,
        channel: Arc<dyn PushChannel>,
        codec: Arc<dyn Codec>,
        registry: Weak<SessionMap>,
    ) -> Self {
        Self {
            id,
            channel,
            codec,
            state: AtomicReadyState::new(ReadyState::Open),
            events: Emitter::new(),
            registry,
        }
    }

    /// The id sent to the peer in the handshake.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Current ready state.
    pub fn ready_state(&self) -> ReadyState {
        self.state.get()
    }

    /// Whether messages can still flow.
    pub fn is_open(&self) -> bool {
        self.ready_state() == ReadyState::Open
    }

    /// The push channel frames are written to.
    pub fn channel(&self) -> &Arc<dyn PushChannel> {
        &self.channel
    }

    /// The underlying event surface.
    pub fn events(&self) -> &Emitter<SessionEvent> {
        &self.events
    }

    /// Subscribe to every event of `kind`.
    pub fn on<F>(&self, kind: SessionEventKind, listener: F) -> ListenerId
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.events.on(kind, listener)
    }

    /// Subscribe to the next event of `kind` only.
    pub fn once<F>(&self, kind: SessionEventKind, listener: F) -> ListenerId
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.events.once(kind, listener)
    }

    /// Remove a listener.
    pub fn off(&self, id: ListenerId) -> bool {
        self.events.off(id)
    }

    /// Push `data` to the peer as a default message event.
    ///
    /// On failure an `Error` event is emitted and `false` returned; the
    /// session stays open.
    pub fn send(&self, data: &Value) -> bool {
        self.push(None, data)
    }

    /// Push `data` to the peer under a custom event name.
    pub fn send_event(&self, event: &str, data: &Value) -> bool {
        self.push(Some(event), data)
    }

    /// Close the session. A second call is a no-op.
    ///
    /// The session leaves the registry and `Close` is emitted before the
    /// underlying channel is ended.
    pub fn close(&self) {
        if let Some(map) = self.registry.upgrade() {
            let _ = registry::remove_exact(&map, self);
        }
        if self.mark_closed() {
            self.channel.end();
        }
    }

    /// Transition to `Closed` and emit `Close` if this call wins the edge.
    pub(crate) fn mark_closed(&self) -> bool {
        if self.state.transition(ReadyState::Open, ReadyState::Closed) {
            info!(session_id = %self.id, "session closed");
            let _ = self.events.emit(&SessionEvent::Close);
            true
        } else {
            false
        }
    }

    /// Deliver a decoded reverse-direction message.
    ///
    /// Returns `false` without emitting when the session is no longer open.
    pub(crate) fn deliver(&self, value: Value) -> bool {
        if !self.is_open() {
            debug!(session_id = %self.id, "dropping message for closed session");
            return false;
        }
        let _ = self.events.emit(&SessionEvent::Message(value));
        true
    }

    fn push_raw(&self, event: Option<&str>, payload: &str) -> bool {
        match self.channel.send(event, payload) {
            Ok(()) => true,
            Err(e) => {
                warn!(session_id = %self.id, error = %e, "push failed");
                let _ = self.events.emit(&SessionEvent::Error(e.into()));
                false
            }
        }
    }

    fn push(&self, event: Option<&str>, data: &Value) -> bool {
        match self.codec.encode(data) {
            Ok(payload) => self.push_raw(event, &payload),
            Err(e) => {
                warn!(session_id = %self.id, error = %e, "encode failed");
                let _ = self.events.emit(&SessionEvent::Error(e.into()));
                false
            }
        }
    }
}

impl fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerSession")
            .field("id", &self.id)
            .field("ready_state", &self.ready_state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::StreamChannel;
    use crate::errors::PushError;
    use crate::registry::SessionRegistry;
    use bidi_core::{CodecError, JsonCodec};
    use futures::StreamExt;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct FailingCodec;

    impl Codec for FailingCodec {
        fn encode(&self, _value: &Value) -> Result<String, CodecError> {
            Err(CodecError::Encode("unsupported".into()))
        }
        fn decode(&self, _text: &str) -> Result<Value, CodecError> {
            Err(CodecError::Decode("unsupported".into()))
        }
    }

    fn count_events(session: &PeerSession, kind: SessionEventKind) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let _ = session.on(kind, move |_| {
            let _ = c.fetch_add(1, Ordering::SeqCst);
        });
        count
    }

    #[tokio::test]
    async fn send_writes_default_event() {
        let registry = SessionRegistry::new();
        let (channel, mut stream) = StreamChannel::pair(8);
        let session = registry.register(channel, Arc::new(JsonCodec));

        assert!(session.send(&json!({"hello": "world"})));
        let frame = stream.next().await.unwrap();
        assert_eq!(frame.event, None);
        assert_eq!(frame.data, r#"{"hello":"world"}"#);
    }

    #[tokio::test]
    async fn send_event_uses_name() {
        let registry = SessionRegistry::new();
        let (channel, mut stream) = StreamChannel::pair(8);
        let session = registry.register(channel, Arc::new(JsonCodec));

        assert!(session.send_event("tick", &json!(3)));
        let frame = stream.next().await.unwrap();
        assert_eq!(frame.event.as_deref(), Some("tick"));
        assert_eq!(frame.data, "3");
    }

    #[test]
    fn write_failure_emits_error_and_stays_open() {
        let registry = SessionRegistry::new();
        let (channel, _stream) = StreamChannel::pair(1);
        let session = registry.register(channel, Arc::new(JsonCodec));
        let errors = Arc::new(Mutex::new(Vec::new()));
        let e = errors.clone();
        let _ = session.on(SessionEventKind::Error, move |event| {
            if let SessionEvent::Error(err) = event {
                e.lock().push(err.clone());
            }
        });

        assert!(session.send(&json!(1)));
        assert!(!session.send(&json!(2)));
        assert_eq!(
            *errors.lock(),
            vec![SessionError::Push(PushError::QueueFull)]
        );
        assert!(session.is_open());
    }

    #[test]
    fn encode_failure_emits_error() {
        let registry = SessionRegistry::new();
        let (channel, _stream) = StreamChannel::pair(4);
        let session = registry.register(channel, Arc::new(FailingCodec));
        let errors = count_events(&session, SessionEventKind::Error);

        assert!(!session.send(&json!(1)));
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert!(session.is_open());
    }

    #[tokio::test]
    async fn close_is_idempotent_and_ends_channel() {
        let registry = SessionRegistry::new();
        let (channel, mut stream) = StreamChannel::pair(4);
        let session = registry.register(channel, Arc::new(JsonCodec));
        let closes = count_events(&session, SessionEventKind::Close);

        session.close();
        session.close();
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(session.ready_state(), ReadyState::Closed);
        assert!(session.channel().is_ended());
        assert!(stream.next().await.is_none());
    }

    #[test]
    fn close_listener_sees_session_unregistered() {
        let registry = Arc::new(SessionRegistry::new());
        let (channel, _stream) = StreamChannel::pair(4);
        let session = registry.register(channel, Arc::new(JsonCodec));
        let id = session.id().clone();

        let present_during_close = Arc::new(Mutex::new(None));
        let p = present_during_close.clone();
        let r = registry.clone();
        let listener_id = id.clone();
        let _ = session.on(SessionEventKind::Close, move |_| {
            *p.lock() = Some(r.lookup(listener_id.as_str()).is_some());
        });

        session.close();
        assert_eq!(*present_during_close.lock(), Some(false));
        assert!(registry.lookup(id.as_str()).is_none());
    }

    #[test]
    fn close_observed_before_channel_ends() {
        let registry = SessionRegistry::new();
        let (channel, _stream) = StreamChannel::pair(4);
        let session = registry.register(channel, Arc::new(JsonCodec));
        let ended_during_close = Arc::new(Mutex::new(None));
        let e = ended_during_close.clone();
        let ch = session.channel().clone();
        let _ = session.on(SessionEventKind::Close, move |_| {
            *e.lock() = Some(ch.is_ended());
        });

        session.close();
        assert_eq!(*ended_during_close.lock(), Some(false));
    }

    #[test]
    fn deliver_after_close_is_dropped() {
        let registry = SessionRegistry::new();
        let (channel, _stream) = StreamChannel::pair(4);
        let session = registry.register(channel, Arc::new(JsonCodec));
        let messages = count_events(&session, SessionEventKind::Message);

        assert!(session.deliver(json!({"x": 1})));
        session.close();
        assert!(!session.deliver(json!({"x": 2})));
        assert_eq!(messages.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listener_may_close_session_on_message() {
        let registry = SessionRegistry::new();
        let (channel, _stream) = StreamChannel::pair(4);
        let session = registry.register(channel, Arc::new(JsonCodec));
        let weak = Arc::downgrade(&session);
        let _ = session.on(SessionEventKind::Message, move |_| {
            if let Some(s) = weak.upgrade() {
                s.close();
            }
        });

        assert!(session.deliver(json!("bye")));
        assert_eq!(session.ready_state(), ReadyState::Closed);
        assert!(registry.is_empty());
    }
}
