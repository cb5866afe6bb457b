//! `BidiServer`: the protocol endpoint as an axum router or middleware.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::Router;
use bidi_core::{Codec, Emitter, Event, JsonCodec, ListenerId};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::dispatcher::{Dispatch, Dispatcher};
use crate::errors::ConfigError;
use crate::registry::{SessionRegistry, SessionsView};
use crate::session::PeerSession;

/// Events emitted by a [`BidiServer`].
#[derive(Debug)]
pub enum ServerEvent {
    /// A peer completed the push handshake.
    Connection(Arc<PeerSession>),
    /// [`BidiServer::close`] finished.
    Close,
}

/// Discriminant of [`ServerEvent`], used to subscribe.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerEventKind {
    /// [`ServerEvent::Connection`].
    Connection,
    /// [`ServerEvent::Close`].
    Close,
}

impl Event for ServerEvent {
    type Kind = ServerEventKind;

    fn kind(&self) -> ServerEventKind {
        match self {
            Self::Connection(_) => ServerEventKind::Connection,
            Self::Close => ServerEventKind::Close,
        }
    }
}

/// A bidi-sse endpoint. Cheap to clone; clones share sessions and listeners.
#[derive(Clone, Debug)]
pub struct BidiServer {
    dispatcher: Arc<Dispatcher>,
    events: Arc<Emitter<ServerEvent>>,
    closed: Arc<AtomicBool>,
}

impl BidiServer {
    /// Create a server with the JSON codec and an empty registry.
    pub fn new(config: ServerConfig) -> Result<Self, ConfigError> {
        let events = Arc::new(Emitter::new());
        let dispatcher = Dispatcher::new(
            config,
            Arc::new(JsonCodec),
            Arc::new(SessionRegistry::new()),
            events.clone(),
        )?;
        Ok(Self {
            dispatcher: Arc::new(dispatcher),
            events,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Replace the codec used for sessions admitted from now on.
    #[must_use]
    pub fn with_codec(self, codec: Arc<dyn Codec>) -> Self {
        self.map_dispatcher(|d| d.set_codec(codec))
    }

    /// Replace the registry, e.g. to use a custom id generator.
    #[must_use]
    pub fn with_registry(self, registry: SessionRegistry) -> Self {
        self.map_dispatcher(|d| d.set_registry(Arc::new(registry)))
    }

    fn map_dispatcher(self, f: impl FnOnce(&mut Dispatcher)) -> Self {
        let mut dispatcher = Arc::unwrap_or_clone(self.dispatcher);
        f(&mut dispatcher);
        Self {
            dispatcher: Arc::new(dispatcher),
            ..self
        }
    }

    /// The active configuration.
    pub fn config(&self) -> &ServerConfig {
        self.dispatcher.config()
    }

    /// Registry holding this server's sessions.
    pub fn registry(&self) -> &SessionRegistry {
        self.dispatcher.registry()
    }

    /// Read-only view of the open sessions.
    pub fn sessions(&self) -> SessionsView<'_> {
        self.dispatcher.registry().all()
    }

    /// Subscribe to every event of `kind`.
    pub fn on<F>(&self, kind: ServerEventKind, listener: F) -> ListenerId
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        self.events.on(kind, listener)
    }

    /// Subscribe to the next event of `kind` only.
    pub fn once<F>(&self, kind: ServerEventKind, listener: F) -> ListenerId
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        self.events.once(kind, listener)
    }

    /// Remove a listener.
    pub fn off(&self, id: ListenerId) -> bool {
        self.events.off(id)
    }

    /// Handle `req` if it is a protocol request, otherwise hand it back.
    pub async fn dispatch(&self, req: Request) -> Dispatch {
        self.dispatcher.dispatch(req).await
    }

    /// Mount the endpoint on an existing router.
    ///
    /// Protocol requests are answered before routing; everything else
    /// reaches `router` unchanged.
    pub fn attach<S>(&self, router: Router<S>) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        router.layer(middleware::from_fn_with_state(self.clone(), dispatch_layer))
    }

    /// A standalone router: protocol requests are handled, the rest get `404`.
    pub fn router(&self) -> Router {
        self.attach(Router::new().fallback(not_found))
    }

    /// Close every session and wait for their streams to finish.
    ///
    /// Emits [`ServerEvent::Close`] once all streams are gone or the
    /// shutdown timeout elapsed. Later calls are no-ops.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let sessions = self.sessions().snapshot();
        let timeout = Duration::from_secs(self.config().shutdown_timeout_secs);
        info!(
            session_count = sessions.len(),
            timeout_secs = timeout.as_secs(),
            "closing all sessions"
        );

        let terminated: Vec<_> = sessions
            .iter()
            .map(|session| {
                let token = session.channel().terminated();
                session.close();
                token.cancelled_owned()
            })
            .collect();

        if tokio::time::timeout(timeout, futures::future::join_all(terminated))
            .await
            .is_err()
        {
            warn!("shutdown timed out after {timeout:?}, some streams may still be open");
        }

        let _ = self.events.emit(&ServerEvent::Close);
        info!("server closed");
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Bind `addr` and serve [`router`](Self::router) in the background.
    pub async fn listen(&self, addr: SocketAddr) -> io::Result<ServerHandle> {
        self.listen_with(addr, self.router()).await
    }

    /// Like [`listen`](Self::listen) but serves `app`, typically a router
    /// this server was [attached](Self::attach) to.
    pub async fn listen_with(&self, addr: SocketAddr, app: Router) -> io::Result<ServerHandle> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();

        let signal = shutdown.clone();
        let task = tokio::spawn(async move {
            let serve = axum::serve(listener, app)
                .with_graceful_shutdown(async move { signal.cancelled().await });
            if let Err(e) = serve.await {
                error!(error = %e, "server error");
            }
        });

        info!(%local_addr, base_path = %self.config().base_path, "listening");
        Ok(ServerHandle {
            server: self.clone(),
            local_addr,
            shutdown,
            task,
        })
    }
}

/// A running listener started by [`BidiServer::listen`].
#[derive(Debug)]
pub struct ServerHandle {
    server: BidiServer,
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl ServerHandle {
    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The server being served.
    pub fn server(&self) -> &BidiServer {
        &self.server
    }

    /// Close the server, stop accepting connections and wait for the
    /// listener task (bounded by the shutdown timeout).
    pub async fn shutdown(self) {
        self.server.close().await;
        self.shutdown.cancel();

        let timeout = Duration::from_secs(self.server.config().shutdown_timeout_secs);
        match tokio::time::timeout(timeout, self.task).await {
            Ok(Ok(())) => info!("listener stopped"),
            Ok(Err(e)) => error!(error = %e, "listener task failed"),
            Err(_) => warn!("listener did not stop after {timeout:?}"),
        }
    }
}

async fn dispatch_layer(State(server): State<BidiServer>, req: Request, next: Next) -> Response {
    match server.dispatch(req).await {
        Dispatch::Handled(response) => response,
        Dispatch::Unhandled(req) => next.run(req).await,
    }
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::header::ACCEPT;
    use axum::routing::get;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;
    use tower::ServiceExt;

    fn stream_request(path: &str) -> Request {
        Request::builder()
            .uri(path)
            .header(ACCEPT, "text/event-stream")
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn invalid_config_rejected() {
        let result = BidiServer::new(ServerConfig::with_base_path("no-slash"));
        assert!(matches!(result, Err(ConfigError::InvalidBasePath(_))));
    }

    #[tokio::test]
    async fn router_falls_back_to_404() {
        let server = BidiServer::new(ServerConfig::default()).unwrap();
        let resp = server
            .router()
            .oneshot(Request::builder().uri("/elsewhere").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn attach_passes_other_routes_through() {
        let server = BidiServer::new(ServerConfig::default()).unwrap();
        let app = server.attach(Router::new().route("/health", get(|| async { "ok" })));

        let resp = app
            .clone()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app.oneshot(stream_request("/bidi-sse")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(server.sessions().len(), 1);
    }

    #[tokio::test]
    async fn with_registry_uses_custom_generator() {
        let registry = SessionRegistry::with_generator(Arc::new(|| bidi_core::SessionId::from_raw("fixed")));
        let server = BidiServer::new(ServerConfig::default()).unwrap().with_registry(registry);
        let _resp = server.router().oneshot(stream_request("/bidi-sse")).await.unwrap();
        assert!(server.registry().lookup("fixed").is_some());
    }

    #[tokio::test]
    async fn connection_listener_receives_session() {
        let server = BidiServer::new(ServerConfig::default()).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let _ = server.on(ServerEventKind::Connection, move |event| {
            if let ServerEvent::Connection(session) = event {
                s.lock().push(session.id().clone());
            }
        });

        let _resp = server.router().oneshot(stream_request("/bidi-sse")).await.unwrap();
        let ids = seen.lock().clone();
        assert_eq!(ids.len(), 1);
        assert!(server.registry().lookup(ids[0].as_str()).is_some());
    }

    #[tokio::test]
    async fn close_waits_for_streams_then_emits_close() {
        let server = BidiServer::new(ServerConfig::default()).unwrap();
        let first = server.router().oneshot(stream_request("/bidi-sse")).await.unwrap();
        let second = server.router().oneshot(stream_request("/bidi-sse")).await.unwrap();
        assert_eq!(server.sessions().len(), 2);

        let tokens: Vec<_> = server
            .sessions()
            .iter()
            .map(|s| s.channel().terminated())
            .collect();
        let all_terminated = Arc::new(Mutex::new(None));
        let a = all_terminated.clone();
        let t = tokens.clone();
        let _ = server.on(ServerEventKind::Close, move |_| {
            *a.lock() = Some(t.iter().all(CancellationToken::is_cancelled));
        });

        let closing = tokio::spawn({
            let server = server.clone();
            async move { server.close().await }
        });
        tokio::task::yield_now().await;
        drop(first);
        drop(second);
        closing.await.unwrap();

        assert_eq!(*all_terminated.lock(), Some(true));
        assert!(server.sessions().is_empty());
        assert!(server.is_closed());
    }

    #[tokio::test]
    async fn close_emits_once() {
        let server = BidiServer::new(ServerConfig::default()).unwrap();
        let closes = Arc::new(AtomicUsize::new(0));
        let c = closes.clone();
        let _ = server.on(ServerEventKind::Close, move |_| {
            let _ = c.fetch_add(1, Ordering::SeqCst);
        });
        server.close().await;
        server.close().await;
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn close_times_out_on_stuck_stream() {
        let config = ServerConfig {
            shutdown_timeout_secs: 1,
            ..ServerConfig::default()
        };
        let server = BidiServer::new(config).unwrap();
        let held = server.router().oneshot(stream_request("/bidi-sse")).await.unwrap();

        server.close().await;
        assert!(server.sessions().is_empty());
        drop(held);
    }

    #[tokio::test]
    async fn listen_and_shutdown() {
        let config = ServerConfig {
            shutdown_timeout_secs: 5,
            ..ServerConfig::default()
        };
        let server = BidiServer::new(config).unwrap();
        let handle = server.listen(SocketAddr::from(([127, 0, 0, 1], 0))).await.unwrap();
        assert_ne!(handle.local_addr().port(), 0);
        handle.shutdown().await;
        assert!(server.is_closed());
    }
}
