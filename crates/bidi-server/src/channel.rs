//! One-way push channel bound to an SSE response.
//!
//! [`StreamChannel::pair`] returns the writing half, shared with the peer
//! session, and the [`PushStream`] handed to the HTTP layer. The stream is
//! the only owner of the receiver: once the HTTP layer drops it (peer gone,
//! stream finished, transport error) the channel is terminated.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::response::sse::Event as SseEvent;
use bidi_core::protocol::is_valid_event_name;
use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::errors::PushError;

/// Writing half of a push connection.
pub trait PushChannel: Send + Sync {
    /// Queue one event. `None` writes the default (unnamed) message event.
    fn send(&self, event: Option<&str>, payload: &str) -> Result<(), PushError>;

    /// Stop accepting frames. Queued frames are still delivered, then the
    /// stream finishes.
    fn end(&self);

    /// Whether `end` was called or the stream is gone.
    fn is_ended(&self) -> bool;

    /// Cancelled once the underlying stream is gone.
    fn terminated(&self) -> CancellationToken;
}

/// A single queued SSE frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PushFrame {
    /// Event name; `None` is the default `message` event.
    pub event: Option<String>,
    /// Encoded payload.
    pub data: String,
}

impl PushFrame {
    /// Convert into an axum SSE event.
    pub fn into_sse_event(self) -> SseEvent {
        let event = match self.event {
            Some(name) => SseEvent::default().event(name),
            None => SseEvent::default(),
        };
        event.data(self.data)
    }
}

/// [`PushChannel`] backed by a bounded queue feeding a [`PushStream`].
pub struct StreamChannel {
    tx: Mutex<Option<mpsc::Sender<PushFrame>>>,
    terminated: CancellationToken,
}

impl StreamChannel {
    /// Create a connected channel/stream pair holding at most `capacity`
    /// undelivered frames.
    pub fn pair(capacity: usize) -> (Arc<Self>, PushStream) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let terminated = CancellationToken::new();
        let channel = Arc::new(Self {
            tx: Mutex::new(Some(tx)),
            terminated: terminated.clone(),
        });
        let stream = PushStream {
            rx,
            terminated,
            on_terminate: None,
        };
        (channel, stream)
    }
}

impl PushChannel for StreamChannel {
    fn send(&self, event: Option<&str>, payload: &str) -> Result<(), PushError> {
        if let Some(name) = event {
            if !is_valid_event_name(name) {
                return Err(PushError::InvalidEventName(name.to_owned()));
            }
        }
        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            return Err(PushError::Ended);
        };
        let frame = PushFrame {
            event: event.map(str::to_owned),
            data: payload.to_owned(),
        };
        tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PushError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => PushError::Ended,
        })
    }

    fn end(&self) {
        drop(self.tx.lock().take());
    }

    fn is_ended(&self) -> bool {
        self.tx.lock().is_none() || self.terminated.is_cancelled()
    }

    fn terminated(&self) -> CancellationToken {
        self.terminated.clone()
    }
}

/// Reading half of a [`StreamChannel`]; yields frames until the channel ends.
pub struct PushStream {
    rx: mpsc::Receiver<PushFrame>,
    terminated: CancellationToken,
    on_terminate: Option<Box<dyn FnOnce() + Send>>,
}

impl PushStream {
    /// Run `f` when this stream is dropped, before `terminated()` fires.
    pub fn on_terminate<F>(&mut self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_terminate = Some(Box::new(f));
    }
}

impl Stream for PushStream {
    type Item = PushFrame;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl Drop for PushStream {
    fn drop(&mut self) {
        self.rx.close();
        if let Some(f) = self.on_terminate.take() {
            f();
        }
        self.terminated.cancel();
    }
}
