//! Minimal publish/subscribe surface with a closed set of event kinds.
//!
//! Each component declares an event enum and a matching `Kind` enum; the
//! emitter routes an event to the listeners registered for its kind.
//! Listeners run on the emitting thread, after the emitter has released its
//! lock, so a listener may register or remove listeners, emit, or close the
//! component it is attached to.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// An event type with an enumerated kind.
pub trait Event {
    type Kind: Copy + Eq + fmt::Debug + Send + Sync;

    /// The kind listeners subscribe to.
    fn kind(&self) -> Self::Kind;
}

/// Handle returned by [`Emitter::on`], used to remove the listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Slot<E: Event> {
    id: ListenerId,
    kind: E::Kind,
    once: bool,
    listener: Listener<E>,
}

/// Listener registry for events of type `E`.
pub struct Emitter<E: Event> {
    slots: Mutex<Vec<Slot<E>>>,
    next_id: AtomicU64,
}

impl<E: Event> Emitter<E> {
    /// An emitter with no listeners.
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register `listener` for every event of `kind`.
    pub fn on<F>(&self, kind: E::Kind, listener: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.insert(kind, false, Arc::new(listener))
    }

    /// Register `listener` for the next event of `kind` only.
    pub fn once<F>(&self, kind: E::Kind, listener: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.insert(kind, true, Arc::new(listener))
    }

    /// Remove a listener. Returns `false` if it was already gone.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut slots = self.slots.lock();
        let before = slots.len();
        slots.retain(|slot| slot.id != id);
        slots.len() != before
    }

    /// Deliver `event` to its listeners, in registration order.
    ///
    /// Returns the number of listeners invoked.
    pub fn emit(&self, event: &E) -> usize {
        let kind = event.kind();
        let targets: Vec<Listener<E>> = {
            let mut slots = self.slots.lock();
            let targets = slots
                .iter()
                .filter(|slot| slot.kind == kind)
                .map(|slot| slot.listener.clone())
                .collect();
            slots.retain(|slot| !(slot.once && slot.kind == kind));
            targets
        };
        for listener in &targets {
            listener(event);
        }
        targets.len()
    }

    /// Number of listeners currently registered for `kind`.
    pub fn listener_count(&self, kind: E::Kind) -> usize {
        self.slots.lock().iter().filter(|slot| slot.kind == kind).count()
    }

    /// Drop every listener.
    pub fn clear(&self) {
        self.slots.lock().clear();
    }

    fn insert(&self, kind: E::Kind, once: bool, listener: Listener<E>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.slots.lock().push(Slot {
            id,
            kind,
            once,
            listener,
        });
        id
    }
}

impl<E: Event> Default for Emitter<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Event> fmt::Debug for Emitter<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emitter")
            .field("listeners", &self.slots.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug)]
    enum TestEvent {
        Ping(u32),
        Pong,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    enum TestKind {
        Ping,
        Pong,
    }

    impl Event for TestEvent {
        type Kind = TestKind;
        fn kind(&self) -> TestKind {
            match self {
                Self::Ping(_) => TestKind::Ping,
                Self::Pong => TestKind::Pong,
            }
        }
    }

    fn counter() -> (Arc<AtomicUsize>, impl Fn(&TestEvent) + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        (count, move |_: &TestEvent| {
            let _ = c.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn emit_reaches_matching_kind_only() {
        let emitter = Emitter::new();
        let (pings, on_ping) = counter();
        let (pongs, on_pong) = counter();
        let _ = emitter.on(TestKind::Ping, on_ping);
        let _ = emitter.on(TestKind::Pong, on_pong);

        assert_eq!(emitter.emit(&TestEvent::Ping(1)), 1);
        assert_eq!(emitter.emit(&TestEvent::Ping(2)), 1);
        assert_eq!(pings.load(Ordering::SeqCst), 2);
        assert_eq!(pongs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn listener_sees_payload() {
        let emitter = Emitter::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let _ = emitter.on(TestKind::Ping, move |e| {
            if let TestEvent::Ping(n) = e {
                s.lock().push(*n);
            }
        });
        let _ = emitter.emit(&TestEvent::Ping(7));
        let _ = emitter.emit(&TestEvent::Ping(8));
        assert_eq!(*seen.lock(), vec![7, 8]);
    }

    #[test]
    fn once_fires_a_single_time() {
        let emitter = Emitter::new();
        let (count, listener) = counter();
        let _ = emitter.once(TestKind::Pong, listener);
        assert_eq!(emitter.listener_count(TestKind::Pong), 1);
        let _ = emitter.emit(&TestEvent::Pong);
        let _ = emitter.emit(&TestEvent::Pong);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(emitter.listener_count(TestKind::Pong), 0);
    }

    #[test]
    fn off_removes_listener() {
        let emitter = Emitter::new();
        let (count, listener) = counter();
        let id = emitter.on(TestKind::Ping, listener);
        assert!(emitter.off(id));
        assert!(!emitter.off(id));
        assert_eq!(emitter.emit(&TestEvent::Ping(1)), 0);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn listener_may_reenter_emitter() {
        let emitter = Arc::new(Emitter::new());
        let (pongs, on_pong) = counter();
        let _ = emitter.on(TestKind::Pong, on_pong);
        let inner = emitter.clone();
        let _ = emitter.on(TestKind::Ping, move |_| {
            let _ = inner.emit(&TestEvent::Pong);
            let _ = inner.on(TestKind::Pong, |_| {});
        });
        let _ = emitter.emit(&TestEvent::Ping(0));
        assert_eq!(pongs.load(Ordering::SeqCst), 1);
        assert_eq!(emitter.listener_count(TestKind::Pong), 2);
    }

    #[test]
    fn emit_without_listeners_is_noop() {
        let emitter: Emitter<TestEvent> = Emitter::default();
        assert_eq!(emitter.emit(&TestEvent::Pong), 0);
    }

    #[test]
    fn clear_drops_everything() {
        let emitter: Emitter<TestEvent> = Emitter::new();
        let _ = emitter.on(TestKind::Ping, |_| {});
        let _ = emitter.on(TestKind::Pong, |_| {});
        emitter.clear();
        assert_eq!(emitter.listener_count(TestKind::Ping), 0);
        assert_eq!(emitter.listener_count(TestKind::Pong), 0);
    }
}
