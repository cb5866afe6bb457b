//! Session registry: the single source of routing truth.
//!
//! All mutation goes through [`SessionRegistry::register`] and
//! [`SessionRegistry::unregister`] (or a session closing itself). Every key
//! present maps to an `Open` session.

use std::fmt;
use std::sync::Arc;

use bidi_core::{Codec, SessionId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, trace};

use crate::channel::PushChannel;
use crate::session::PeerSession;

pub(crate) type SessionMap = DashMap<SessionId, Arc<PeerSession>>;

/// Produces candidate session identifiers.
pub type IdGenerator = Arc<dyn Fn() -> SessionId + Send + Sync>;

/// Mapping from session id to live peer session.
pub struct SessionRegistry {
    sessions: Arc<SessionMap>,
    generator: IdGenerator,
}

impl SessionRegistry {
    /// A registry using [`SessionId::generate`].
    pub fn new() -> Self {
        Self::with_generator(Arc::new(SessionId::generate))
    }

    /// Use a custom id source. Candidates that collide with a registered
    /// session are discarded and the generator is asked again.
    pub fn with_generator(generator: IdGenerator) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            generator,
        }
    }

    /// Admit `channel` as a new open session and return it.
    pub fn register(&self, channel: Arc<dyn PushChannel>, codec: Arc<dyn Codec>) -> Arc<PeerSession> {
        let mut attempts = 0_u32;
        loop {
            attempts += 1;
            let id = (self.generator)();
            match self.sessions.entry(id) {
                Entry::Occupied(occupied) => {
                    trace!(session_id = %occupied.key(), attempts, "session id collision, retrying");
                }
                Entry::Vacant(vacant) => {
                    let session = Arc::new(PeerSession::new(
                        vacant.key().clone(),
                        channel,
                        codec,
                        Arc::downgrade(&self.sessions),
                    ));
                    let _ = vacant.insert(session.clone());
                    debug!(session_id = %session.id(), attempts, "session registered");
                    return session;
                }
            }
        }
    }

    /// Find the live session registered under `id`.
    pub fn lookup(&self, id: &str) -> Option<Arc<PeerSession>> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    /// Remove a session. Idempotent.
    pub fn unregister(&self, id: &str) -> Option<Arc<PeerSession>> {
        self.sessions.remove(id).map(|(_, session)| session)
    }

    /// Remove `session` only if it is the one registered under its id.
    pub(crate) fn remove_session(&self, session: &PeerSession) -> bool {
        remove_exact(&self.sessions, session)
    }

    /// Read-only view over every registered session.
    pub fn all(&self) -> SessionsView<'_> {
        SessionsView {
            sessions: &self.sessions,
        }
    }

    /// Number of registered sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// `true` when no session is registered.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

pub(crate) fn remove_exact(sessions: &SessionMap, session: &PeerSession) -> bool {
    sessions
        .remove_if(session.id().as_str(), |_, current| std::ptr::eq(Arc::as_ptr(current), session))
        .is_some()
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.sessions.len())
            .finish_non_exhaustive()
    }
}

/// Borrowed, read-only projection of the registry.
///
/// There is no way to insert or remove through it. Iteration snapshots the
/// current sessions first, so code run per session may close sessions
/// without deadlocking the map.
#[derive(Clone, Copy)]
pub struct SessionsView<'a> {
    sessions: &'a SessionMap,
}

impl<'a> SessionsView<'a> {
    /// Number of registered sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// `true` when no session is registered.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Whether this exact session is the one registered under its id.
    pub fn contains(&self, session: &PeerSession) -> bool {
        self.sessions
            .get(session.id().as_str())
            .is_some_and(|entry| std::ptr::eq(Arc::as_ptr(entry.value()), session))
    }

    /// Ids of all registered sessions, in no particular order.
    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Iterate over a snapshot of the registered sessions.
    pub fn iter(&self) -> std::vec::IntoIter<Arc<PeerSession>> {
        self.snapshot().into_iter()
    }

    /// Clone out the registered sessions.
    pub fn snapshot(&self) -> Vec<Arc<PeerSession>> {
        self.sessions.iter().map(|entry| entry.value().clone()).collect()
    }
}

impl<'a> IntoIterator for SessionsView<'a> {
    type Item = Arc<PeerSession>;
    type IntoIter = std::vec::IntoIter<Arc<PeerSession>>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl fmt::Debug for SessionsView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.ids()).finish()
    }
}
