//! Connection ready states.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

/// Lifecycle of a connection, ordered so that later states compare greater.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum ReadyState {
    /// Stream requested, handshake not yet received.
    Connecting = 0,
    /// Handshake received; messages flow both ways.
    Open = 1,
    /// A transport failure was seen and the close procedure is running.
    Closing = 2,
    /// Terminal.
    Closed = 3,
}

impl ReadyState {
    /// Numeric form: `0` connecting through `3` closed.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }

    /// `true` once closed.
    pub fn is_terminal(self) -> bool {
        self == Self::Closed
    }
}

impl fmt::Display for ReadyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connecting => "CONNECTING",
            Self::Open => "OPEN",
            Self::Closing => "CLOSING",
            Self::Closed => "CLOSED",
        };
        f.write_str(s)
    }
}

/// A [`ReadyState`] cell that only moves forward.
#[derive(Debug)]
pub struct AtomicReadyState(AtomicU8);

impl AtomicReadyState {
    /// A cell starting at `state`.
    pub fn new(state: ReadyState) -> Self {
        Self(AtomicU8::new(state.as_u8()))
    }

    /// Current state.
    pub fn get(&self) -> ReadyState {
        ReadyState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move to `next` if it is strictly later than the current state.
    ///
    /// Returns the state that was replaced, or `None` when the cell was
    /// already at or past `next`. Exactly one caller wins any given edge.
    pub fn advance(&self, next: ReadyState) -> Option<ReadyState> {
        let next = next.as_u8();
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (next > current).then_some(next)
            })
            .ok()
            .map(ReadyState::from_u8)
    }

    /// Move from exactly `from` to `to`. Returns `true` on success.
    pub fn transition(&self, from: ReadyState, to: ReadyState) -> bool {
        debug_assert!(to > from, "ready state must not regress");
        self.0
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl Default for AtomicReadyState {
    fn default() -> Self {
        Self::new(ReadyState::Connecting)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_are_ordered() {
        assert!(ReadyState::Connecting < ReadyState::Open);
        assert!(ReadyState::Open < ReadyState::Closing);
        assert!(ReadyState::Closing < ReadyState::Closed);
        assert_eq!(ReadyState::Closed.as_u8(), 3);
    }

    #[test]
    fn advance_moves_forward_only() {
        let cell = AtomicReadyState::default();
        assert_eq!(cell.advance(ReadyState::Open), Some(ReadyState::Connecting));
        assert_eq!(cell.advance(ReadyState::Connecting), None);
        assert_eq!(cell.advance(ReadyState::Open), None);
        assert_eq!(cell.get(), ReadyState::Open);
        assert_eq!(cell.advance(ReadyState::Closed), Some(ReadyState::Open));
        assert_eq!(cell.advance(ReadyState::Closing), None);
        assert_eq!(cell.get(), ReadyState::Closed);
    }

    #[test]
    fn advance_to_closed_wins_once() {
        let cell = AtomicReadyState::new(ReadyState::Open);
        let winners = (0..10)
            .filter(|_| cell.advance(ReadyState::Closed).is_some())
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn transition_requires_exact_source() {
        let cell = AtomicReadyState::default();
        assert!(!cell.transition(ReadyState::Open, ReadyState::Closed));
        assert!(cell.transition(ReadyState::Connecting, ReadyState::Open));
        assert_eq!(cell.get(), ReadyState::Open);
    }

    #[test]
    fn display_uses_upper_case_names() {
        assert_eq!(ReadyState::Connecting.to_string(), "CONNECTING");
        assert_eq!(ReadyState::Closed.to_string(), "CLOSED");
        assert!(ReadyState::Closed.is_terminal());
        assert!(!ReadyState::Closing.is_terminal());
    }

    #[test]
    fn serde_lowercase() {
        assert_eq!(serde_json::to_string(&ReadyState::Open).unwrap(), "\"open\"");
    }
}
