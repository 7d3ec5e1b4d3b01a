//! Publisher Lifecycle State Machine
//!
//! The link to the broker moves through an explicit tagged state enum under
//! single-writer discipline: the worker task is the only writer, the caller
//! reads through a watch receiver. `ForceFinished` is absorbing; once set,
//! nothing overrides it.

use std::fmt;
use tokio::sync::watch;

// ----------------------------------------------------------------------------
// Lifecycle States
// ----------------------------------------------------------------------------

/// Lifecycle state of the publisher link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    /// Worker not yet started
    NotStarted,
    /// Connecting or reconnecting; publishes are queued
    WaitingToBeAvailable,
    /// Connection, channel and confirm mode are up
    Available,
    /// Caller-initiated graceful stop; no new publishes admitted
    Draining,
    /// Retries exhausted or fatal close; terminal
    PermanentlyUnavailable(UnavailableReason),
    /// Explicit force-stop; terminal and absorbing
    ForceFinished,
}

/// Why the link became permanently unavailable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnavailableReason {
    CouldNotConnect,
    ClosedByCaller,
    AuthenticationFailure,
    Unknown,
}

impl fmt::Display for UnavailableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UnavailableReason::CouldNotConnect => "could not connect",
            UnavailableReason::ClosedByCaller => "closed by caller",
            UnavailableReason::AuthenticationFailure => "authentication failure",
            UnavailableReason::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::NotStarted => write!(f, "NotStarted"),
            LinkState::WaitingToBeAvailable => write!(f, "WaitingToBeAvailable"),
            LinkState::Available => write!(f, "Available"),
            LinkState::Draining => write!(f, "Draining"),
            LinkState::PermanentlyUnavailable(reason) => {
                write!(f, "PermanentlyUnavailable({})", reason)
            }
            LinkState::ForceFinished => write!(f, "ForceFinished"),
        }
    }
}

impl LinkState {
    /// Publish admission: accepted (queued) while waiting or available only
    pub fn accepts_publishes(&self) -> bool {
        matches!(
            self,
            LinkState::WaitingToBeAvailable | LinkState::Available
        )
    }

    /// True once the publisher can never publish again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LinkState::PermanentlyUnavailable(_) | LinkState::ForceFinished
        )
    }

    pub fn is_available(&self) -> bool {
        matches!(self, LinkState::Available)
    }

    pub fn is_draining(&self) -> bool {
        matches!(self, LinkState::Draining)
    }
}

// ----------------------------------------------------------------------------
// Single-Writer State Cell
// ----------------------------------------------------------------------------

/// Writer side of the shared lifecycle state, owned by the worker task
#[derive(Debug)]
pub struct StateCell {
    tx: watch::Sender<LinkState>,
}

/// Reader side of the shared lifecycle state, cloneable by callers
pub type StateReader = watch::Receiver<LinkState>;

impl StateCell {
    /// Create a state cell starting in `NotStarted`
    pub fn new() -> (Self, StateReader) {
        let (tx, rx) = watch::channel(LinkState::NotStarted);
        (Self { tx }, rx)
    }

    /// Current state (cloned)
    pub fn current(&self) -> LinkState {
        self.tx.borrow().clone()
    }

    /// Transition to a new state.
    ///
    /// `ForceFinished` is absorbing: once set, every later transition is
    /// ignored. Transitions out of `PermanentlyUnavailable` are also
    /// refused; terminal means terminal.
    pub fn set(&self, next: LinkState) {
        self.tx.send_if_modified(|current| {
            if current.is_terminal() {
                return false;
            }
            if *current == next {
                return false;
            }
            tracing::debug!(from = %current, to = %next, "link state transition");
            *current = next;
            true
        });
    }

    /// Unconditional force-stop; overrides any non-force state
    pub fn force_finish(&self) {
        self.tx.send_if_modified(|current| {
            if matches!(current, LinkState::ForceFinished) {
                return false;
            }
            tracing::debug!(from = %current, "link state force-finished");
            *current = LinkState::ForceFinished;
            true
        });
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admission_per_state() {
        assert!(!LinkState::NotStarted.accepts_publishes());
        assert!(LinkState::WaitingToBeAvailable.accepts_publishes());
        assert!(LinkState::Available.accepts_publishes());
        assert!(!LinkState::Draining.accepts_publishes());
        assert!(
            !LinkState::PermanentlyUnavailable(UnavailableReason::Unknown).accepts_publishes()
        );
        assert!(!LinkState::ForceFinished.accepts_publishes());
    }

    #[test]
    fn test_normal_transitions_visible_to_reader() {
        let (cell, rx) = StateCell::new();
        assert_eq!(*rx.borrow(), LinkState::NotStarted);

        cell.set(LinkState::WaitingToBeAvailable);
        cell.set(LinkState::Available);
        assert_eq!(*rx.borrow(), LinkState::Available);
        assert!(rx.borrow().is_available());
    }

    #[test]
    fn test_force_finished_is_absorbing() {
        let (cell, rx) = StateCell::new();
        cell.set(LinkState::Available);
        cell.force_finish();
        assert_eq!(*rx.borrow(), LinkState::ForceFinished);

        // Nothing overrides it, not even a terminal failure
        cell.set(LinkState::PermanentlyUnavailable(
            UnavailableReason::CouldNotConnect,
        ));
        cell.set(LinkState::Available);
        assert_eq!(*rx.borrow(), LinkState::ForceFinished);
    }

    #[test]
    fn test_permanently_unavailable_is_terminal() {
        let (cell, rx) = StateCell::new();
        cell.set(LinkState::PermanentlyUnavailable(
            UnavailableReason::AuthenticationFailure,
        ));
        cell.set(LinkState::Available);
        assert_eq!(
            *rx.borrow(),
            LinkState::PermanentlyUnavailable(UnavailableReason::AuthenticationFailure)
        );
        assert!(rx.borrow().is_terminal());
    }
}
