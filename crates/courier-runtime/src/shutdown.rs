//! Shutdown primitives: completion signal, drain pacing and leftovers
//!
//! Both finish paths (gentle and forced) resolve through a single
//! `FinishSignal` that completes exactly once, no matter how many callers
//! wait on it or how many times completion is requested. The worker task is
//! the sole completer; it fires the signal on every exit path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use courier_core::{OutboundMessage, TimingConfig};

// ----------------------------------------------------------------------------
// Finish Signal
// ----------------------------------------------------------------------------

/// One-shot completion latch shared between the worker and its handles
#[derive(Debug, Default)]
pub struct FinishSignal {
    finished: AtomicBool,
    notify: Notify,
}

impl FinishSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the shutdown complete. Idempotent; only the first call wakes
    /// waiters.
    pub fn complete(&self) {
        if !self.finished.swap(true, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }

    pub fn is_complete(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Wait until the shutdown has completed. Safe to call before, during
    /// or after completion, from any number of tasks.
    pub async fn wait(&self) {
        loop {
            if self.is_complete() {
                return;
            }
            let notified = self.notify.notified();
            // Re-check after registering so a completion racing with the
            // registration is not missed.
            if self.is_complete() {
                return;
            }
            notified.await;
        }
    }
}

// ----------------------------------------------------------------------------
// Drain Pacing
// ----------------------------------------------------------------------------

/// Bounded wait-for-empty during a gentle finish.
///
/// The worker polls the outbound queue and the confirm ledger on a fixed
/// interval; the whole drain is capped by `poll interval x max iterations`
/// so a silent broker can never hold the shutdown hostage.
#[derive(Debug)]
pub struct DrainState {
    interval: tokio::time::Interval,
    deadline: Instant,
}

impl DrainState {
    pub fn new(timing: &TimingConfig) -> Self {
        let budget = timing.drain_poll_interval * timing.max_drain_iterations;
        let mut interval = tokio::time::interval(timing.drain_poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        Self {
            interval,
            deadline: Instant::now() + budget,
        }
    }

    /// Sleep until the next poll point
    pub async fn tick(&mut self) {
        self.interval.tick().await;
    }

    /// True once the drain budget is spent
    pub fn expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Time left in the drain budget, zero once expired
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

// ----------------------------------------------------------------------------
// Leftovers
// ----------------------------------------------------------------------------

/// Everything that did not make it through by the time the worker stopped
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Leftovers {
    /// Queued messages never handed to a channel
    pub unpublished: Vec<OutboundMessage>,
    /// Published messages the broker never confirmed
    pub unconfirmed: Vec<OutboundMessage>,
    /// Messages the broker explicitly rejected
    pub nacked: Vec<OutboundMessage>,
    /// Unroutable messages dropped after the emergency retry also failed
    pub dropped_returns: Vec<OutboundMessage>,
}

impl Leftovers {
    pub fn total(&self) -> usize {
        self.unpublished.len()
            + self.unconfirmed.len()
            + self.nacked.len()
            + self.dropped_returns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_finish_signal_completes_once() {
        let signal = Arc::new(FinishSignal::new());
        assert!(!signal.is_complete());

        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.wait().await })
        };

        signal.complete();
        signal.complete(); // second completion is a no-op
        timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter unblocked")
            .expect("waiter task");
    }

    #[tokio::test]
    async fn test_wait_after_completion_returns_immediately() {
        let signal = FinishSignal::new();
        signal.complete();
        timeout(Duration::from_millis(50), signal.wait())
            .await
            .expect("already-complete wait must not block");
    }

    #[tokio::test]
    async fn test_drain_budget_expires() {
        let mut timing = TimingConfig::testing();
        timing.drain_poll_interval = Duration::from_millis(5);
        timing.max_drain_iterations = 3;

        let drain = DrainState::new(&timing);
        assert!(!drain.expired());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(drain.expired());
        assert_eq!(drain.remaining(), Duration::ZERO);
    }

    #[test]
    fn test_leftovers_accounting() {
        let key: courier_core::RoutingKey = "orders.created.certified".parse().unwrap();
        let msg = OutboundMessage::new(serde_json::json!({"n": 1}), key);

        let empty = Leftovers::default();
        assert!(empty.is_empty());

        let some = Leftovers {
            unpublished: vec![msg.clone()],
            unconfirmed: vec![msg.clone(), msg.clone()],
            nacked: vec![],
            dropped_returns: vec![msg],
        };
        assert_eq!(some.total(), 4);
        assert!(!some.is_empty());
    }
}
