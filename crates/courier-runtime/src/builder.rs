//! Publisher construction and the caller-facing handle
//!
//! `PublisherBuilder` validates the configuration, wires the channels and
//! spawns the worker task; `PublisherHandle` is the cheap clone callers hold.
//! The handle never touches broker state directly: publishes are commands on
//! an unbounded channel, lifecycle is read through a watch receiver, and the
//! confirm ledger is only ever read (snapshotted) from this side.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use courier_core::{
    BrokerConnector, ConfirmLedger, CourierConfig, CourierError, CourierResult, LinkState,
    NodePool, OutboundMessage, StateCell, StateReader,
};

use crate::connector::Reconnector;
use crate::shutdown::{FinishSignal, Leftovers};
use crate::worker::{PublisherWorker, WorkerCommand};

// ----------------------------------------------------------------------------
// Builder
// ----------------------------------------------------------------------------

/// Builds and starts a publisher
pub struct PublisherBuilder {
    config: CourierConfig,
    connector: Arc<dyn BrokerConnector>,
}

impl PublisherBuilder {
    pub fn new(config: CourierConfig, connector: impl BrokerConnector) -> Self {
        Self {
            config,
            connector: Arc::new(connector),
        }
    }

    /// Validate configuration, spawn the worker and hand back the handle.
    ///
    /// Returns immediately; the worker connects in the background and the
    /// handle accepts publishes right away (they queue until the link is
    /// available). Must be called within a tokio runtime.
    pub fn start(self) -> CourierResult<PublisherHandle> {
        self.config.validate()?;
        let pool = NodePool::from_configs(self.config.nodes.clone())?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state, state_rx) = StateCell::new();
        // Admission opens at start; publishes queue while the worker connects
        state.set(LinkState::WaitingToBeAvailable);
        let ledger = Arc::new(Mutex::new(ConfirmLedger::new()));
        let leftovers = Arc::new(Mutex::new(None));
        let finish = Arc::new(FinishSignal::new());

        let worker = PublisherWorker::new(
            command_rx,
            Reconnector::new(
                pool,
                self.connector,
                self.config.timing.clone(),
                self.config.channels.broker_event_buffer_size,
            ),
            state,
            ledger.clone(),
            leftovers.clone(),
            finish.clone(),
            self.config.timing.clone(),
            self.config.fallback_exchange.clone(),
        );
        tokio::spawn(worker.run());

        Ok(PublisherHandle {
            command_tx,
            state_rx,
            ledger,
            leftovers,
            finish,
            timing: self.config.timing,
        })
    }
}

// ----------------------------------------------------------------------------
// Handle
// ----------------------------------------------------------------------------

/// Caller-side handle to a running publisher
#[derive(Clone)]
pub struct PublisherHandle {
    command_tx: mpsc::UnboundedSender<WorkerCommand>,
    state_rx: StateReader,
    ledger: Arc<Mutex<ConfirmLedger>>,
    leftovers: Arc<Mutex<Option<Leftovers>>>,
    finish: Arc<FinishSignal>,
    timing: courier_core::TimingConfig,
}

impl PublisherHandle {
    /// Current lifecycle state
    pub fn state(&self) -> LinkState {
        self.state_rx.borrow().clone()
    }

    /// True once the publisher can never publish again
    pub fn is_finished(&self) -> bool {
        self.state_rx.borrow().is_terminal()
    }

    /// Hand a message to the worker without blocking.
    ///
    /// Admission follows the lifecycle state: accepted while waiting or
    /// available, rejected once draining has begun or the link is terminal.
    pub fn enqueue(&self, message: OutboundMessage) -> CourierResult<()> {
        let state = self.state();
        if !state.accepts_publishes() {
            return Err(CourierError::not_accepting(state.to_string()));
        }
        self.command_tx
            .send(WorkerCommand::Publish(message))
            .map_err(|_| CourierError::channel_error("worker task is gone"))
    }

    /// Wait until the link is available, bounded by the configured timeout.
    ///
    /// Resolves early with an error if the link goes terminal while waiting.
    pub async fn wait_until_ready(&self) -> CourierResult<()> {
        let mut rx = self.state_rx.clone();
        let timeout = self.timing.ready_wait_timeout;
        let outcome = tokio::time::timeout(
            timeout,
            rx.wait_for(|state| state.is_available() || state.is_terminal()),
        )
        .await;

        match outcome {
            Ok(Ok(state)) if state.is_available() => Ok(()),
            Ok(Ok(state)) => match &*state {
                LinkState::PermanentlyUnavailable(reason) => Err(CourierError::Unavailable {
                    reason: *reason,
                }),
                _ => Err(CourierError::channel_error("publisher force-finished")),
            },
            Ok(Err(_)) => Err(CourierError::channel_error("worker task is gone")),
            Err(_) => Err(CourierError::Timeout {
                waiting_for: "link readiness",
                waited_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Drain and close: stop admitting, wait (bounded) for the queue and the
    /// confirm ledger to empty, then close the link. Resolves once the
    /// worker has fully stopped; safe to call more than once.
    pub async fn finish_gently(&self) {
        let _ = self.command_tx.send(WorkerCommand::FinishGently);
        self.finish.wait().await;
    }

    /// Abandon everything in flight and stop immediately. Resolves once the
    /// worker has stopped; safe to call more than once, also after
    /// `finish_gently`.
    pub async fn force_finish(&self) {
        let _ = self.command_tx.send(WorkerCommand::ForceFinish);
        self.finish.wait().await;
    }

    /// Messages still outstanding (published, not yet confirmed)
    pub fn unconfirmed_count(&self) -> usize {
        self.ledger
            .lock()
            .expect("confirm ledger lock poisoned")
            .pending_count()
    }

    /// Snapshot of outstanding deliveries in tag order
    pub fn unconfirmed_snapshot(&self) -> Vec<(u64, OutboundMessage)> {
        self.ledger
            .lock()
            .expect("confirm ledger lock poisoned")
            .snapshot()
    }

    /// Everything that did not make it through, available once the worker
    /// has stopped. Empty before shutdown completes.
    pub fn leftovers(&self) -> Leftovers {
        self.leftovers
            .lock()
            .expect("leftovers lock poisoned")
            .clone()
            .unwrap_or_default()
    }

    /// True when the finished publisher left anything behind
    pub fn any_leftovers(&self) -> bool {
        !self.leftovers().is_empty()
    }
}

impl std::fmt::Debug for PublisherHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublisherHandle")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
