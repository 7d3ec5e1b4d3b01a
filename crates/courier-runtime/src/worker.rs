//! Publisher worker task
//!
//! Single long-lived task owning the outbound queue, the broker session and
//! the delivery-tag counter. Everything reaches it through channels: caller
//! commands on an unbounded mpsc, broker confirms/returns/closes on the
//! session's event stream. It is the only writer of the lifecycle state and
//! the confirm ledger, and it fires the finish signal on every exit path.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;

use courier_core::{
    BrokerEvent, BrokerNode, BrokerSession, ConfirmKind, ConfirmLedger, LinkState,
    OutboundMessage, StateCell, TimingConfig, UnavailableReason,
};

use crate::connector::{AttemptOutcome, Reconnector};
use crate::returns::{ReturnDisposition, ReturnRouter};
use crate::shutdown::{DrainState, FinishSignal, Leftovers};

// ----------------------------------------------------------------------------
// Commands
// ----------------------------------------------------------------------------

/// Caller-to-worker commands
#[derive(Debug)]
pub(crate) enum WorkerCommand {
    Publish(OutboundMessage),
    FinishGently,
    ForceFinish,
}

/// Why the worker is exiting
#[derive(Debug, Clone, Copy)]
enum Close {
    Gentle,
    Forced,
    Fatal(UnavailableReason),
}

/// What woke the session loop
enum Wake {
    Command(Option<WorkerCommand>),
    Broker(Option<BrokerEvent>),
    DrainTick,
    Backlog,
}

// ----------------------------------------------------------------------------
// Worker
// ----------------------------------------------------------------------------

pub(crate) struct PublisherWorker {
    command_rx: mpsc::UnboundedReceiver<WorkerCommand>,
    reconnector: Reconnector,
    state: StateCell,
    ledger: Arc<Mutex<ConfirmLedger>>,
    leftovers_slot: Arc<Mutex<Option<Leftovers>>>,
    finish: Arc<FinishSignal>,
    timing: TimingConfig,
    fallback_exchange: String,

    queue: VecDeque<OutboundMessage>,
    session: Option<BrokerSession>,
    active_node: Option<BrokerNode>,
    next_tag: u64,
    drain: Option<DrainState>,
    returns: ReturnRouter,
    dropped_returns: Vec<OutboundMessage>,
}

impl PublisherWorker {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        command_rx: mpsc::UnboundedReceiver<WorkerCommand>,
        reconnector: Reconnector,
        state: StateCell,
        ledger: Arc<Mutex<ConfirmLedger>>,
        leftovers_slot: Arc<Mutex<Option<Leftovers>>>,
        finish: Arc<FinishSignal>,
        timing: TimingConfig,
        fallback_exchange: String,
    ) -> Self {
        Self {
            command_rx,
            reconnector,
            state,
            ledger,
            leftovers_slot,
            finish,
            timing,
            fallback_exchange,
            queue: VecDeque::new(),
            session: None,
            active_node: None,
            next_tag: 1,
            drain: None,
            returns: ReturnRouter::new(),
            dropped_returns: Vec::new(),
        }
    }

    /// Run until shutdown. Completes the finish signal exactly once.
    pub(crate) async fn run(mut self) {
        self.state.set(LinkState::WaitingToBeAvailable);
        let close = self.event_loop().await;
        self.close(close).await;
        self.finish.complete();
    }

    fn ledger(&self) -> MutexGuard<'_, ConfirmLedger> {
        self.ledger.lock().expect("confirm ledger lock poisoned")
    }

    // ------------------------------------------------------------------------
    // Main loop
    // ------------------------------------------------------------------------

    async fn event_loop(&mut self) -> Close {
        loop {
            if self.drain.is_some() {
                if self.queue.is_empty() && self.ledger().is_empty() {
                    tracing::debug!("drain complete, queue and ledger empty");
                    return Close::Gentle;
                }
                if self.drain.as_ref().is_some_and(DrainState::expired) {
                    tracing::warn!(
                        queued = self.queue.len(),
                        unconfirmed = self.ledger().pending_count(),
                        "drain budget spent, closing anyway"
                    );
                    return Close::Gentle;
                }
            }

            let step = if self.session.is_none() {
                self.connect_step().await
            } else {
                self.session_step().await
            };
            if let Some(close) = step {
                return close;
            }
        }
    }

    // ------------------------------------------------------------------------
    // Connecting
    // ------------------------------------------------------------------------

    async fn connect_step(&mut self) -> Option<Close> {
        // Commands keep flowing while disconnected; publishes queue up
        if let Some(close) = self.absorb_commands() {
            return Some(close);
        }

        match self.reconnector.next_attempt().await {
            Ok(AttemptOutcome::Connected(session, node)) => {
                self.install_session(session, node);
                None
            }
            Ok(AttemptOutcome::NodeFailed(_)) => None,
            Ok(AttemptOutcome::CycleExhausted) => self.pause_between_cycles().await,
            Ok(AttemptOutcome::GaveUp(reason)) => {
                self.state.set(LinkState::PermanentlyUnavailable(reason));
                Some(Close::Fatal(reason))
            }
            Err(error) => {
                // Selection over an unconfigured pool; unreachable past
                // builder validation
                tracing::error!(%error, "node selection failed");
                self.state.set(LinkState::PermanentlyUnavailable(
                    UnavailableReason::Unknown,
                ));
                Some(Close::Fatal(UnavailableReason::Unknown))
            }
        }
    }

    fn install_session(&mut self, session: BrokerSession, node: BrokerNode) {
        tracing::info!(
            endpoint = %node.endpoint(),
            exchange = %node.exchange,
            queued = self.queue.len(),
            "session installed, delivery tags reset"
        );
        self.session = Some(session);
        self.active_node = Some(node);
        self.next_tag = 1;
        if self.drain.is_none() {
            self.state.set(LinkState::Available);
        }
    }

    async fn pause_between_cycles(&mut self) -> Option<Close> {
        let mut pause = self.reconnector.cycle_pause();
        if let Some(drain) = &self.drain {
            pause = pause.min(drain.remaining());
        }
        let sleep = tokio::time::sleep(pause);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return None,
                cmd = self.command_rx.recv() => {
                    if let Some(close) = self.apply_command(cmd) {
                        return Some(close);
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Connected
    // ------------------------------------------------------------------------

    async fn session_step(&mut self) -> Option<Close> {
        let has_backlog = !self.queue.is_empty();
        let wake = {
            let session = match self.session.as_mut() {
                Some(session) => session,
                None => return None,
            };
            let drain = self.drain.as_mut();
            tokio::select! {
                biased;
                cmd = self.command_rx.recv() => Wake::Command(cmd),
                event = session.events.recv() => Wake::Broker(event),
                _ = async {
                    match drain {
                        Some(drain) => drain.tick().await,
                        None => std::future::pending::<()>().await,
                    }
                } => Wake::DrainTick,
                _ = std::future::ready(()), if has_backlog => Wake::Backlog,
            }
        };

        match wake {
            Wake::Command(cmd) => self.apply_command(cmd),
            Wake::Broker(Some(event)) => {
                self.handle_broker_event(event).await;
                None
            }
            Wake::Broker(None) => {
                self.detach_for_reconnect("broker event stream closed");
                None
            }
            Wake::DrainTick => None,
            Wake::Backlog => {
                self.publish_next().await;
                None
            }
        }
    }

    async fn handle_broker_event(&mut self, event: BrokerEvent) {
        match event {
            BrokerEvent::Confirm {
                tag,
                multiple,
                kind,
            } => match kind {
                ConfirmKind::Ack => {
                    let resolved = self.ledger().apply(tag, multiple, true);
                    tracing::debug!(tag, multiple, resolved, "ack");
                }
                ConfirmKind::Nack => {
                    let resolved = self.ledger().apply(tag, multiple, false);
                    tracing::warn!(tag, multiple, resolved, "broker nacked delivery");
                }
                ConfirmKind::Unknown(kind) => {
                    // Loud, but not a reason to tear the connection down
                    tracing::error!(tag, kind, "unrecognized confirmation kind from broker");
                }
            },
            BrokerEvent::Returned {
                routing_key,
                payload,
            } => match self.returns.on_returned(&routing_key, payload) {
                ReturnDisposition::RetryEmergency(msg) => {
                    self.queue.push_front(msg);
                }
                ReturnDisposition::Drop(msg) => {
                    self.dropped_returns.push(msg);
                }
            },
            BrokerEvent::Closed {
                initiated_by_caller: true,
                ..
            } => {
                tracing::debug!("caller-initiated close acknowledged by broker");
            }
            BrokerEvent::Closed {
                fault: courier_core::ChannelFault::MissingExchange { exchange },
                ..
            } => {
                self.reopen_with_fallback(exchange).await;
            }
            BrokerEvent::Closed { fault, .. } => {
                tracing::warn!(%fault, "broker closed the channel");
                self.detach_for_reconnect("channel closed by broker");
            }
        }
    }

    /// Publish the head of the queue under the next delivery tag.
    ///
    /// The tag is registered with the ledger before the publish call so a
    /// confirm racing the call's return can never miss its registration. A
    /// synchronous publish failure unregisters, re-queues and forces a full
    /// reconnect; the burned tag is never reused within this session.
    async fn publish_next(&mut self) {
        let Some(msg) = self.queue.pop_front() else {
            return;
        };
        let Some(session) = self.session.as_mut() else {
            self.queue.push_front(msg);
            return;
        };

        let tier = self
            .active_node
            .as_ref()
            .map(|node| node.trust_tier)
            .unwrap_or_default();
        // The emergency key is final; tier rewriting must not touch it
        let key = if msg.routing_key.is_emergency() {
            msg.routing_key.clone()
        } else {
            msg.routing_key.for_tier(tier)
        };

        let tag = self.next_tag;
        self.next_tag += 1;
        self.ledger
            .lock()
            .expect("confirm ledger lock poisoned")
            .register(tag, msg.clone());

        let payload = msg.payload_bytes();
        match session.handle.publish(&key.to_string(), &payload, tag).await {
            Ok(()) => {
                tracing::debug!(tag, routing_key = %key, id = %msg.id, "published");
            }
            Err(fault) => {
                tracing::warn!(tag, %fault, "publish call failed, re-queueing");
                self.ledger().remove(tag);
                self.queue.push_front(msg);
                self.detach_for_reconnect("publish call failed");
            }
        }
    }

    async fn reopen_with_fallback(&mut self, missing: String) {
        if missing == self.fallback_exchange {
            tracing::error!(
                exchange = %missing,
                "fallback exchange itself is missing on the broker"
            );
            self.detach_for_reconnect("fallback exchange missing");
            return;
        }
        let Some(node) = self.active_node.clone() else {
            self.detach_for_reconnect("missing exchange without an active node");
            return;
        };

        tracing::warn!(
            exchange = %missing,
            fallback = %self.fallback_exchange,
            endpoint = %node.endpoint(),
            "exchange missing, reopening channel against fallback exchange"
        );
        match self.reconnector.reopen(&node, &self.fallback_exchange).await {
            Ok(session) => {
                self.session = Some(session);
                self.requeue_unconfirmed();
                self.next_tag = 1;
            }
            Err(error) => {
                tracing::warn!(%error, "fallback reopen failed");
                self.detach_for_reconnect("fallback reopen failed");
            }
        }
    }

    // ------------------------------------------------------------------------
    // Disconnection & commands
    // ------------------------------------------------------------------------

    fn detach_for_reconnect(&mut self, why: &str) {
        tracing::warn!(reason = why, "session lost, reconnecting");
        self.session = None;
        self.active_node = None;
        self.requeue_unconfirmed();
        self.next_tag = 1;
        if self.drain.is_none() {
            self.state.set(LinkState::WaitingToBeAvailable);
        }
    }

    /// Move unconfirmed messages back to the queue head, oldest first
    fn requeue_unconfirmed(&mut self) {
        let pending = self.ledger().drain_pending();
        if pending.is_empty() {
            return;
        }
        tracing::debug!(count = pending.len(), "re-queueing unconfirmed messages");
        for msg in pending.into_iter().rev() {
            self.queue.push_front(msg);
        }
    }

    fn apply_command(&mut self, cmd: Option<WorkerCommand>) -> Option<Close> {
        match cmd {
            Some(WorkerCommand::Publish(msg)) => {
                self.queue.push_back(msg);
                None
            }
            Some(WorkerCommand::FinishGently) => {
                self.begin_drain();
                None
            }
            Some(WorkerCommand::ForceFinish) => Some(Close::Forced),
            None => {
                tracing::debug!("all handles dropped, stopping worker");
                Some(Close::Forced)
            }
        }
    }

    fn absorb_commands(&mut self) -> Option<Close> {
        loop {
            match self.command_rx.try_recv() {
                Ok(cmd) => {
                    if let Some(close) = self.apply_command(Some(cmd)) {
                        return Some(close);
                    }
                }
                Err(mpsc::error::TryRecvError::Empty) => return None,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    return self.apply_command(None);
                }
            }
        }
    }

    fn begin_drain(&mut self) {
        if self.drain.is_some() {
            return;
        }
        tracing::info!(
            queued = self.queue.len(),
            unconfirmed = self.ledger().pending_count(),
            "gentle finish requested, draining"
        );
        self.state.set(LinkState::Draining);
        self.drain = Some(DrainState::new(&self.timing));
    }

    // ------------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------------

    async fn close(&mut self, kind: Close) {
        if let Some(mut session) = self.session.take() {
            session.handle.close().await;
        }

        // Straggler publishes that raced the shutdown still count as lost
        while let Ok(cmd) = self.command_rx.try_recv() {
            if let WorkerCommand::Publish(msg) = cmd {
                self.queue.push_back(msg);
            }
        }
        self.command_rx.close();

        let (unconfirmed, nacked) = {
            let mut ledger = self.ledger();
            (ledger.drain_pending(), ledger.take_nacked())
        };
        let leftovers = Leftovers {
            unpublished: self.queue.drain(..).collect(),
            unconfirmed,
            nacked,
            dropped_returns: std::mem::take(&mut self.dropped_returns),
        };

        match kind {
            Close::Gentle => {
                if leftovers.is_empty() {
                    tracing::info!("gentle finish complete, nothing left behind");
                } else {
                    tracing::warn!(
                        lost = leftovers.total(),
                        "gentle finish closed with messages left behind"
                    );
                }
                self.state.set(LinkState::PermanentlyUnavailable(
                    UnavailableReason::ClosedByCaller,
                ));
            }
            Close::Forced => {
                if !leftovers.is_empty() {
                    tracing::warn!(
                        lost = leftovers.total(),
                        "force finish discarded in-flight messages"
                    );
                }
                self.state.force_finish();
            }
            Close::Fatal(reason) => {
                // State was already set on the connect path
                tracing::error!(
                    %reason,
                    lost = leftovers.total(),
                    "worker stopped, publisher permanently unavailable"
                );
            }
        }

        *self
            .leftovers_slot
            .lock()
            .expect("leftovers lock poisoned") = Some(leftovers);
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
