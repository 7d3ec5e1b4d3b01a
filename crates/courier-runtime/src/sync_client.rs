//! Synchronous publishing mode
//!
//! The alternative to the background worker: the caller owns the session and
//! every `publish` call connects on demand, publishes, then blocks on the
//! confirmation before returning. Failures retry in place, bounded by
//! `sync_max_tries` per message; the unroutable path mirrors the worker's
//! single emergency retry. No task, no queue, no leftovers.

use courier_core::{
    BrokerConnector, BrokerEvent, BrokerNode, BrokerSession, ConfirmKind, CourierConfig,
    CourierError, CourierResult, DeliveryError, NodePool, OutboundMessage, ProtocolError,
    RoutingKey, TimingConfig,
};

use crate::connector::{AttemptOutcome, Reconnector};

// ----------------------------------------------------------------------------
// Attempt Verdict
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Confirmed,
    Returned,
    Failed(&'static str),
}

// ----------------------------------------------------------------------------
// Synchronous Publisher
// ----------------------------------------------------------------------------

/// Connect-on-demand publisher with blocking confirmation
pub struct SyncPublisher {
    reconnector: Reconnector,
    timing: TimingConfig,
    session: Option<BrokerSession>,
    active_node: Option<BrokerNode>,
    next_tag: u64,
}

impl SyncPublisher {
    pub fn new(config: CourierConfig, connector: impl BrokerConnector) -> CourierResult<Self> {
        config.validate()?;
        let pool = NodePool::from_configs(config.nodes.clone())?;
        Ok(Self {
            reconnector: Reconnector::new(
                pool,
                std::sync::Arc::new(connector),
                config.timing.clone(),
                config.channels.broker_event_buffer_size,
            ),
            timing: config.timing,
            session: None,
            active_node: None,
            next_tag: 1,
        })
    }

    /// Publish one message and wait for its confirmation.
    ///
    /// Retries failed attempts up to `sync_max_tries`, reconnecting as
    /// needed. An unroutable return is retried exactly once under the
    /// emergency key (without consuming the attempt budget); a second
    /// return drops the message with an error.
    pub async fn publish(&mut self, message: &OutboundMessage) -> CourierResult<()> {
        let mut current = message.clone();
        let mut emergency_used = current.routing_key.is_emergency();
        let mut attempt = 0;

        while attempt < self.timing.sync_max_tries {
            attempt += 1;
            match self.attempt(&current).await? {
                Verdict::Confirmed => {
                    tracing::debug!(id = %current.id, attempt, "confirmed");
                    return Ok(());
                }
                Verdict::Returned => {
                    if emergency_used {
                        tracing::error!(
                            id = %current.id,
                            routing_key = %current.routing_key,
                            "emergency retry was also unroutable, dropping"
                        );
                        return Err(DeliveryError::UnroutableDropped {
                            routing_key: current.routing_key.to_string(),
                        }
                        .into());
                    }
                    tracing::warn!(
                        id = %current.id,
                        routing_key = %current.routing_key,
                        "message returned as unroutable, retrying via emergency key"
                    );
                    emergency_used = true;
                    current = current.rerouted_to_emergency();
                    // The rewrite retry does not consume the attempt budget
                    attempt -= 1;
                }
                Verdict::Failed(reason) => {
                    tracing::warn!(
                        id = %current.id,
                        attempt,
                        of = self.timing.sync_max_tries,
                        reason,
                        "publish attempt failed"
                    );
                    if attempt < self.timing.sync_max_tries {
                        tokio::time::sleep(self.timing.sync_retry_delay).await;
                    }
                }
            }
        }

        Err(DeliveryError::AttemptsExhausted {
            attempts: self.timing.sync_max_tries,
        }
        .into())
    }

    /// Close the session if one is open
    pub async fn close(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.handle.close().await;
        }
        self.active_node = None;
    }

    // ------------------------------------------------------------------------
    // One attempt
    // ------------------------------------------------------------------------

    async fn attempt(&mut self, message: &OutboundMessage) -> CourierResult<Verdict> {
        self.ensure_session().await?;

        let tier = self
            .active_node
            .as_ref()
            .map(|node| node.trust_tier)
            .unwrap_or_default();
        let key = if message.routing_key.is_emergency() {
            message.routing_key.clone()
        } else {
            message.routing_key.for_tier(tier)
        };
        let tag = self.next_tag;
        self.next_tag += 1;
        let payload = message.payload_bytes();

        let publish_failed = {
            let Some(session) = self.session.as_mut() else {
                return Ok(Verdict::Failed("no session"));
            };
            session
                .handle
                .publish(&key.to_string(), &payload, tag)
                .await
                .is_err()
        };
        if publish_failed {
            self.drop_session();
            return Ok(Verdict::Failed("publish call failed"));
        }

        self.await_confirm(tag, &key).await
    }

    async fn await_confirm(&mut self, tag: u64, key: &RoutingKey) -> CourierResult<Verdict> {
        let key_str = key.to_string();
        let wait = self.timing.sync_confirm_timeout;

        let (verdict, lose_session) = {
            let Some(session) = self.session.as_mut() else {
                return Ok(Verdict::Failed("no session"));
            };
            loop {
                match tokio::time::timeout(wait, session.events.recv()).await {
                    Err(_) => break (Verdict::Failed("confirmation timed out"), true),
                    Ok(None) => break (Verdict::Failed("event stream closed"), true),
                    Ok(Some(BrokerEvent::Confirm {
                        tag: confirmed,
                        multiple,
                        kind,
                    })) => {
                        // Stale confirms for earlier tags are skipped
                        if confirmed != tag && !(multiple && confirmed >= tag) {
                            continue;
                        }
                        match kind {
                            ConfirmKind::Ack => break (Verdict::Confirmed, false),
                            ConfirmKind::Nack => break (Verdict::Failed("broker nacked"), false),
                            ConfirmKind::Unknown(kind) => {
                                return Err(ProtocolError::UnknownConfirmKind { kind }.into());
                            }
                        }
                    }
                    Ok(Some(BrokerEvent::Returned { routing_key, .. })) => {
                        if routing_key == key_str {
                            break (Verdict::Returned, false);
                        }
                    }
                    Ok(Some(BrokerEvent::Closed {
                        initiated_by_caller: true,
                        ..
                    })) => continue,
                    Ok(Some(BrokerEvent::Closed { fault, .. })) => {
                        tracing::warn!(%fault, "channel closed mid-confirmation");
                        break (Verdict::Failed("channel closed"), true);
                    }
                }
            }
        };

        if lose_session {
            self.drop_session();
        }
        Ok(verdict)
    }

    async fn ensure_session(&mut self) -> CourierResult<()> {
        while self.session.is_none() {
            match self.reconnector.next_attempt().await? {
                AttemptOutcome::Connected(session, node) => {
                    self.session = Some(session);
                    self.active_node = Some(node);
                    self.next_tag = 1;
                }
                AttemptOutcome::NodeFailed(_) => continue,
                AttemptOutcome::CycleExhausted => {
                    tokio::time::sleep(self.reconnector.cycle_pause()).await;
                }
                AttemptOutcome::GaveUp(reason) => {
                    return Err(CourierError::Unavailable { reason });
                }
            }
        }
        Ok(())
    }

    fn drop_session(&mut self) {
        self.session = None;
        self.active_node = None;
        self.next_tag = 1;
    }
}

impl std::fmt::Debug for SyncPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncPublisher")
            .field("connected", &self.session.is_some())
            .field("next_tag", &self.next_tag)
            .finish_non_exhaustive()
    }
}
