//! Connect/failover engine
//!
//! Drives the node pool through connect cycles one attempt at a time. The
//! stepwise API keeps the worker responsive between attempts: it calls
//! `next_attempt`, reacts to the outcome (install the session, pause between
//! cycles, or go terminal) and stays free to absorb commands in between.

use std::sync::Arc;

use courier_core::{
    BrokerConnector, BrokerNode, BrokerSession, ConnectError, CourierResult, NodePool,
    TimingConfig, UnavailableReason,
};

// ----------------------------------------------------------------------------
// Attempt Outcome
// ----------------------------------------------------------------------------

/// Result of a single connect attempt
#[derive(Debug)]
pub enum AttemptOutcome {
    /// Session is up on the given node
    Connected(BrokerSession, BrokerNode),
    /// This node failed; try the next one immediately
    NodeFailed(ConnectError),
    /// The whole pool has been tried; pause before the next cycle
    CycleExhausted,
    /// All cycles spent; the link is permanently unavailable
    GaveUp(UnavailableReason),
}

// ----------------------------------------------------------------------------
// Reconnector
// ----------------------------------------------------------------------------

/// Stepwise connect/failover driver over the prioritized node pool
pub struct Reconnector {
    pool: NodePool,
    connector: Arc<dyn BrokerConnector>,
    timing: TimingConfig,
    event_buffer: usize,
    cycles_used: u32,
    last_error: Option<ConnectError>,
}

impl Reconnector {
    pub fn new(
        pool: NodePool,
        connector: Arc<dyn BrokerConnector>,
        timing: TimingConfig,
        event_buffer: usize,
    ) -> Self {
        Self {
            pool,
            connector,
            timing,
            event_buffer,
            cycles_used: 0,
            last_error: None,
        }
    }

    /// Make one connect attempt against the next node in the cycle.
    ///
    /// A failed node is demoted to the last-resort bucket before the next
    /// selection. When the cycle runs dry the pool is restored from the
    /// archive (demotions stick) until the cycle budget is spent. A
    /// successful connect resets the cycle accounting so a later disconnect
    /// starts from a full budget again.
    pub async fn next_attempt(&mut self) -> CourierResult<AttemptOutcome> {
        let node = match self.pool.select_next()? {
            Some(node) => node,
            None => {
                self.cycles_used += 1;
                if self.cycles_used >= self.timing.max_reconnect_cycles {
                    let reason = self.give_up_reason();
                    tracing::error!(
                        cycles = self.cycles_used,
                        %reason,
                        "connect cycles exhausted, giving up"
                    );
                    return Ok(AttemptOutcome::GaveUp(reason));
                }
                tracing::warn!(
                    cycle = self.cycles_used,
                    of = self.timing.max_reconnect_cycles,
                    "node pool exhausted, pausing before next cycle"
                );
                self.pool.reset();
                return Ok(AttemptOutcome::CycleExhausted);
            }
        };

        tracing::debug!(endpoint = %node.endpoint(), priority = node.priority, "connect attempt");
        match self
            .connector
            .open(&node, &node.exchange, self.event_buffer)
            .await
        {
            Ok(session) => {
                tracing::info!(endpoint = %node.endpoint(), "connected");
                self.pool.reset();
                self.cycles_used = 0;
                self.last_error = None;
                Ok(AttemptOutcome::Connected(session, node))
            }
            Err(error) => {
                tracing::warn!(endpoint = %node.endpoint(), %error, "connect attempt failed");
                self.pool.demote_current();
                self.last_error = Some(error.clone());
                Ok(AttemptOutcome::NodeFailed(error))
            }
        }
    }

    /// Open a fresh session on a known node with an explicit exchange.
    ///
    /// Used to substitute the fallback exchange on the same node after a
    /// missing-exchange close; does not touch pool or cycle accounting.
    pub async fn reopen(
        &self,
        node: &BrokerNode,
        exchange: &str,
    ) -> Result<BrokerSession, ConnectError> {
        self.connector.open(node, exchange, self.event_buffer).await
    }

    /// Pause length between cycles
    pub fn cycle_pause(&self) -> std::time::Duration {
        self.timing.reconnect_pause
    }

    fn give_up_reason(&self) -> UnavailableReason {
        match &self.last_error {
            Some(ConnectError::AuthenticationFailed { .. }) => {
                UnavailableReason::AuthenticationFailure
            }
            Some(_) | None => UnavailableReason::CouldNotConnect,
        }
    }
}

impl std::fmt::Debug for Reconnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconnector")
            .field("cycles_used", &self.cycles_used)
            .field("last_error", &self.last_error)
            .finish_non_exhaustive()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryBroker;
    use courier_core::BrokerNodeConfig;

    fn node_config(host: &str) -> BrokerNodeConfig {
        BrokerNodeConfig::new(host, 5672)
            .with_credentials("guest", "guest")
            .with_exchange("events")
    }

    fn reconnector(broker: &MemoryBroker, hosts: &[&str]) -> Reconnector {
        let pool = NodePool::from_configs(hosts.iter().map(|h| node_config(h)).collect())
            .expect("valid configs");
        Reconnector::new(pool, Arc::new(broker.clone()), TimingConfig::testing(), 16)
    }

    #[tokio::test]
    async fn test_fails_over_to_next_node() {
        let broker = MemoryBroker::new();
        broker.fail_connect(
            "mq1",
            ConnectError::Network {
                node: "mq1:5672/".to_string(),
                reason: "refused".to_string(),
            },
        );
        let mut reconnector = reconnector(&broker, &["mq1", "mq2"]);

        // mq1 may or may not come first (same priority bucket), but within
        // one cycle a connection must land on a healthy node.
        for _ in 0..2 {
            match reconnector.next_attempt().await.unwrap() {
                AttemptOutcome::Connected(_, node) => {
                    assert!(node.host == "mq1" || node.host == "mq2");
                    return;
                }
                AttemptOutcome::NodeFailed(_) => continue,
                other => panic!("unexpected outcome {:?}", other),
            }
        }
        panic!("no connection within one cycle");
    }

    #[tokio::test]
    async fn test_gives_up_after_cycle_budget() {
        let broker = MemoryBroker::new();
        // testing() allows 2 cycles over a single node
        for _ in 0..4 {
            broker.fail_connect(
                "mq1",
                ConnectError::AuthenticationFailed {
                    node: "mq1:5672/".to_string(),
                },
            );
        }
        let mut reconnector = reconnector(&broker, &["mq1"]);

        let mut gave_up = None;
        for _ in 0..8 {
            match reconnector.next_attempt().await.unwrap() {
                AttemptOutcome::NodeFailed(_) | AttemptOutcome::CycleExhausted => continue,
                AttemptOutcome::GaveUp(reason) => {
                    gave_up = Some(reason);
                    break;
                }
                AttemptOutcome::Connected(..) => panic!("connect must not succeed"),
            }
        }
        assert_eq!(gave_up, Some(UnavailableReason::AuthenticationFailure));
    }

    #[tokio::test]
    async fn test_success_resets_cycle_accounting() {
        let broker = MemoryBroker::new();
        let mut reconnector = reconnector(&broker, &["mq1"]);

        match reconnector.next_attempt().await.unwrap() {
            AttemptOutcome::Connected(..) => {}
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(reconnector.cycles_used, 0);
        // Pool restored, so a later reconnect can select again
        assert!(reconnector.pool.has_more());
    }
}
