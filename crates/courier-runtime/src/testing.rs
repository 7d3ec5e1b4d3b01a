//! In-memory broker for tests
//!
//! A scriptable `BrokerConnector` that stands in for a real broker cluster:
//! per-host connect failure scripts, configurable confirm behavior, injected
//! publish failures, missing exchanges and unroutable returns. Every accepted
//! publish is recorded so tests can assert on endpoints, exchanges, routing
//! keys and delivery tags.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use courier_core::{
    BrokerConnector, BrokerEvent, BrokerNode, BrokerSession, ChannelFault, ConfirmKind,
    ConnectError, PublishHandle,
};

// ----------------------------------------------------------------------------
// Scripting Surface
// ----------------------------------------------------------------------------

/// How the broker confirms accepted publishes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConfirmMode {
    /// Ack every publish immediately
    #[default]
    AckAll,
    /// Nack every publish immediately
    NackAll,
    /// Never confirm anything
    Silent,
    /// Confirm with an unrecognized kind byte
    Garbled,
}

/// One accepted publish, as seen by the broker
#[derive(Debug, Clone)]
pub struct PublishRecord {
    pub endpoint: String,
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub tag: u64,
}

#[derive(Debug, Default)]
struct Inner {
    connect_failures: HashMap<String, VecDeque<ConnectError>>,
    confirm_mode: ConfirmMode,
    publish_failures: u32,
    missing_exchanges: HashSet<String>,
    return_unroutable: u32,
    published: Vec<PublishRecord>,
    connects: Vec<String>,
    event_buffers: Vec<usize>,
    sessions: Vec<mpsc::Sender<BrokerEvent>>,
}

// ----------------------------------------------------------------------------
// Memory Broker
// ----------------------------------------------------------------------------

/// Scriptable in-memory broker cluster
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("memory broker lock poisoned")
    }

    /// Queue one connect failure for the given host; consumed in order
    pub fn fail_connect(&self, host: &str, error: ConnectError) {
        self.lock()
            .connect_failures
            .entry(host.to_string())
            .or_default()
            .push_back(error);
    }

    pub fn set_confirm_mode(&self, mode: ConfirmMode) {
        self.lock().confirm_mode = mode;
    }

    /// Fail the next `count` publish calls with a synchronous channel fault
    pub fn fail_publishes(&self, count: u32) {
        self.lock().publish_failures = count;
    }

    /// Declare an exchange missing; publishing against it closes the channel
    pub fn missing_exchange(&self, exchange: &str) {
        self.lock().missing_exchanges.insert(exchange.to_string());
    }

    /// Return the next `count` publishes as unroutable (any routing key)
    pub fn return_unroutable(&self, count: u32) {
        self.lock().return_unroutable = count;
    }

    /// Close every open session with the given fault, as the broker would
    pub fn inject_close(&self, fault: ChannelFault) {
        let sessions: Vec<_> = self.lock().sessions.drain(..).collect();
        for session in sessions {
            let _ = session.try_send(BrokerEvent::Closed {
                fault: fault.clone(),
                initiated_by_caller: false,
            });
        }
    }

    pub fn published(&self) -> Vec<PublishRecord> {
        self.lock().published.clone()
    }

    pub fn publish_count(&self) -> usize {
        self.lock().published.len()
    }

    /// Endpoints in connection order, including reconnects
    pub fn connected_endpoints(&self) -> Vec<String> {
        self.lock().connects.clone()
    }

    pub fn connect_count(&self) -> usize {
        self.lock().connects.len()
    }

    /// Event-channel buffer size of each session, in connection order
    pub fn event_buffer_sizes(&self) -> Vec<usize> {
        self.lock().event_buffers.clone()
    }
}

#[async_trait]
impl BrokerConnector for MemoryBroker {
    async fn open(
        &self,
        node: &BrokerNode,
        exchange: &str,
        event_buffer: usize,
    ) -> Result<BrokerSession, ConnectError> {
        let mut inner = self.lock();
        if let Some(scripted) = inner
            .connect_failures
            .get_mut(&node.host)
            .and_then(VecDeque::pop_front)
        {
            return Err(scripted);
        }

        let (events_tx, events_rx) = mpsc::channel(event_buffer);
        inner.connects.push(node.endpoint());
        inner.event_buffers.push(event_buffer);
        inner.sessions.push(events_tx.clone());
        Ok(BrokerSession {
            handle: Box::new(MemoryPublishHandle {
                broker: self.inner.clone(),
                endpoint: node.endpoint(),
                exchange: exchange.to_string(),
                events: events_tx,
                closed: false,
            }),
            events: events_rx,
        })
    }
}

// ----------------------------------------------------------------------------
// Publish Handle
// ----------------------------------------------------------------------------

struct MemoryPublishHandle {
    broker: Arc<Mutex<Inner>>,
    endpoint: String,
    exchange: String,
    events: mpsc::Sender<BrokerEvent>,
    closed: bool,
}

#[async_trait]
impl PublishHandle for MemoryPublishHandle {
    async fn publish(
        &mut self,
        routing_key: &str,
        payload: &[u8],
        tag: u64,
    ) -> Result<(), ChannelFault> {
        if self.closed {
            return Err(ChannelFault::Other {
                reason: "handle closed".to_string(),
            });
        }

        let mut inner = self.broker.lock().expect("memory broker lock poisoned");

        if inner.missing_exchanges.contains(&self.exchange) {
            // The broker closes the channel asynchronously; the publish call
            // itself does not error.
            let _ = self.events.try_send(BrokerEvent::Closed {
                fault: ChannelFault::MissingExchange {
                    exchange: self.exchange.clone(),
                },
                initiated_by_caller: false,
            });
            return Ok(());
        }

        if inner.publish_failures > 0 {
            inner.publish_failures -= 1;
            return Err(ChannelFault::Other {
                reason: "injected publish failure".to_string(),
            });
        }

        inner.published.push(PublishRecord {
            endpoint: self.endpoint.clone(),
            exchange: self.exchange.clone(),
            routing_key: routing_key.to_string(),
            payload: payload.to_vec(),
            tag,
        });

        if inner.return_unroutable > 0 {
            inner.return_unroutable -= 1;
            let _ = self.events.try_send(BrokerEvent::Returned {
                routing_key: routing_key.to_string(),
                payload: payload.to_vec(),
            });
            // Mandatory-but-returned messages are still confirmed
            let _ = self.events.try_send(BrokerEvent::Confirm {
                tag,
                multiple: false,
                kind: ConfirmKind::Ack,
            });
            return Ok(());
        }

        let confirm = match inner.confirm_mode {
            ConfirmMode::AckAll => Some(ConfirmKind::Ack),
            ConfirmMode::NackAll => Some(ConfirmKind::Nack),
            ConfirmMode::Garbled => Some(ConfirmKind::Unknown(9)),
            ConfirmMode::Silent => None,
        };
        if let Some(kind) = confirm {
            let _ = self.events.try_send(BrokerEvent::Confirm {
                tag,
                multiple: false,
                kind,
            });
        }
        Ok(())
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.events.try_send(BrokerEvent::Closed {
            fault: ChannelFault::Other {
                reason: "closed by caller".to_string(),
            },
            initiated_by_caller: true,
        });
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
