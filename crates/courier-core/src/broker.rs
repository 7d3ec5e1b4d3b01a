//! Broker port traits
//!
//! The wire protocol lives behind these traits: an underlying client library
//! provides the open-able connection, the channel with publish support and
//! publisher-confirm mode, and the close/return callbacks. Callbacks are
//! surfaced as a `BrokerEvent` stream on a tokio channel so the worker task
//! can fold them into its single reactive loop.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::errors::{ChannelFault, ConnectError};
use crate::node::BrokerNode;

// ----------------------------------------------------------------------------
// Broker Events
// ----------------------------------------------------------------------------

/// Confirmation kind as decoded from the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmKind {
    Ack,
    Nack,
    /// Unrecognized confirmation type; a protocol error, but not by itself
    /// a reason to tear down the connection
    Unknown(u8),
}

/// Asynchronous events surfaced by the broker session
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    /// Publisher confirm for one tag, or cumulatively for all tags ≤ it
    Confirm {
        tag: u64,
        multiple: bool,
        kind: ConfirmKind,
    },
    /// The broker could not route a published message
    Returned {
        routing_key: String,
        payload: Vec<u8>,
    },
    /// The channel or connection closed
    Closed {
        fault: ChannelFault,
        /// Expected close from caller-initiated shutdown; a no-op for the worker
        initiated_by_caller: bool,
    },
}

// ----------------------------------------------------------------------------
// Port Traits
// ----------------------------------------------------------------------------

/// Publish side of an open channel in confirm mode
#[async_trait]
pub trait PublishHandle: Send {
    /// Publish one message under the given delivery tag.
    ///
    /// A synchronous error here means the publish call itself failed; the
    /// caller re-queues the message. Confirm outcomes arrive later as
    /// `BrokerEvent::Confirm`.
    async fn publish(
        &mut self,
        routing_key: &str,
        payload: &[u8],
        tag: u64,
    ) -> Result<(), ChannelFault>;

    /// Close the channel and connection; close events with
    /// `initiated_by_caller` set may still be emitted afterwards.
    async fn close(&mut self);
}

/// An open connection + channel with confirm mode enabled
pub struct BrokerSession {
    pub handle: Box<dyn PublishHandle>,
    pub events: mpsc::Receiver<BrokerEvent>,
}

impl std::fmt::Debug for BrokerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerSession").finish_non_exhaustive()
    }
}

/// Opens sessions against broker nodes.
///
/// Implementations dial the node, open a channel, enable publisher-confirm
/// mode against the given exchange and wire close/return callbacks into an
/// event channel of the given buffer size. They are expected to bound the
/// dial with their own timeout; connect failures are classified, not
/// retried here.
#[async_trait]
pub trait BrokerConnector: Send + Sync + 'static {
    async fn open(
        &self,
        node: &BrokerNode,
        exchange: &str,
        event_buffer: usize,
    ) -> Result<BrokerSession, ConnectError>;
}
