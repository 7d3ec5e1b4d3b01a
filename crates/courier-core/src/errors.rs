//! Error types for the courier publishing client
//!
//! This module contains all error types used throughout courier, including
//! setup-time configuration errors, connect-time failure classification,
//! channel faults, delivery failures and the main CourierError type that
//! unifies them all.

use crate::state::UnavailableReason;

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Fatal configuration errors, raised at setup time
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("broker node is missing required field `{field}`")]
    MissingField { field: &'static str },
    #[error("no broker nodes configured")]
    NoNodesConfigured,
    #[error("invalid timing configuration: {reason}")]
    InvalidTiming { reason: String },
    #[error("invalid routing key `{key}`: {reason}")]
    InvalidRoutingKey { key: String, reason: String },
}

/// Connect-time failure classification
///
/// All variants drive the same failover path (try next node, then retry the
/// full pool up to a fixed cycle count); they are distinct for diagnostics
/// and for mapping the terminal unavailability reason.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectError {
    #[error("authentication failed on node {node}")]
    AuthenticationFailed { node: String },
    #[error("access denied on node {node} (vhost `{vhost}`)")]
    AccessDenied { node: String, vhost: String },
    #[error("network failure on node {node}: {reason}")]
    Network { node: String, reason: String },
}

/// Channel-level close classification
#[derive(Debug, Clone, thiserror::Error)]
pub enum ChannelFault {
    #[error("exchange `{exchange}` does not exist")]
    MissingExchange { exchange: String },
    #[error("channel closed: {reason}")]
    Other { reason: String },
}

/// Message-level delivery failure after bounded retries
///
/// Raised inline in synchronous mode; in asynchronous mode the affected
/// messages are surfaced through the leftovers API instead.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DeliveryError {
    #[error("delivery failed after {attempts} attempt(s)")]
    AttemptsExhausted { attempts: u32 },
    #[error("message with routing key `{routing_key}` was unroutable even via the emergency key")]
    UnroutableDropped { routing_key: String },
    #[error("broker rejected (nacked) delivery tag {tag}")]
    Nacked { tag: u64 },
}

/// Protocol-level confirmation errors
///
/// Propagated loudly, never silently retried, but a malformed confirmation
/// does not by itself tear down the connection.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("broker sent an unrecognized confirmation kind ({kind})")]
    UnknownConfirmKind { kind: u8 },
}

// ----------------------------------------------------------------------------
// Unified Error Type
// ----------------------------------------------------------------------------

/// Core error type for the courier publishing client
#[derive(Debug, Clone, thiserror::Error)]
pub enum CourierError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("connection error: {0}")]
    Connect(#[from] ConnectError),

    #[error("channel fault: {0}")]
    ChannelFault(#[from] ChannelFault),

    #[error("delivery failure: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Publish admission rejected by the lifecycle state machine
    #[error("publisher is not accepting messages (state: {state})")]
    NotAccepting { state: String },

    /// Terminal unavailability after retries were exhausted
    #[error("publisher permanently unavailable: {reason}")]
    Unavailable { reason: UnavailableReason },

    /// Internal channel plumbing fault (worker/handle communication)
    #[error("channel error: {message}")]
    Channel { message: String },

    /// Bounded wait on readiness or completion expired
    #[error("timed out waiting for {waiting_for} after {waited_ms}ms")]
    Timeout { waiting_for: &'static str, waited_ms: u64 },
}

// ----------------------------------------------------------------------------
// Convenience Error Constructors
// ----------------------------------------------------------------------------

impl CourierError {
    /// Create an internal channel plumbing error with a message
    pub fn channel_error<T: Into<String>>(message: T) -> Self {
        CourierError::Channel {
            message: message.into(),
        }
    }

    /// Create an admission-rejection error for the given state
    pub fn not_accepting<T: Into<String>>(state: T) -> Self {
        CourierError::NotAccepting {
            state: state.into(),
        }
    }

    /// Create a network connect error
    pub fn network<N: Into<String>, R: Into<String>>(node: N, reason: R) -> Self {
        CourierError::Connect(ConnectError::Network {
            node: node.into(),
            reason: reason.into(),
        })
    }

    /// True when the error is terminal for the publisher as a whole
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CourierError::Config(_) | CourierError::Unavailable { .. }
        )
    }
}

// ----------------------------------------------------------------------------
// Type Aliases
// ----------------------------------------------------------------------------

pub type Result<T> = core::result::Result<T, CourierError>;
pub type CourierResult<T> = Result<T>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(CourierError::from(ConfigError::NoNodesConfigured).is_fatal());
        assert!(CourierError::Unavailable {
            reason: UnavailableReason::CouldNotConnect
        }
        .is_fatal());
        assert!(!CourierError::network("mq1:5672", "refused").is_fatal());
        assert!(!CourierError::not_accepting("Draining").is_fatal());
    }

    #[test]
    fn test_error_display() {
        let err = CourierError::from(ChannelFault::MissingExchange {
            exchange: "events".to_string(),
        });
        assert!(err.to_string().contains("`events` does not exist"));
    }
}
