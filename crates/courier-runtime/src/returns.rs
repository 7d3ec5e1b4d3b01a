//! Unroutable-return handling
//!
//! When the broker returns a message as unroutable it hands back only the
//! routing key and payload bytes, not our queue entry. The router rebuilds
//! the message and decides between the single emergency retry and the final
//! drop. The retry marker lives in the key itself: a message already carrying
//! the emergency key has used its retry.

use courier_core::{OutboundMessage, RoutingKey};

// ----------------------------------------------------------------------------
// Disposition
// ----------------------------------------------------------------------------

/// What to do with a returned message
#[derive(Debug)]
pub enum ReturnDisposition {
    /// Re-queue under the emergency key; first return for this message
    RetryEmergency(OutboundMessage),
    /// The emergency retry was also returned; give up on the message
    Drop(OutboundMessage),
}

// ----------------------------------------------------------------------------
// Return Router
// ----------------------------------------------------------------------------

/// Folds broker returns into re-queue-or-drop decisions
#[derive(Debug, Default)]
pub struct ReturnRouter {
    retried: u64,
    dropped: u64,
}

impl ReturnRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide the fate of one returned message.
    ///
    /// A key that parses and does not carry the emergency marker gets
    /// exactly one retry under the emergency key. Anything else, including
    /// a key we cannot parse back, is dropped.
    ///
    /// The broker hands back only the routing key and payload, so the
    /// rebuilt message carries a fresh id.
    pub fn on_returned(&mut self, routing_key: &str, payload: Vec<u8>) -> ReturnDisposition {
        let payload: serde_json::Value =
            serde_json::from_slice(&payload).unwrap_or(serde_json::Value::Null);

        match routing_key.parse::<RoutingKey>() {
            Ok(key) if !key.is_emergency() => {
                self.retried += 1;
                tracing::warn!(
                    routing_key = %key,
                    "message returned as unroutable, retrying once via emergency key"
                );
                ReturnDisposition::RetryEmergency(OutboundMessage::new(
                    payload,
                    RoutingKey::emergency(),
                ))
            }
            Ok(key) => {
                self.dropped += 1;
                tracing::error!(
                    routing_key = %key,
                    "emergency retry was also unroutable, dropping message"
                );
                ReturnDisposition::Drop(OutboundMessage::new(payload, key))
            }
            Err(_) => {
                self.dropped += 1;
                tracing::error!(
                    routing_key,
                    "returned message carries an unparseable routing key, dropping"
                );
                ReturnDisposition::Drop(OutboundMessage::new(payload, RoutingKey::emergency()))
            }
        }
    }

    pub fn retried(&self) -> u64 {
        self.retried
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
