//! Outbound message and routing key value types
//!
//! Messages are opaque to the core beyond their routing key: a three-segment
//! `<namespace>.<topic>.<qualifier>` key whose qualifier is rewritten to the
//! active node's trust tier at publish time, and fully overridden to a fixed
//! emergency value when the broker returns the message as unroutable.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::ConfigError;
use crate::node::TrustTier;

/// Routing key used for the single emergency retry of an unroutable message
pub const EMERGENCY_ROUTING_KEY: &str = "emergency.unroutable.retry";

// ----------------------------------------------------------------------------
// Routing Key
// ----------------------------------------------------------------------------

/// A `<namespace>.<topic>.<qualifier>` routing key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingKey {
    namespace: String,
    topic: String,
    qualifier: String,
}

impl RoutingKey {
    pub fn new(
        namespace: impl Into<String>,
        topic: impl Into<String>,
        qualifier: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            topic: topic.into(),
            qualifier: qualifier.into(),
        }
    }

    /// The fixed emergency key; carries the unroutable-retry marker
    pub fn emergency() -> Self {
        EMERGENCY_ROUTING_KEY
            .parse()
            .expect("emergency key is well-formed")
    }

    /// Copy of this key with the qualifier replaced
    pub fn with_qualifier(&self, qualifier: &str) -> Self {
        Self {
            namespace: self.namespace.clone(),
            topic: self.topic.clone(),
            qualifier: qualifier.to_string(),
        }
    }

    /// Copy of this key with the qualifier reflecting the node's trust tier
    pub fn for_tier(&self, tier: TrustTier) -> Self {
        self.with_qualifier(tier.qualifier())
    }

    /// True once the key carries the emergency-routing marker
    pub fn is_emergency(&self) -> bool {
        self.namespace == "emergency"
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn qualifier(&self) -> &str {
        &self.qualifier
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.namespace, self.topic, self.qualifier)
    }
}

impl FromStr for RoutingKey {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('.').collect();
        if parts.len() != 3 || parts.iter().any(|p| p.is_empty()) {
            return Err(ConfigError::InvalidRoutingKey {
                key: s.to_string(),
                reason: "expected `<namespace>.<topic>.<qualifier>`".to_string(),
            });
        }
        Ok(RoutingKey::new(parts[0], parts[1], parts[2]))
    }
}

// ----------------------------------------------------------------------------
// Outbound Message
// ----------------------------------------------------------------------------

/// One message handed to the core by the business layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Message id for diagnostics; survives re-queueing and re-publishing
    /// while the message stays in process. A broker return carries only the
    /// routing key and payload, so a message rebuilt from one gets a new id.
    pub id: Uuid,
    pub payload: serde_json::Value,
    pub routing_key: RoutingKey,
}

impl OutboundMessage {
    pub fn new(payload: serde_json::Value, routing_key: RoutingKey) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
            routing_key,
        }
    }

    /// Copy of this message rerouted to the emergency key, same id
    pub fn rerouted_to_emergency(&self) -> Self {
        Self {
            id: self.id,
            payload: self.payload.clone(),
            routing_key: RoutingKey::emergency(),
        }
    }

    /// Serialized payload bytes as handed to the broker channel
    pub fn payload_bytes(&self) -> Vec<u8> {
        // Value always serializes
        serde_json::to_vec(&self.payload).unwrap_or_default()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_routing_key_shape() {
        let key: RoutingKey = "orders.created.certified".parse().unwrap();
        assert_eq!(key.namespace(), "orders");
        assert_eq!(key.topic(), "created");
        assert_eq!(key.qualifier(), "certified");
        assert_eq!(key.to_string(), "orders.created.certified");

        assert!("orders.created".parse::<RoutingKey>().is_err());
        assert!("orders..certified".parse::<RoutingKey>().is_err());
        assert!("a.b.c.d".parse::<RoutingKey>().is_err());
    }

    #[test]
    fn test_tier_qualifier_rewrite() {
        let key: RoutingKey = "orders.created.certified".parse().unwrap();
        let rewritten = key.for_tier(TrustTier::Uncertified);
        assert_eq!(rewritten.to_string(), "orders.created.uncertified");
        // Original untouched
        assert_eq!(key.qualifier(), "certified");
    }

    #[test]
    fn test_emergency_marker() {
        let key: RoutingKey = "orders.created.certified".parse().unwrap();
        assert!(!key.is_emergency());
        assert!(RoutingKey::emergency().is_emergency());
        assert_eq!(RoutingKey::emergency().to_string(), EMERGENCY_ROUTING_KEY);
    }

    #[test]
    fn test_emergency_reroute_preserves_identity() {
        let msg = OutboundMessage::new(
            json!({"sku": 42}),
            "orders.created.certified".parse().unwrap(),
        );
        let rerouted = msg.rerouted_to_emergency();
        assert_eq!(rerouted.id, msg.id);
        assert_eq!(rerouted.payload, msg.payload);
        assert!(rerouted.routing_key.is_emergency());
    }
}
