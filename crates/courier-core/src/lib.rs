//! Courier core types
//!
//! This crate contains the stable type layer of the courier publishing
//! client:
//! - Broker node descriptors and the prioritized failover pool
//! - The publisher lifecycle state machine
//! - Outbound message and routing-key value types
//! - Publisher-confirm tracking
//! - The broker port traits the runtime drives
//!
//! The runtime engine lives in `courier-runtime`; this crate carries no
//! background tasks of its own.

pub mod broker;
pub mod config;
pub mod confirm;
pub mod errors;
pub mod message;
pub mod node;
pub mod state;

pub use broker::{BrokerConnector, BrokerEvent, BrokerSession, ConfirmKind, PublishHandle};
pub use config::{BrokerNodeConfig, ChannelConfig, CourierConfig, TimingConfig};
pub use confirm::ConfirmLedger;
pub use errors::{
    ChannelFault, ConfigError, ConnectError, CourierError, CourierResult, DeliveryError,
    ProtocolError,
};
pub use message::{OutboundMessage, RoutingKey, EMERGENCY_ROUTING_KEY};
pub use node::{BrokerNode, NodePool, TrustTier, DEFAULT_PRIORITY, LAST_RESORT_PRIORITY};
pub use state::{LinkState, StateCell, StateReader, UnavailableReason};
