//! Centralized Configuration Management
//!
//! Consolidates the configuration consumed by the publisher: the prioritized
//! broker node descriptors, the fallback exchange name and the timing
//! constants driving drain polling, reconnect cycles and synchronous retry.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::node::TrustTier;

// ----------------------------------------------------------------------------
// Broker Node Configuration
// ----------------------------------------------------------------------------

/// One broker endpoint descriptor, as read from configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerNodeConfig {
    pub host: String,
    pub port: u16,
    pub vhost: String,
    pub username: String,
    pub password: String,
    pub exchange: String,
    #[serde(default)]
    pub tls: bool,
    /// Selection priority bucket; lower is tried first. Default bucket when absent.
    #[serde(default)]
    pub priority: Option<u32>,
    #[serde(default)]
    pub trust_tier: TrustTier,
}

impl BrokerNodeConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            vhost: "/".to_string(),
            username: String::new(),
            password: String::new(),
            exchange: String::new(),
            tls: false,
            priority: None,
            trust_tier: TrustTier::default(),
        }
    }

    pub fn with_vhost(mut self, vhost: impl Into<String>) -> Self {
        self.vhost = vhost.into();
        self
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = exchange.into();
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    pub fn with_trust_tier(mut self, tier: TrustTier) -> Self {
        self.trust_tier = tier;
        self
    }
}

// ----------------------------------------------------------------------------
// Timing Configuration
// ----------------------------------------------------------------------------

/// Timing constants for drain polling, reconnect cycling and sync retry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Interval between drain/confirm polls during gentle finish
    pub drain_poll_interval: Duration,
    /// Maximum number of drain polls before closing anyway
    pub max_drain_iterations: u32,
    /// Maximum number of full-pool reconnect cycles before giving up
    pub max_reconnect_cycles: u32,
    /// Pause between full-pool reconnect cycles
    pub reconnect_pause: Duration,
    /// Attempts per message in synchronous mode
    pub sync_max_tries: u32,
    /// Delay between synchronous attempts
    pub sync_retry_delay: Duration,
    /// Per-attempt wait for a confirmation in synchronous mode
    pub sync_confirm_timeout: Duration,
    /// Bound on the caller's wait for worker readiness
    pub ready_wait_timeout: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            drain_poll_interval: Duration::from_millis(500),
            max_drain_iterations: 60,
            max_reconnect_cycles: 3,
            reconnect_pause: Duration::from_secs(2),
            sync_max_tries: 3,
            sync_retry_delay: Duration::from_millis(500),
            sync_confirm_timeout: Duration::from_secs(5),
            ready_wait_timeout: Duration::from_secs(10),
        }
    }
}

impl TimingConfig {
    /// Create timing optimized for tests (short intervals, few iterations)
    pub fn testing() -> Self {
        Self {
            drain_poll_interval: Duration::from_millis(10),
            max_drain_iterations: 20,
            max_reconnect_cycles: 2,
            reconnect_pause: Duration::from_millis(10),
            sync_max_tries: 3,
            sync_retry_delay: Duration::from_millis(5),
            sync_confirm_timeout: Duration::from_millis(250),
            ready_wait_timeout: Duration::from_millis(500),
        }
    }
}

// ----------------------------------------------------------------------------
// Channel Configuration
// ----------------------------------------------------------------------------

/// Buffer sizes for the broker event channel wired into each session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Buffer size for broker events (confirms, returns, closes)
    pub broker_event_buffer_size: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            broker_event_buffer_size: 128, // confirms can be bursty
        }
    }
}

// ----------------------------------------------------------------------------
// Master Configuration
// ----------------------------------------------------------------------------

/// Master configuration for a courier publisher
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CourierConfig {
    /// Prioritized broker endpoint descriptors
    pub nodes: Vec<BrokerNodeConfig>,
    /// Well-known exchange substituted when the configured one is missing
    pub fallback_exchange: String,
    /// Timing constants
    pub timing: TimingConfig,
    /// Channel buffer configuration
    pub channels: ChannelConfig,
}

impl Default for CourierConfig {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            fallback_exchange: "courier.fallback".to_string(),
            timing: TimingConfig::default(),
            channels: ChannelConfig::default(),
        }
    }
}

impl CourierConfig {
    pub fn new(nodes: Vec<BrokerNodeConfig>) -> Self {
        Self {
            nodes,
            ..Default::default()
        }
    }

    /// Create configuration optimized for testing
    pub fn testing(nodes: Vec<BrokerNodeConfig>) -> Self {
        Self {
            nodes,
            fallback_exchange: "courier.fallback".to_string(),
            timing: TimingConfig::testing(),
            channels: ChannelConfig::default(),
        }
    }

    pub fn with_fallback_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.fallback_exchange = exchange.into();
        self
    }

    pub fn with_timing(mut self, timing: TimingConfig) -> Self {
        self.timing = timing;
        self
    }

    /// Validate the configuration for consistency and feasibility
    pub fn validate(&self) -> Result<(), crate::errors::ConfigError> {
        use crate::errors::ConfigError;

        if self.nodes.is_empty() {
            return Err(ConfigError::NoNodesConfigured);
        }
        if self.fallback_exchange.is_empty() {
            return Err(ConfigError::MissingField {
                field: "fallback_exchange",
            });
        }
        if self.timing.max_drain_iterations == 0 {
            return Err(ConfigError::InvalidTiming {
                reason: "max_drain_iterations cannot be zero".to_string(),
            });
        }
        if self.timing.max_reconnect_cycles == 0 {
            return Err(ConfigError::InvalidTiming {
                reason: "max_reconnect_cycles cannot be zero".to_string(),
            });
        }
        if self.timing.sync_max_tries == 0 {
            return Err(ConfigError::InvalidTiming {
                reason: "sync_max_tries cannot be zero".to_string(),
            });
        }
        if self.timing.drain_poll_interval.is_zero() {
            return Err(ConfigError::InvalidTiming {
                reason: "drain_poll_interval cannot be zero".to_string(),
            });
        }
        if self.channels.broker_event_buffer_size == 0 {
            return Err(ConfigError::InvalidTiming {
                reason: "broker_event_buffer_size cannot be zero".to_string(),
            });
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn node() -> BrokerNodeConfig {
        BrokerNodeConfig::new("mq1", 5672)
            .with_credentials("guest", "guest")
            .with_exchange("events")
    }

    #[test]
    fn test_default_config_rejects_empty_pool() {
        let config = CourierConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_valid_config() {
        let config = CourierConfig::new(vec![node()]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_timing_rejected() {
        let mut config = CourierConfig::new(vec![node()]);
        config.timing.max_reconnect_cycles = 0;
        assert!(config.validate().is_err());

        let mut config = CourierConfig::new(vec![node()]);
        config.timing.drain_poll_interval = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_testing_preset_is_valid_and_fast() {
        let config = CourierConfig::testing(vec![node()]);
        assert!(config.validate().is_ok());
        assert!(config.timing.drain_poll_interval < Duration::from_millis(100));
    }
}
