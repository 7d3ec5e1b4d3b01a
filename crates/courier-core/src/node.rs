//! Broker node pool with priority selection and failover demotion
//!
//! The pool holds every configured broker endpoint twice: an active set
//! consumed one node at a time during a connect cycle, and an archive used
//! to restore the active set once a full cycle has been exhausted. Nodes are
//! never destroyed, only re-bucketed; repeated failure demotes a node into a
//! terminal last-resort bucket so future cycles try it last.

use std::collections::BTreeMap;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::BrokerNodeConfig;
use crate::errors::ConfigError;

/// Priority bucket used when the configuration names none
pub const DEFAULT_PRIORITY: u32 = 100;

/// Terminal bucket for demoted nodes; always tried last
pub const LAST_RESORT_PRIORITY: u32 = u32::MAX;

// ----------------------------------------------------------------------------
// Broker Node
// ----------------------------------------------------------------------------

/// Trust classification of a broker endpoint, reflected in the routing-key
/// qualifier of every message published through it
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustTier {
    #[default]
    Certified,
    Uncertified,
}

impl TrustTier {
    /// Routing-key qualifier for this tier
    pub fn qualifier(&self) -> &'static str {
        match self {
            TrustTier::Certified => "certified",
            TrustTier::Uncertified => "uncertified",
        }
    }
}

/// A validated broker endpoint with its selection priority
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerNode {
    pub host: String,
    pub port: u16,
    pub vhost: String,
    pub username: String,
    pub password: String,
    pub exchange: String,
    pub tls: bool,
    pub priority: u32,
    pub trust_tier: TrustTier,
}

impl BrokerNode {
    /// Stable endpoint label for logs and error messages
    pub fn endpoint(&self) -> String {
        format!("{}:{}{}", self.host, self.port, self.vhost)
    }

    fn same_endpoint(&self, other: &BrokerNode) -> bool {
        self.host == other.host && self.port == other.port && self.vhost == other.vhost
    }
}

impl TryFrom<BrokerNodeConfig> for BrokerNode {
    type Error = ConfigError;

    fn try_from(config: BrokerNodeConfig) -> Result<Self, Self::Error> {
        if config.host.is_empty() {
            return Err(ConfigError::MissingField { field: "host" });
        }
        if config.vhost.is_empty() {
            return Err(ConfigError::MissingField { field: "vhost" });
        }
        if config.username.is_empty() {
            return Err(ConfigError::MissingField { field: "username" });
        }
        if config.password.is_empty() {
            return Err(ConfigError::MissingField { field: "password" });
        }
        if config.exchange.is_empty() {
            return Err(ConfigError::MissingField { field: "exchange" });
        }
        Ok(BrokerNode {
            host: config.host,
            port: config.port,
            vhost: config.vhost,
            username: config.username,
            password: config.password,
            exchange: config.exchange,
            tls: config.tls,
            priority: config.priority.unwrap_or(DEFAULT_PRIORITY),
            trust_tier: config.trust_tier,
        })
    }
}

// ----------------------------------------------------------------------------
// Node Pool
// ----------------------------------------------------------------------------

/// Prioritized pool of broker endpoints
#[derive(Debug, Clone, Default)]
pub struct NodePool {
    /// Unconsumed nodes for the current connect cycle, keyed by priority
    active: BTreeMap<u32, Vec<BrokerNode>>,
    /// Full membership incl. demotion history; source for `reset`
    archive: BTreeMap<u32, Vec<BrokerNode>>,
    /// Most recently selected node
    current: Option<BrokerNode>,
    configured: bool,
}

impl NodePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a pool from node configurations; fatal on missing fields
    pub fn from_configs(configs: Vec<BrokerNodeConfig>) -> Result<Self, ConfigError> {
        let mut pool = Self::new();
        for config in configs {
            pool.add(config)?;
        }
        Ok(pool)
    }

    /// Validate and add a node to both the active set and the archive
    pub fn add(&mut self, config: BrokerNodeConfig) -> Result<(), ConfigError> {
        let node = BrokerNode::try_from(config)?;
        self.active
            .entry(node.priority)
            .or_default()
            .push(node.clone());
        self.archive.entry(node.priority).or_default().push(node);
        self.configured = true;
        Ok(())
    }

    /// Select the next node for the current cycle.
    ///
    /// Picks from the lowest non-empty priority bucket; peers sharing that
    /// priority are load-balanced by uniform random choice. The consumed
    /// entry leaves the active set (the archive keeps it). Returns `None`
    /// once the cycle is exhausted; selecting from a pool that never had any
    /// nodes configured is a fatal configuration error.
    pub fn select_next(&mut self) -> Result<Option<BrokerNode>, ConfigError> {
        if !self.configured {
            return Err(ConfigError::NoNodesConfigured);
        }

        let priority = match self.active.iter().find(|(_, bucket)| !bucket.is_empty()) {
            Some((priority, _)) => *priority,
            None => {
                self.current = None;
                return Ok(None);
            }
        };

        let bucket = self.active.get_mut(&priority).expect("bucket exists");
        let index = if bucket.len() == 1 {
            0
        } else {
            rand::thread_rng().gen_range(0..bucket.len())
        };
        let node = bucket.swap_remove(index);
        if bucket.is_empty() {
            self.active.remove(&priority);
        }
        self.current = Some(node.clone());
        Ok(Some(node))
    }

    /// Demote the current node into the terminal last-resort bucket.
    ///
    /// The demotion is recorded in the archive, so it survives `reset` and
    /// future cycles try the node last. No-op when nothing was selected yet.
    pub fn demote_current(&mut self) {
        let Some(current) = self.current.clone() else {
            return;
        };
        let mut demoted = None;
        for (_, bucket) in self.archive.iter_mut() {
            if let Some(pos) = bucket.iter().position(|n| n.same_endpoint(&current)) {
                let mut node = bucket.remove(pos);
                node.priority = LAST_RESORT_PRIORITY;
                demoted = Some(node);
                break;
            }
        }
        if let Some(node) = demoted {
            tracing::debug!(endpoint = %node.endpoint(), "demoting broker node to last resort");
            self.archive.entry(LAST_RESORT_PRIORITY).or_default().push(node);
            self.archive.retain(|_, bucket| !bucket.is_empty());
        }
    }

    /// Restore the active set from the archive for a fresh cycle.
    ///
    /// Priority and demotion history are preserved; the current selection is
    /// cleared so the next `select_next` starts the cycle from the top.
    pub fn reset(&mut self) {
        self.active = self.archive.clone();
        self.current = None;
    }

    /// Any unconsumed node left in the current cycle
    pub fn has_more(&self) -> bool {
        self.active.values().any(|bucket| !bucket.is_empty())
    }

    /// Node most recently handed out by `select_next`
    pub fn current(&self) -> Option<&BrokerNode> {
        self.current.as_ref()
    }

    /// Total membership (archive), independent of cycle consumption
    pub fn len(&self) -> usize {
        self.archive.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn node_config(host: &str, priority: Option<u32>) -> BrokerNodeConfig {
        let mut config = BrokerNodeConfig::new(host, 5672)
            .with_credentials("guest", "guest")
            .with_exchange("events");
        config.priority = priority;
        config
    }

    fn pool_abcd() -> NodePool {
        NodePool::from_configs(vec![
            node_config("a", Some(1)),
            node_config("b", Some(3)),
            node_config("c", Some(3)),
            node_config("d", None),
        ])
        .expect("valid configs")
    }

    #[test]
    fn test_add_validates_required_fields() {
        let mut pool = NodePool::new();
        let mut missing_exchange = node_config("a", None);
        missing_exchange.exchange = String::new();
        assert!(matches!(
            pool.add(missing_exchange),
            Err(ConfigError::MissingField { field: "exchange" })
        ));

        let mut missing_credentials = node_config("a", None);
        missing_credentials.username = String::new();
        assert!(pool.add(missing_credentials).is_err());
    }

    #[test]
    fn test_select_on_unconfigured_pool_is_fatal() {
        let mut pool = NodePool::new();
        assert!(matches!(
            pool.select_next(),
            Err(ConfigError::NoNodesConfigured)
        ));
    }

    #[test]
    fn test_priority_order_with_default_bucket() {
        let mut pool = pool_abcd();

        let first = pool.select_next().unwrap().unwrap();
        assert_eq!(first.host, "a");

        let second = pool.select_next().unwrap().unwrap();
        let third = pool.select_next().unwrap().unwrap();
        let mut mid: Vec<String> = vec![second.host, third.host];
        mid.sort();
        assert_eq!(mid, vec!["b".to_string(), "c".to_string()]);

        let last = pool.select_next().unwrap().unwrap();
        assert_eq!(last.host, "d");
        assert_eq!(last.priority, DEFAULT_PRIORITY);

        assert!(pool.select_next().unwrap().is_none());
        assert!(!pool.has_more());
    }

    #[test]
    fn test_tie_break_is_randomized() {
        // Across 100 fresh cycles both peers must show up in the
        // priority-3 slot at least once.
        let mut saw_b = false;
        let mut saw_c = false;
        for _ in 0..100 {
            let mut pool = pool_abcd();
            pool.select_next().unwrap(); // a
            let second = pool.select_next().unwrap().unwrap();
            match second.host.as_str() {
                "b" => saw_b = true,
                "c" => saw_c = true,
                other => panic!("unexpected host in priority-3 slot: {}", other),
            }
            if saw_b && saw_c {
                break;
            }
        }
        assert!(saw_b && saw_c, "tie-break never alternated across 100 trials");
    }

    #[test]
    fn test_demotion_survives_reset() {
        let mut pool = pool_abcd();
        let first = pool.select_next().unwrap().unwrap();
        assert_eq!(first.host, "a");
        pool.demote_current();

        pool.reset();
        // a is now last resort: every other node comes out first
        let mut order = Vec::new();
        while let Some(node) = pool.select_next().unwrap() {
            order.push(node.host);
        }
        assert_eq!(order.len(), 4);
        assert_eq!(order.last().map(String::as_str), Some("a"));
    }

    #[test]
    fn test_reset_restores_cycle_membership() {
        let mut pool = pool_abcd();
        while pool.select_next().unwrap().is_some() {}
        assert!(!pool.has_more());

        pool.reset();
        assert!(pool.has_more());
        let mut hosts = Vec::new();
        while let Some(node) = pool.select_next().unwrap() {
            hosts.push(node.host);
        }
        hosts.sort();
        assert_eq!(hosts, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_demote_without_selection_is_noop() {
        let mut pool = pool_abcd();
        pool.demote_current();
        assert_eq!(pool.len(), 4);
        assert_eq!(pool.select_next().unwrap().unwrap().host, "a");
    }

    #[test]
    fn test_sole_remainder_is_still_selectable_after_demotion() {
        let mut pool = NodePool::from_configs(vec![node_config("only", None)]).unwrap();
        pool.select_next().unwrap();
        pool.demote_current();
        pool.reset();
        let node = pool.select_next().unwrap().unwrap();
        assert_eq!(node.host, "only");
        assert_eq!(node.priority, LAST_RESORT_PRIORITY);
    }
}
