//! # Driver Configuration
//!
//! Per-node pool, socket and routing settings plus the cluster-level node list.
//! Both types deserialize from any serde format; missing fields take the
//! defaults below, and durations are written as milliseconds.
//!
//! Loading from files is left to the caller.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LkvError, LkvResult};

/// Which waiter receives a connection handed over directly on checkin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffPolicy {
    /// Longest-waiting caller first.
    #[default]
    Fifo,
    /// Waiter at `slot index % waiters` in arrival order.
    SlotModulo,
}

/// Settings for one backend node and its pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Hostname or IP address.
    pub host: String,
    pub port: u16,
    /// Sent once per connection with `auth` before the first command.
    pub password: Option<String>,
    /// Connections opened eagerly at start and kept by maintenance.
    pub min_pool_size: usize,
    /// Hard cap on connections to this node.
    pub max_pool_size: usize,
    /// Connections opened at once when the pool runs dry.
    pub acquire_increment: usize,
    /// Callers allowed to wait for a connection at the same time.
    pub max_wait_size: usize,
    #[serde(with = "duration_ms")]
    pub get_client_timeout: Duration,
    /// Idle time after which a connection above `min_pool_size` is closed.
    #[serde(with = "duration_ms")]
    pub idle_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub health_check_interval: Duration,
    #[serde(with = "duration_ms")]
    pub read_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub write_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,
    /// Reopen and resend once after a transport failure.
    pub retry_enabled: bool,
    /// Relative share of the key space.
    pub weight: u32,
    /// Encode structured arguments as JSON instead of rejecting them.
    pub encoding: bool,
    pub handoff: HandoffPolicy,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            host: "127.0.0.1".to_string(),
            port: 8888,
            password: None,
            min_pool_size: 5,
            max_pool_size: 20,
            acquire_increment: 5,
            max_wait_size: 1000,
            get_client_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(120),
            health_check_interval: Duration::from_secs(30),
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(5),
            retry_enabled: false,
            weight: 1,
            encoding: false,
            handoff: HandoffPolicy::Fifo,
        }
    }
}

impl NodeConfig {
    /// Creates a default configuration for `host:port`.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        NodeConfig {
            host: host.into(),
            port,
            ..NodeConfig::default()
        }
    }

    /// Node identifier, `host:port`.
    pub fn id(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Checks size bounds and routing weight.
    pub fn validate(&self) -> LkvResult<()> {
        let id = self.id();
        if self.host.trim().is_empty() {
            return Err(LkvError::Config(format!("{id}: host is empty")));
        }
        if self.max_pool_size == 0 {
            return Err(LkvError::Config(format!("{id}: max_pool_size must be positive")));
        }
        if self.min_pool_size > self.max_pool_size {
            return Err(LkvError::Config(format!(
                "{id}: min_pool_size {} exceeds max_pool_size {}",
                self.min_pool_size, self.max_pool_size
            )));
        }
        if self.acquire_increment == 0 {
            return Err(LkvError::Config(format!("{id}: acquire_increment must be positive")));
        }
        if self.weight == 0 {
            return Err(LkvError::Config(format!("{id}: weight must be positive")));
        }
        Ok(())
    }
}

/// The full node set served by one `Connectors` registry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectorsConfig {
    pub nodes: Vec<NodeConfig>,
}

impl ConnectorsConfig {
    pub fn new(nodes: Vec<NodeConfig>) -> Self {
        ConnectorsConfig { nodes }
    }

    /// Rejects an empty node set, duplicate node ids, and invalid nodes.
    pub fn validate(&self) -> LkvResult<()> {
        if self.nodes.is_empty() {
            return Err(LkvError::Config("no nodes configured".to_string()));
        }
        let mut seen = HashSet::with_capacity(self.nodes.len());
        for node in &self.nodes {
            node.validate()?;
            if !seen.insert(node.id()) {
                return Err(LkvError::Config(format!("duplicate node {}", node.id())));
            }
        }
        Ok(())
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = NodeConfig::new("10.0.0.1", 8888);
        assert_eq!(config.id(), "10.0.0.1:8888");
        config.validate().unwrap();
    }

    #[test]
    fn rejects_inverted_bounds() {
        let config = NodeConfig {
            min_pool_size: 8,
            max_pool_size: 4,
            ..NodeConfig::default()
        };
        assert!(matches!(config.validate(), Err(LkvError::Config(_))));
    }

    #[test]
    fn rejects_zero_weight_and_increment() {
        let zero_weight = NodeConfig {
            weight: 0,
            ..NodeConfig::default()
        };
        assert!(zero_weight.validate().is_err());
        let zero_step = NodeConfig {
            acquire_increment: 0,
            ..NodeConfig::default()
        };
        assert!(zero_step.validate().is_err());
    }

    #[test]
    fn empty_and_duplicate_node_sets_fail() {
        assert!(matches!(
            ConnectorsConfig::default().validate(),
            Err(LkvError::Config(_))
        ));
        let node = NodeConfig::new("127.0.0.1", 9000);
        let config = ConnectorsConfig::new(vec![node.clone(), node]);
        assert!(matches!(config.validate(), Err(LkvError::Config(_))));
    }

    #[test]
    fn partial_json_fills_defaults() {
        let raw = r#"{
            "nodes": [
                {"host": "10.0.0.2", "port": 9001, "max_pool_size": 4, "min_pool_size": 2,
                 "get_client_timeout": 250, "handoff": "slot_modulo"}
            ]
        }"#;
        let config: ConnectorsConfig = serde_json::from_str(raw).unwrap();
        config.validate().unwrap();
        let node = &config.nodes[0];
        assert_eq!(node.id(), "10.0.0.2:9001");
        assert_eq!(node.get_client_timeout, Duration::from_millis(250));
        assert_eq!(node.handoff, HandoffPolicy::SlotModulo);
        assert_eq!(node.idle_timeout, Duration::from_secs(120));
        assert_eq!(node.weight, 1);
    }
}
