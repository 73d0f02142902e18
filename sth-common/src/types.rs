//! Common types used across STH components.

use serde::{Deserialize, Serialize};

/// Unique identifier for a node in the monitored cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Configuration for one cluster node.
///
/// A node is identified by its id and carries the SSH coordinates used for
/// remote counter reads plus the ordered list of network interfaces whose
/// counters are summed into its samples. The interface list is discovered
/// once during provisioning and treated as immutable for the duration of an
/// experiment; the sampling core never rediscovers interfaces per read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique identifier for this node.
    pub id: NodeId,
    /// SSH hostname or IP address.
    pub host: String,
    /// SSH username.
    pub user: String,
    /// Path to SSH private key.
    pub identity_file: String,
    /// Ordered list of network interface names to sample on this node.
    #[serde(default)]
    pub interfaces: Vec<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: NodeId::new("node0"),
            host: "localhost".to_string(),
            user: "root".to_string(),
            identity_file: "~/.ssh/id_rsa".to_string(),
            interfaces: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_display() {
        let id = NodeId::new("r3");
        assert_eq!(id.as_str(), "r3");
        assert_eq!(format!("{}", id), "r3");
    }

    #[test]
    fn test_node_config_default_has_no_interfaces() {
        let node = NodeConfig::default();
        assert!(node.interfaces.is_empty());
        assert_eq!(node.id.as_str(), "node0");
    }
}
