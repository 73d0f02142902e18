//! Counter acquisition backends.
//!
//! [`CounterSource`] is the seam between the sampling machinery and how
//! counters are actually fetched. Production uses [`SshCounterSource`], which
//! batches all of a node's counter files into one remote command; tests swap
//! in a scripted source.

use std::fmt::Write as _;
use std::future::Future;
use std::sync::Arc;

use tracing::{debug, warn};

use sth_common::ssh::{SshError, SshPool};
use sth_common::types::NodeConfig;

use crate::counters::{
    is_valid_interface_name, parse_counter_output, AcquisitionError, NodeSample,
    COUNTER_STAT_NAMES,
};

/// Reads the current counters of a single node.
///
/// Implementations must be usable concurrently: the aggregator issues one
/// `read_node` per cluster node in parallel on every tick.
pub trait CounterSource: Send + Sync {
    fn read_node(
        &self,
        node: &NodeConfig,
    ) -> impl Future<Output = Result<NodeSample, AcquisitionError>> + Send;
}

/// Counter source backed by pooled SSH sessions.
///
/// Sessions are established lazily on first read and reused across ticks via
/// the shared [`SshPool`]. A failed read does not evict the session; transport
/// errors surface as [`AcquisitionError::Unreachable`] and the next tick
/// retries through the same pool entry.
#[derive(Clone)]
pub struct SshCounterSource {
    pool: Arc<SshPool>,
}

impl SshCounterSource {
    pub fn new(pool: Arc<SshPool>) -> Self {
        Self { pool }
    }

    /// Build the batched read command for one node.
    ///
    /// One `cat` per counter file, in interface order then wire order, so the
    /// reply parses positionally.
    fn build_command(node: &NodeConfig) -> Result<String, AcquisitionError> {
        let mut cmd = String::new();
        for iface in &node.interfaces {
            if !is_valid_interface_name(iface) {
                return Err(AcquisitionError::InvalidInterface {
                    node: node.id.clone(),
                    name: iface.clone(),
                });
            }
            for stat in COUNTER_STAT_NAMES {
                let _ = write!(cmd, "cat /sys/class/net/{iface}/statistics/{stat}; ");
            }
        }
        Ok(cmd)
    }
}

impl CounterSource for SshCounterSource {
    fn read_node(
        &self,
        node: &NodeConfig,
    ) -> impl Future<Output = Result<NodeSample, AcquisitionError>> + Send {
        let pool = Arc::clone(&self.pool);
        let node = node.clone();
        async move {
            // A node with no interfaces contributes zeros without a round trip.
            if node.interfaces.is_empty() {
                debug!(node = %node.id, "no interfaces configured, returning zero sample");
                return Ok(NodeSample::empty(node.id));
            }

            let command = Self::build_command(&node)?;

            let client = pool
                .get_or_connect(&node)
                .await
                .map_err(|e| map_ssh_error(&node, e))?;

            let result = {
                let guard = client.read().await;
                guard
                    .execute(&command)
                    .await
                    .map_err(|e| map_ssh_error(&node, e))?
            };

            if result.exit_code != 0 {
                warn!(
                    node = %node.id,
                    exit_code = result.exit_code,
                    stderr = %result.stderr.trim(),
                    "counter command failed"
                );
                return Err(AcquisitionError::CommandFailed {
                    node: node.id,
                    exit_code: result.exit_code,
                    stderr: result.stderr.trim().to_string(),
                });
            }

            let counters = parse_counter_output(&node.id, &node.interfaces, &result.stdout)?;
            debug!(node = %node.id, ?counters, duration_ms = result.duration_ms, "node counters read");
            Ok(NodeSample::new(node.id, counters))
        }
    }
}

fn map_ssh_error(node: &NodeConfig, err: SshError) -> AcquisitionError {
    match err {
        SshError::Timeout { after, .. } => AcquisitionError::Timeout {
            node: node.id.clone(),
            after,
        },
        other => AcquisitionError::Unreachable {
            node: node.id.clone(),
            message: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sth_common::types::NodeId;

    fn node_with(interfaces: &[&str]) -> NodeConfig {
        NodeConfig {
            id: NodeId::new("r1"),
            host: "10.0.0.1".to_string(),
            user: "root".to_string(),
            identity_file: "~/.ssh/id_rsa".to_string(),
            interfaces: interfaces.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_build_command_orders_stats() {
        let cmd = SshCounterSource::build_command(&node_with(&["eth0"])).unwrap();
        assert_eq!(
            cmd,
            "cat /sys/class/net/eth0/statistics/rx_packets; \
             cat /sys/class/net/eth0/statistics/tx_packets; \
             cat /sys/class/net/eth0/statistics/rx_bytes; \
             cat /sys/class/net/eth0/statistics/tx_bytes; "
        );
    }

    #[test]
    fn test_build_command_interface_order() {
        let cmd = SshCounterSource::build_command(&node_with(&["eth1", "eth0"])).unwrap();
        let eth1 = cmd.find("eth1").unwrap();
        let eth0 = cmd.find("eth0").unwrap();
        assert!(eth1 < eth0, "interfaces must appear in configured order");
    }

    #[test]
    fn test_build_command_rejects_hostile_name() {
        let err = SshCounterSource::build_command(&node_with(&["eth0; reboot"])).unwrap_err();
        assert!(matches!(err, AcquisitionError::InvalidInterface { .. }));
    }
}
