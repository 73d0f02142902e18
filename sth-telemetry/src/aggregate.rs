//! Parallel cluster-wide counter aggregation.
//!
//! One aggregation round fans a counter read out to every node concurrently,
//! waits for all of them (a full barrier, no partial progress), and sums the
//! per-node counters field-wise into a [`ClusterSample`]. Node order never
//! affects the result.

use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, warn};

use sth_common::types::{NodeConfig, NodeId};

use crate::counters::{AcquisitionError, InterfaceCounters, NodeSample};
use crate::source::CounterSource;

/// Cluster-wide counter totals at one instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterSample {
    /// Field-wise sum over all nodes.
    pub total: InterfaceCounters,
    /// The per-node samples the total was built from.
    pub nodes: Vec<NodeSample>,
}

impl ClusterSample {
    /// Number of nodes that contributed to this sample.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

/// Failure of an aggregation round.
#[derive(Debug, thiserror::Error)]
pub enum ClusterReadError {
    /// One or more nodes failed while the rest succeeded. The whole round is
    /// discarded so the recorded series never mixes in fabricated zeros.
    #[error("partial cluster read: {} of {total} nodes failed ({})", .failed.len(), failed_node_list(.failed))]
    Partial {
        total: usize,
        failed: Vec<(NodeId, AcquisitionError)>,
    },
}

fn failed_node_list(failed: &[(NodeId, AcquisitionError)]) -> String {
    failed
        .iter()
        .map(|(id, _)| id.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Reads all cluster nodes in parallel and sums their counters.
pub struct ClusterAggregator<S> {
    source: S,
    nodes: Vec<NodeConfig>,
    /// Retry a failed per-node read once within the same round when the
    /// failure looks transient.
    retry_node_once: bool,
    retry_backoff: Duration,
}

impl<S: CounterSource> ClusterAggregator<S> {
    pub fn new(source: S, nodes: Vec<NodeConfig>) -> Self {
        Self {
            source,
            nodes,
            retry_node_once: true,
            retry_backoff: Duration::from_millis(25),
        }
    }

    pub fn with_node_retry(mut self, retry: bool, backoff: Duration) -> Self {
        self.retry_node_once = retry;
        self.retry_backoff = backoff;
        self
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Run one aggregation round.
    ///
    /// Waits for every node before returning. If any node fails (after its
    /// optional in-round retry) the round fails as a whole, naming each
    /// failed node.
    pub async fn sample_cluster(&self) -> Result<ClusterSample, ClusterReadError> {
        let reads = self.nodes.iter().map(|node| self.read_with_retry(node));
        let results = join_all(reads).await;

        let total_nodes = self.nodes.len();
        let mut samples = Vec::with_capacity(total_nodes);
        let mut failed = Vec::new();

        for result in results {
            match result {
                Ok(sample) => samples.push(sample),
                Err(err) => {
                    warn!(node = %err.node(), error = %err, "node counter read failed");
                    failed.push((err.node().clone(), err));
                }
            }
        }

        if !failed.is_empty() {
            return Err(ClusterReadError::Partial {
                total: total_nodes,
                failed,
            });
        }

        let mut total = InterfaceCounters::zero();
        for sample in &samples {
            total.accumulate(&sample.counters);
        }

        debug!(nodes = total_nodes, ?total, "cluster sample aggregated");
        Ok(ClusterSample {
            total,
            nodes: samples,
        })
    }

    async fn read_with_retry(&self, node: &NodeConfig) -> Result<NodeSample, AcquisitionError> {
        match self.source.read_node(node).await {
            Ok(sample) => Ok(sample),
            Err(first) if self.retry_node_once && is_retryable(&first) => {
                debug!(node = %node.id, error = %first, "retrying node read once");
                tokio::time::sleep(self.retry_backoff).await;
                self.source.read_node(node).await
            }
            Err(err) => Err(err),
        }
    }
}

/// Transient failures worth one in-round retry. Parse and validation errors
/// are deterministic and retrying them only delays the tick.
fn is_retryable(err: &AcquisitionError) -> bool {
    match err {
        AcquisitionError::Timeout { .. } | AcquisitionError::CommandFailed { .. } => true,
        AcquisitionError::Unreachable { message, .. } => {
            sth_common::ssh::is_retryable_transport_error_text(message)
        }
        AcquisitionError::InvalidInterface { .. }
        | AcquisitionError::ShortOutput { .. }
        | AcquisitionError::Malformed { .. } => false,
    }
}
