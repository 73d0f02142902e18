//! Scripted test doubles for counter acquisition and process liveness.
//!
//! Used by unit and integration tests to drive the sampling machinery without
//! SSH sessions or real processes.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use sth_common::types::NodeConfig;

use crate::counters::{AcquisitionError, InterfaceCounters, NodeSample};
use crate::lifecycle::ProcessProbe;
use crate::source::CounterSource;

#[derive(Debug, Clone, Default)]
struct NodeScript {
    /// Counter values returned on successive reads; reads past the end repeat
    /// the last entry.
    sequence: Vec<InterfaceCounters>,
    /// Fail this many reads before serving the sequence. `usize::MAX` means
    /// fail forever.
    failures_remaining: usize,
    failure_message: String,
    /// Fail with a parse error instead of a transport error.
    fail_malformed: bool,
    reads: usize,
}

/// Counter source whose per-node behavior is scripted by the test.
#[derive(Clone, Default)]
pub struct MockCounterSource {
    scripts: Arc<Mutex<HashMap<String, NodeScript>>>,
}

impl MockCounterSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every read of `node` returns `counters`.
    pub fn set_counters(&self, node: &str, counters: InterfaceCounters) {
        self.set_sequence(node, vec![counters]);
    }

    /// Successive reads of `node` walk `sequence`; reads past the end repeat
    /// the final entry.
    pub fn set_sequence(&self, node: &str, sequence: Vec<InterfaceCounters>) {
        let mut scripts = self.scripts.lock().unwrap();
        let script = scripts.entry(node.to_string()).or_default();
        script.sequence = sequence;
    }

    /// Every read of `node` fails with a transport error.
    pub fn fail_node(&self, node: &str, message: &str) {
        self.fail_node_times(node, message, usize::MAX);
    }

    /// The next `times` reads of `node` fail with a transport error, then the
    /// scripted sequence resumes.
    pub fn fail_node_times(&self, node: &str, message: &str, times: usize) {
        let mut scripts = self.scripts.lock().unwrap();
        let script = scripts.entry(node.to_string()).or_default();
        script.failures_remaining = times;
        script.failure_message = message.to_string();
    }

    /// Every read of `node` fails as malformed output.
    pub fn fail_node_malformed(&self, node: &str) {
        let mut scripts = self.scripts.lock().unwrap();
        let script = scripts.entry(node.to_string()).or_default();
        script.failures_remaining = usize::MAX;
        script.fail_malformed = true;
    }

    /// How many reads have been issued against `node`.
    pub fn read_count(&self, node: &str) -> usize {
        self.scripts
            .lock()
            .unwrap()
            .get(node)
            .map(|s| s.reads)
            .unwrap_or(0)
    }

    fn next(&self, node: &NodeConfig) -> Result<NodeSample, AcquisitionError> {
        let mut scripts = self.scripts.lock().unwrap();
        let script = scripts.entry(node.id.as_str().to_string()).or_default();
        script.reads += 1;

        if script.failures_remaining > 0 {
            if script.failures_remaining != usize::MAX {
                script.failures_remaining -= 1;
            }
            if script.fail_malformed {
                return Err(AcquisitionError::Malformed {
                    node: node.id.clone(),
                    line: "garbage".to_string(),
                });
            }
            return Err(AcquisitionError::Unreachable {
                node: node.id.clone(),
                message: script.failure_message.clone(),
            });
        }

        let index = (script.reads - 1).min(script.sequence.len().saturating_sub(1));
        let counters = script
            .sequence
            .get(index)
            .copied()
            .unwrap_or_else(InterfaceCounters::zero);
        Ok(NodeSample::new(node.id.clone(), counters))
    }
}

impl CounterSource for MockCounterSource {
    fn read_node(
        &self,
        node: &NodeConfig,
    ) -> impl Future<Output = Result<NodeSample, AcquisitionError>> + Send {
        let result = self.next(node);
        async move { result }
    }
}

/// Probe that reports the workload alive for a fixed number of polls, then
/// exited.
#[derive(Clone)]
pub struct CountdownProbe {
    remaining: Arc<Mutex<usize>>,
}

impl CountdownProbe {
    /// Alive for the first `polls` liveness checks.
    pub fn alive_for(polls: usize) -> Self {
        Self {
            remaining: Arc::new(Mutex::new(polls)),
        }
    }

    /// Already exited.
    pub fn exited() -> Self {
        Self::alive_for(0)
    }
}

impl ProcessProbe for CountdownProbe {
    fn is_running(&self) -> bool {
        let mut remaining = self.remaining.lock().unwrap();
        if *remaining > 0 {
            *remaining -= 1;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sth_common::types::NodeId;

    fn node(id: &str) -> NodeConfig {
        NodeConfig {
            id: NodeId::new(id),
            ..NodeConfig::default()
        }
    }

    #[tokio::test]
    async fn test_sequence_repeats_final_entry() {
        let source = MockCounterSource::new();
        source.set_sequence(
            "r1",
            vec![
                InterfaceCounters::new(1, 1, 1, 1),
                InterfaceCounters::new(2, 2, 2, 2),
            ],
        );

        let n = node("r1");
        assert_eq!(source.read_node(&n).await.unwrap().counters.rx_packets, 1);
        assert_eq!(source.read_node(&n).await.unwrap().counters.rx_packets, 2);
        assert_eq!(source.read_node(&n).await.unwrap().counters.rx_packets, 2);
        assert_eq!(source.read_count("r1"), 3);
    }

    #[tokio::test]
    async fn test_failures_then_recovery() {
        let source = MockCounterSource::new();
        source.set_counters("r1", InterfaceCounters::new(7, 7, 7, 7));
        source.fail_node_times("r1", "broken pipe", 2);

        let n = node("r1");
        assert!(source.read_node(&n).await.is_err());
        assert!(source.read_node(&n).await.is_err());
        assert!(source.read_node(&n).await.is_ok());
    }

    #[test]
    fn test_countdown_probe() {
        let probe = CountdownProbe::alive_for(2);
        assert!(probe.is_running());
        assert!(probe.is_running());
        assert!(!probe.is_running());
        assert!(!probe.is_running());

        assert!(!CountdownProbe::exited().is_running());
    }
}
