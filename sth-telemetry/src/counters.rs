//! Raw network counter types and parsing.
//!
//! A counter read asks one node for the four cumulative interface counters
//! (received/transmitted packets and bytes) of every interface it owns, in a
//! single batched remote command. The reply is one decimal integer per line,
//! four lines per interface, in interface order.

use serde::{Deserialize, Serialize};
use sth_common::NodeId;
use std::time::Duration;
use thiserror::Error;

/// Counter fields read per interface, in wire order.
pub const COUNTERS_PER_INTERFACE: usize = 4;

/// Statistic names in wire order, as exposed under
/// `/sys/class/net/<iface>/statistics/`.
pub const COUNTER_STAT_NAMES: [&str; COUNTERS_PER_INTERFACE] =
    ["rx_packets", "tx_packets", "rx_bytes", "tx_bytes"];

/// Errors that can occur while acquiring counters from one node.
#[derive(Error, Debug)]
pub enum AcquisitionError {
    #[error("node {node} unreachable: {message}")]
    Unreachable { node: NodeId, message: String },

    #[error("counter command failed on {node} (exit={exit_code}): {stderr}")]
    CommandFailed {
        node: NodeId,
        exit_code: i32,
        stderr: String,
    },

    #[error("counter read timed out on {node} after {after:?}")]
    Timeout { node: NodeId, after: Duration },

    #[error("invalid interface name '{name}' on {node}")]
    InvalidInterface { node: NodeId, name: String },

    #[error("short counter output from {node}: expected {expected} lines, got {actual}")]
    ShortOutput {
        node: NodeId,
        expected: usize,
        actual: usize,
    },

    #[error("malformed counter value from {node}: '{line}'")]
    Malformed { node: NodeId, line: String },
}

impl AcquisitionError {
    /// The node the acquisition failed on.
    pub fn node(&self) -> &NodeId {
        match self {
            Self::Unreachable { node, .. }
            | Self::CommandFailed { node, .. }
            | Self::Timeout { node, .. }
            | Self::InvalidInterface { node, .. }
            | Self::ShortOutput { node, .. }
            | Self::Malformed { node, .. } => node,
        }
    }
}

/// Four cumulative network counters at one instant.
///
/// Counters are cumulative for the lifetime of the underlying interface and
/// monotonically non-decreasing barring device reset. All arithmetic is u64
/// and saturating: an experiment never legitimately approaches the limit, and
/// truncation must not happen silently.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceCounters {
    /// Packets received.
    pub rx_packets: u64,
    /// Packets transmitted.
    pub tx_packets: u64,
    /// Bytes received.
    pub rx_bytes: u64,
    /// Bytes transmitted.
    pub tx_bytes: u64,
}

impl InterfaceCounters {
    pub fn new(rx_packets: u64, tx_packets: u64, rx_bytes: u64, tx_bytes: u64) -> Self {
        Self {
            rx_packets,
            tx_packets,
            rx_bytes,
            tx_bytes,
        }
    }

    /// The all-zero counter tuple.
    pub fn zero() -> Self {
        Self::default()
    }

    /// Field-wise accumulate another tuple into this one.
    pub fn accumulate(&mut self, other: &InterfaceCounters) {
        self.rx_packets = self.rx_packets.saturating_add(other.rx_packets);
        self.tx_packets = self.tx_packets.saturating_add(other.tx_packets);
        self.rx_bytes = self.rx_bytes.saturating_add(other.rx_bytes);
        self.tx_bytes = self.tx_bytes.saturating_add(other.tx_bytes);
    }

    /// Field-wise non-decrease check against an earlier reading.
    pub fn is_monotonic_from(&self, earlier: &InterfaceCounters) -> bool {
        self.rx_packets >= earlier.rx_packets
            && self.tx_packets >= earlier.tx_packets
            && self.rx_bytes >= earlier.rx_bytes
            && self.tx_bytes >= earlier.tx_bytes
    }
}

/// Sum of a node's interface counters at one instant.
///
/// Produced fresh on every sampling tick and discarded after aggregation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSample {
    /// The node this sample was read from.
    pub node: NodeId,
    /// Counters summed over the node's interfaces.
    pub counters: InterfaceCounters,
}

impl NodeSample {
    pub fn new(node: NodeId, counters: InterfaceCounters) -> Self {
        Self { node, counters }
    }

    /// An all-zero sample, produced for nodes with no interfaces.
    pub fn empty(node: NodeId) -> Self {
        Self::new(node, InterfaceCounters::zero())
    }
}

/// Parse the batched counter command output for a node.
///
/// Expects exactly `COUNTERS_PER_INTERFACE` non-empty lines per interface in
/// wire order. Short or malformed output is an error, never a silent
/// zero-fill, so a corrupted sample stays detectable downstream.
pub fn parse_counter_output(
    node: &NodeId,
    interfaces: &[String],
    output: &str,
) -> Result<InterfaceCounters, AcquisitionError> {
    let lines: Vec<&str> = output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();

    let expected = interfaces.len() * COUNTERS_PER_INTERFACE;
    if lines.len() != expected {
        return Err(AcquisitionError::ShortOutput {
            node: node.clone(),
            expected,
            actual: lines.len(),
        });
    }

    let mut total = InterfaceCounters::zero();
    for (i, _iface) in interfaces.iter().enumerate() {
        let base = i * COUNTERS_PER_INTERFACE;
        let parse = |line: &str| -> Result<u64, AcquisitionError> {
            line.parse::<u64>().map_err(|_| AcquisitionError::Malformed {
                node: node.clone(),
                line: line.to_string(),
            })
        };

        total.accumulate(&InterfaceCounters::new(
            parse(lines[base])?,
            parse(lines[base + 1])?,
            parse(lines[base + 2])?,
            parse(lines[base + 3])?,
        ));
    }

    Ok(total)
}

/// Check that an interface name is safe to interpolate into a shell command.
///
/// Linux interface names are short and limited in practice to alphanumerics
/// plus `.`, `-`, `_`, `@`; anything else is rejected before it reaches a
/// remote shell.
pub fn is_valid_interface_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 16
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '@'))
}
