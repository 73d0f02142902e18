//! Configuration loading for the testbed harness.
//!
//! Loads cluster definitions from cluster.toml and sampling settings from
//! sampling.toml.

use crate::types::{NodeConfig, NodeId};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default config directory name.
const CONFIG_DIR_NAME: &str = "sth";

/// Default cluster config file name.
const CLUSTER_FILE_NAME: &str = "cluster.toml";

/// Default sampling config file name.
const SAMPLING_FILE_NAME: &str = "sampling.toml";

/// Cluster configuration file structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// List of node definitions.
    #[serde(default)]
    pub nodes: Vec<NodeEntry>,
}

/// Single node entry in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeEntry {
    /// Unique identifier for this node.
    pub id: String,

    /// SSH hostname or IP address.
    pub host: String,

    /// SSH username.
    #[serde(default = "default_user")]
    pub user: String,

    /// Path to SSH private key.
    #[serde(default = "default_identity_file")]
    pub identity_file: String,

    /// Network interfaces to sample on this node.
    #[serde(default)]
    pub interfaces: Vec<String>,

    /// Whether this node is included in sampling.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl From<NodeEntry> for NodeConfig {
    fn from(entry: NodeEntry) -> Self {
        NodeConfig {
            id: NodeId::new(entry.id),
            host: entry.host,
            user: entry.user,
            identity_file: entry.identity_file,
            interfaces: entry.interfaces,
        }
    }
}

/// Policy applied when a tick's aggregation still fails after retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PartialTickPolicy {
    /// Skip the tick: log it, count it, and do not consume a sample id.
    #[default]
    Skip,
    /// Abort the run with the aggregation error.
    Abort,
}

/// Sampling loop configuration.
///
/// The liveness poll interval is deliberately separate from the sampling
/// period so liveness checks and sampling cadence can evolve independently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// Sampling period in milliseconds.
    #[serde(default = "default_period_ms")]
    pub period_ms: u64,

    /// Interval between workload liveness polls in milliseconds.
    #[serde(default = "default_liveness_interval_ms")]
    pub liveness_interval_ms: u64,

    /// Timeout for one per-node counter read in milliseconds.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Retry a failed per-node read once within the same tick.
    #[serde(default = "default_true")]
    pub retry_node_once: bool,

    /// Number of whole-tick retries after a partial cluster read.
    #[serde(default = "default_tick_retries")]
    pub tick_retries: u32,

    /// Backoff between whole-tick retries in milliseconds.
    #[serde(default = "default_tick_retry_backoff_ms")]
    pub tick_retry_backoff_ms: u64,

    /// What to do when a tick still fails after retries.
    #[serde(default)]
    pub on_exhausted: PartialTickPolicy,

    /// Path of the append-only results file.
    #[serde(default = "default_results_path")]
    pub results_path: PathBuf,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            period_ms: default_period_ms(),
            liveness_interval_ms: default_liveness_interval_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            retry_node_once: true,
            tick_retries: default_tick_retries(),
            tick_retry_backoff_ms: default_tick_retry_backoff_ms(),
            on_exhausted: PartialTickPolicy::default(),
            results_path: default_results_path(),
        }
    }
}

impl SamplingConfig {
    /// Reject settings the sampling loop cannot run with.
    ///
    /// Zero intervals would panic inside the interval timer; catch them at
    /// the config boundary instead.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.period_ms > 0, "period_ms must be non-zero");
        anyhow::ensure!(
            self.liveness_interval_ms > 0,
            "liveness_interval_ms must be non-zero"
        );
        anyhow::ensure!(self.read_timeout_ms > 0, "read_timeout_ms must be non-zero");
        Ok(())
    }

    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_interval_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn tick_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.tick_retry_backoff_ms)
    }
}

// Default value functions
fn default_period_ms() -> u64 {
    100
}

fn default_liveness_interval_ms() -> u64 {
    100
}

fn default_read_timeout_ms() -> u64 {
    2_000
}

fn default_tick_retries() -> u32 {
    1
}

fn default_tick_retry_backoff_ms() -> u64 {
    25
}

fn default_results_path() -> PathBuf {
    PathBuf::from("results.csv")
}

fn default_true() -> bool {
    true
}

fn default_user() -> String {
    "root".to_string()
}

fn default_identity_file() -> String {
    "~/.ssh/id_rsa".to_string()
}

/// Get the configuration directory path.
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("com", "sth", CONFIG_DIR_NAME)
        .map(|dirs| dirs.config_dir().to_path_buf())
}

/// Load the cluster configuration from file.
pub fn load_cluster_config(path: Option<&Path>) -> Result<ClusterConfig> {
    let config_path = match path {
        Some(p) => p.to_path_buf(),
        None => {
            let dir = config_dir().context("Could not determine config directory")?;
            dir.join(CLUSTER_FILE_NAME)
        }
    };

    if !config_path.exists() {
        warn!("Cluster config not found at {:?}", config_path);
        return Ok(ClusterConfig::default());
    }

    info!("Loading cluster config from {:?}", config_path);
    let contents = std::fs::read_to_string(&config_path)
        .with_context(|| format!("Failed to read cluster config from {:?}", config_path))?;

    let config: ClusterConfig = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse cluster config from {:?}", config_path))?;

    info!("Loaded {} node definitions", config.nodes.len());
    Ok(config)
}

/// Load enabled nodes as NodeConfig instances.
pub fn load_nodes(path: Option<&Path>) -> Result<Vec<NodeConfig>> {
    let config = load_cluster_config(path)?;

    let nodes: Vec<NodeConfig> = config
        .nodes
        .into_iter()
        .filter(|n| n.enabled)
        .map(NodeConfig::from)
        .collect();

    debug!("Loaded {} enabled nodes", nodes.len());
    Ok(nodes)
}

/// Load sampling configuration from file.
pub fn load_sampling_config(path: Option<&Path>) -> Result<SamplingConfig> {
    let config_path = match path {
        Some(p) => p.to_path_buf(),
        None => {
            let dir = config_dir().context("Could not determine config directory")?;
            dir.join(SAMPLING_FILE_NAME)
        }
    };

    if !config_path.exists() {
        debug!(
            "Sampling config not found at {:?}, using defaults",
            config_path
        );
        return Ok(SamplingConfig::default());
    }

    info!("Loading sampling config from {:?}", config_path);
    let contents = std::fs::read_to_string(&config_path)
        .with_context(|| format!("Failed to read sampling config from {:?}", config_path))?;

    let config: SamplingConfig = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse sampling config from {:?}", config_path))?;

    config
        .validate()
        .with_context(|| format!("Invalid sampling config in {:?}", config_path))?;

    Ok(config)
}

/// Generate an example cluster.toml configuration.
pub fn example_cluster_config() -> String {
    r#"# STH Cluster Configuration
# Place this file at ~/.config/sth/cluster.toml

[[nodes]]
id = "r1"
host = "10.0.0.11"
user = "root"
identity_file = "~/.ssh/id_rsa"
interfaces = ["r1-eth0", "r1-eth1"]
enabled = true

[[nodes]]
id = "r2"
host = "10.0.0.12"
user = "root"
identity_file = "~/.ssh/id_rsa"
interfaces = ["r2-eth0"]
enabled = true

# Disabled node example
[[nodes]]
id = "spare"
host = "10.0.0.20"
user = "root"
identity_file = "~/.ssh/id_rsa"
interfaces = ["eth0"]
enabled = false
"#
    .to_string()
}

/// Generate an example sampling.toml configuration.
pub fn example_sampling_config() -> String {
    r#"# STH Sampling Configuration
# Place this file at ~/.config/sth/sampling.toml

# Sampling period in milliseconds
period_ms = 100

# Interval between workload liveness polls (milliseconds)
liveness_interval_ms = 100

# Timeout for one per-node counter read (milliseconds)
read_timeout_ms = 2000

# Retry a failed per-node read once within the same tick
retry_node_once = true

# Whole-tick retries after a partial cluster read
tick_retries = 1
tick_retry_backoff_ms = 25

# Policy when a tick still fails after retries: skip or abort
on_exhausted = "skip"

# Append-only results file
results_path = "results.csv"
"#
    .to_string()
}
