//! Storage Testbed Harness - Common Library
//!
//! Shared types, configuration, logging, and SSH transport used by the
//! harness components.

#![forbid(unsafe_code)]

pub mod config;
pub mod logging;
pub mod ssh;
pub mod types;

pub use config::{
    example_cluster_config, example_sampling_config, load_cluster_config, load_nodes,
    load_sampling_config, ClusterConfig, NodeEntry, PartialTickPolicy, SamplingConfig,
};
pub use logging::{init_logging, LogConfig, LogFormat, LoggingGuards};
pub use ssh::{
    is_retryable_transport_error_text, CommandResult, KnownHostsPolicy, SshClient, SshError,
    SshOptions, SshPool,
};
pub use types::{NodeConfig, NodeId};
