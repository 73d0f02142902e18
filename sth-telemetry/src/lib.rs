//! Telemetry collection for the storage testbed harness.
//!
//! Samples cumulative network counters across a cluster of testbed nodes
//! while an experiment workload runs, and records the cluster-wide totals in
//! an append-only results file. The sampling loop is driven by workload
//! liveness: it starts with a baseline sample, ticks at a fixed period, and
//! drains one final sample when the workload exits.
//!
//! Modules:
//! - [`counters`]: counter types and remote-output parsing
//! - [`source`]: the [`source::CounterSource`] seam and its SSH backend
//! - [`aggregate`]: parallel cluster-wide aggregation
//! - [`recorder`]: durable append-only sample recording
//! - [`lifecycle`]: workload process liveness probes
//! - [`sampler`]: the liveness-driven sampling loop
//! - [`mock`]: scripted test doubles

#![forbid(unsafe_code)]

pub mod aggregate;
pub mod counters;
pub mod lifecycle;
pub mod mock;
pub mod recorder;
pub mod sampler;
pub mod source;

pub use aggregate::{ClusterAggregator, ClusterReadError, ClusterSample};
pub use counters::{AcquisitionError, InterfaceCounters, NodeSample};
pub use lifecycle::{MonitoredProcessSet, PidProbe, ProcessProbe};
pub use recorder::{read_samples, RecordingError, SampleRecorder, SampleRow};
pub use sampler::{
    start_sampling, ExperimentRun, RunSummary, Sampler, SamplerError, SamplerState, StopHandle,
    StopReason,
};
pub use source::{CounterSource, SshCounterSource};
