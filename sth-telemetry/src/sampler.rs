//! Liveness-driven sampling loop.
//!
//! The sampler takes an initial cluster sample, then samples once per period
//! on an interval timer while the monitored workload is alive. Liveness is
//! polled on its own interval. When every monitored process has exited (or an
//! external stop arrives) the sampler drains one final sample and stops.
//!
//! Only one tick is ever in flight: aggregation and recording finish before
//! the next tick starts, so recorded samples are strictly ordered.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use sth_common::config::{PartialTickPolicy, SamplingConfig};
use sth_common::types::NodeConfig;

use crate::aggregate::{ClusterAggregator, ClusterReadError};
use crate::lifecycle::MonitoredProcessSet;
use crate::recorder::{RecordingError, SampleRecorder};
use crate::source::CounterSource;

/// Sampler lifecycle states. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerState {
    Idle,
    Sampling,
    Draining,
    Stopped,
}

/// Why a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Every monitored process exited.
    WorkloadExited,
    /// External stop via [`StopHandle`].
    Cancelled,
}

/// Errors that end a run early.
#[derive(Error, Debug)]
pub enum SamplerError {
    #[error("invalid sampling config: {message}")]
    InvalidConfig { message: String },

    /// Recording failures are fatal: a run whose log cannot grow has no
    /// reason to keep sampling.
    #[error("recording failed: {0}")]
    Recording(#[from] RecordingError),

    #[error("sampling aborted at tick {tick}: {source}")]
    Aborted {
        tick: u64,
        #[source]
        source: ClusterReadError,
    },

    #[error("sampler task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Requests a graceful stop of a running sampler.
///
/// Stopping is equivalent to observing all monitored processes exited: the
/// sampler drains one final sample and transitions to `Stopped`.
#[derive(Clone)]
pub struct StopHandle {
    tx: std::sync::Arc<watch::Sender<bool>>,
}

impl StopHandle {
    pub fn stop(&self) {
        // Receiver side may already be gone if the run finished; nothing to do.
        let _ = self.tx.send(true);
    }
}

/// What a finished run produced.
#[derive(Debug)]
pub struct RunSummary {
    pub samples_recorded: u64,
    pub ticks_skipped: u64,
    pub stop_reason: StopReason,
    pub results_path: PathBuf,
}

/// The sampling loop over one experiment run.
pub struct Sampler<S> {
    aggregator: ClusterAggregator<S>,
    recorder: SampleRecorder,
    processes: MonitoredProcessSet,
    config: SamplingConfig,
    state: watch::Sender<SamplerState>,
    stop_rx: watch::Receiver<bool>,
    // Keeps the stop channel open even if every StopHandle is dropped, so
    // the stop branch of the loop pends instead of erroring hot.
    _stop_tx: std::sync::Arc<watch::Sender<bool>>,
    samples_recorded: u64,
    ticks_skipped: u64,
}

impl<S: CounterSource> Sampler<S> {
    pub fn new(
        aggregator: ClusterAggregator<S>,
        recorder: SampleRecorder,
        processes: MonitoredProcessSet,
        config: SamplingConfig,
    ) -> (Self, StopHandle) {
        let (tx, stop_rx) = watch::channel(false);
        let tx = std::sync::Arc::new(tx);
        let (state, _) = watch::channel(SamplerState::Idle);
        let sampler = Self {
            aggregator,
            recorder,
            processes,
            config,
            state,
            stop_rx,
            _stop_tx: std::sync::Arc::clone(&tx),
            samples_recorded: 0,
            ticks_skipped: 0,
        };
        let handle = StopHandle { tx };
        (sampler, handle)
    }

    /// Subscribe to lifecycle state transitions.
    pub fn state_watch(&self) -> watch::Receiver<SamplerState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: SamplerState) {
        self.state.send_replace(state);
    }

    /// Run the loop to completion.
    pub async fn run(mut self) -> Result<RunSummary, SamplerError> {
        self.config
            .validate()
            .map_err(|e| SamplerError::InvalidConfig {
                message: e.to_string(),
            })?;

        let mut stop_rx = self.stop_rx.clone();
        info!(
            nodes = self.aggregator.node_count(),
            processes = ?self.processes.labels(),
            period_ms = self.config.period().as_millis() as u64,
            results = %self.recorder.path().display(),
            "sampling run starting"
        );

        self.set_state(SamplerState::Sampling);

        // Tick 0: the baseline sample, taken before the workload-driven loop.
        let mut tick: u64 = 0;
        self.sample_tick(tick).await?;

        let mut sample_interval = tokio::time::interval(self.config.period());
        sample_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut liveness_interval = tokio::time::interval(self.config.liveness_interval());
        liveness_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // The first tick of a fresh interval fires immediately; consume both
        // so the loop starts one period out.
        sample_interval.tick().await;
        liveness_interval.tick().await;

        let reason = loop {
            tokio::select! {
                biased;

                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        debug!(tick, "external stop requested");
                        break StopReason::Cancelled;
                    }
                }

                _ = liveness_interval.tick() => {
                    if !self.processes.any_running() {
                        debug!(tick, "all monitored processes exited");
                        break StopReason::WorkloadExited;
                    }
                }

                _ = sample_interval.tick() => {
                    tick += 1;
                    let interrupted = tokio::select! {
                        biased;
                        _ = stop_rx.changed() => *stop_rx.borrow(),
                        res = self.sample_tick(tick) => {
                            res?;
                            false
                        }
                    };
                    if interrupted {
                        debug!(tick, "external stop during in-flight tick");
                        break StopReason::Cancelled;
                    }
                }
            }
        };

        // Drain: one final sample so the series covers the workload's end.
        self.set_state(SamplerState::Draining);
        tick += 1;
        self.sample_tick(tick).await?;
        self.set_state(SamplerState::Stopped);

        let summary = RunSummary {
            samples_recorded: self.samples_recorded,
            ticks_skipped: self.ticks_skipped,
            stop_reason: reason,
            results_path: self.recorder.path().to_path_buf(),
        };
        info!(
            samples = summary.samples_recorded,
            skipped = summary.ticks_skipped,
            reason = ?summary.stop_reason,
            "sampling run finished"
        );
        Ok(summary)
    }

    /// Take and record one cluster sample, honoring the partial-tick policy.
    ///
    /// A skipped tick records nothing and consumes no sample id; the next
    /// successful tick takes the next id in sequence.
    async fn sample_tick(&mut self, tick: u64) -> Result<(), SamplerError> {
        let mut attempts: u32 = 0;
        loop {
            match self.aggregator.sample_cluster().await {
                Ok(sample) => {
                    let label =
                        format_sample_label(self.samples_recorded, self.config.period());
                    self.recorder.append(&label, &sample.total)?;
                    self.samples_recorded += 1;
                    return Ok(());
                }
                Err(err) if attempts < self.config.tick_retries => {
                    attempts += 1;
                    warn!(
                        tick,
                        attempt = attempts,
                        error = %err,
                        "tick failed, retrying"
                    );
                    tokio::time::sleep(self.config.tick_retry_backoff()).await;
                }
                Err(err) => match self.config.on_exhausted {
                    PartialTickPolicy::Skip => {
                        self.ticks_skipped += 1;
                        warn!(tick, error = %err, "tick skipped after retries");
                        return Ok(());
                    }
                    PartialTickPolicy::Abort => {
                        return Err(SamplerError::Aborted { tick, source: err });
                    }
                },
            }
        }
    }
}

/// A running experiment's sampler task.
pub struct ExperimentRun {
    handle: JoinHandle<Result<RunSummary, SamplerError>>,
    stop: StopHandle,
    state_rx: watch::Receiver<SamplerState>,
}

impl ExperimentRun {
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Current lifecycle state of the sampler task.
    pub fn state(&self) -> SamplerState {
        *self.state_rx.borrow()
    }

    /// Wait for the run to finish and return its summary.
    pub async fn join(self) -> Result<RunSummary, SamplerError> {
        self.handle.await?
    }
}

/// Spawn a sampling run over `nodes` that lasts while `processes` is active.
pub fn start_sampling<S>(
    source: S,
    nodes: Vec<NodeConfig>,
    processes: MonitoredProcessSet,
    config: SamplingConfig,
    recorder: SampleRecorder,
) -> ExperimentRun
where
    S: CounterSource + 'static,
{
    let aggregator = ClusterAggregator::new(source, nodes)
        .with_node_retry(config.retry_node_once, config.tick_retry_backoff());
    let (sampler, stop) = Sampler::new(aggregator, recorder, processes, config);
    let state_rx = sampler.state_watch();
    let handle = tokio::spawn(sampler.run());
    ExperimentRun {
        handle,
        stop,
        state_rx,
    }
}

/// Elapsed-time label for the n-th recorded sample: the product of sample
/// index and period, in seconds, with the fraction trimmed ("0", "0.1", "1",
/// "1.5").
fn format_sample_label(index: u64, period: Duration) -> String {
    let ms = index.saturating_mul(period.as_millis() as u64);
    let secs = ms / 1000;
    let rem = ms % 1000;
    if rem == 0 {
        secs.to_string()
    } else {
        let frac = format!("{rem:03}");
        format!("{secs}.{}", frac.trim_end_matches('0'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counters::InterfaceCounters;
    use crate::mock::{CountdownProbe, MockCounterSource};
    use crate::recorder::read_samples;
    use sth_common::types::NodeId;
    use tempfile::tempdir;
    use tracing::info;
    use tracing::Level;
    use tracing_subscriber::fmt;

    fn init_test_logging() {
        let _ = fmt()
            .with_max_level(Level::DEBUG)
            .with_test_writer()
            .try_init();
    }

    fn one_node() -> Vec<NodeConfig> {
        vec![NodeConfig {
            id: NodeId::new("r1"),
            host: "10.0.0.1".to_string(),
            user: "root".to_string(),
            identity_file: "~/.ssh/id_rsa".to_string(),
            interfaces: vec!["eth0".to_string()],
        }]
    }

    fn fast_config(results_path: &std::path::Path) -> SamplingConfig {
        let mut config = SamplingConfig::default();
        config.period_ms = 100;
        config.liveness_interval_ms = 100;
        config.tick_retry_backoff_ms = 1;
        config.results_path = results_path.to_path_buf();
        config
    }

    #[test]
    fn test_sample_label_formatting() {
        let p = Duration::from_millis(100);
        assert_eq!(format_sample_label(0, p), "0");
        assert_eq!(format_sample_label(1, p), "0.1");
        assert_eq!(format_sample_label(5, p), "0.5");
        assert_eq!(format_sample_label(10, p), "1");
        assert_eq!(format_sample_label(15, p), "1.5");
        assert_eq!(format_sample_label(1, Duration::from_millis(250)), "0.25");
        assert_eq!(format_sample_label(3, Duration::from_secs(1)), "3");
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_after_k_ticks_yields_k_plus_one_samples() {
        init_test_logging();
        info!("TEST START: test_exit_after_k_ticks_yields_k_plus_one_samples");

        let dir = tempdir().unwrap();
        let path = dir.path().join("results.csv");

        let source = MockCounterSource::new();
        source.set_counters("r1", InterfaceCounters::new(10, 5, 1000, 500));

        // Alive for 3 liveness polls, observed exited on the 4th: exit after
        // K = 4 ticks, so K + 1 = 5 samples.
        let probe = CountdownProbe::alive_for(3);
        let mut processes = MonitoredProcessSet::new();
        processes.add(probe);

        let config = fast_config(&path);
        let aggregator = ClusterAggregator::new(source, one_node());
        let recorder = SampleRecorder::open(&path).unwrap();
        let (sampler, _stop) = Sampler::new(aggregator, recorder, processes, config);

        let summary = sampler.run().await.unwrap();
        info!(samples = summary.samples_recorded, "RESULT: run summary");

        assert_eq!(summary.samples_recorded, 5);
        assert_eq!(summary.ticks_skipped, 0);
        assert_eq!(summary.stop_reason, StopReason::WorkloadExited);

        let rows = read_samples(&path).unwrap();
        let ids: Vec<&str> = rows.iter().map(|r| r.sample_id.as_str()).collect();
        assert_eq!(ids, ["0", "0.1", "0.2", "0.3", "0.4"]);

        info!("TEST PASS: test_exit_after_k_ticks_yields_k_plus_one_samples");
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_process_set_stops_after_initial_and_drain() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("results.csv");

        let source = MockCounterSource::new();
        source.set_counters("r1", InterfaceCounters::new(1, 1, 1, 1));

        let config = fast_config(&path);
        let aggregator = ClusterAggregator::new(source, one_node());
        let recorder = SampleRecorder::open(&path).unwrap();
        let (sampler, _stop) = Sampler::new(
            aggregator,
            recorder,
            MonitoredProcessSet::new(),
            config,
        );

        let summary = sampler.run().await.unwrap();
        assert_eq!(summary.samples_recorded, 2);
        assert_eq!(summary.stop_reason, StopReason::WorkloadExited);
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_stop_drains_and_stops() {
        init_test_logging();
        info!("TEST START: test_external_stop_drains_and_stops");

        let dir = tempdir().unwrap();
        let path = dir.path().join("results.csv");

        let source = MockCounterSource::new();
        source.set_counters("r1", InterfaceCounters::new(2, 2, 2, 2));

        let mut processes = MonitoredProcessSet::new();
        processes.add(CountdownProbe::alive_for(1_000_000));

        let run = start_sampling(
            source,
            one_node(),
            processes,
            fast_config(&path),
            SampleRecorder::open(&path).unwrap(),
        );

        let stop = run.stop_handle();
        tokio::time::sleep(Duration::from_millis(350)).await;
        stop.stop();

        let summary = run.join().await.unwrap();
        info!(samples = summary.samples_recorded, "RESULT: run summary");

        assert_eq!(summary.stop_reason, StopReason::Cancelled);
        // Initial sample, three periodic ticks, one drain sample.
        assert!(summary.samples_recorded >= 2);

        info!("TEST PASS: test_external_stop_drains_and_stops");
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_stop_handle_does_not_stall_run() {
        init_test_logging();
        info!("TEST START: test_dropped_stop_handle_does_not_stall_run");

        let dir = tempdir().unwrap();
        let path = dir.path().join("results.csv");

        let source = MockCounterSource::new();
        source.set_counters("r1", InterfaceCounters::new(4, 4, 4, 4));

        let mut processes = MonitoredProcessSet::new();
        processes.add(CountdownProbe::alive_for(1));

        let aggregator = ClusterAggregator::new(source, one_node());
        let recorder = SampleRecorder::open(&path).unwrap();
        let (sampler, stop) = Sampler::new(aggregator, recorder, processes, fast_config(&path));

        // Nothing obliges a caller to keep the handle alive for the run.
        drop(stop);

        let summary = sampler.run().await.unwrap();
        info!(samples = summary.samples_recorded, "RESULT: run summary");

        assert_eq!(summary.stop_reason, StopReason::WorkloadExited);
        assert_eq!(summary.samples_recorded, 3);

        info!("TEST PASS: test_dropped_stop_handle_does_not_stall_run");
    }

    #[tokio::test]
    async fn test_zero_period_is_config_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("results.csv");

        let source = MockCounterSource::new();
        source.set_counters("r1", InterfaceCounters::new(1, 1, 1, 1));

        let mut config = fast_config(&path);
        config.period_ms = 0;

        let aggregator = ClusterAggregator::new(source, one_node());
        let recorder = SampleRecorder::open(&path).unwrap();
        let (sampler, _stop) = Sampler::new(
            aggregator,
            recorder,
            MonitoredProcessSet::new(),
            config,
        );

        let err = sampler.run().await.unwrap_err();
        assert!(matches!(err, SamplerError::InvalidConfig { .. }));

        let rows = read_samples(&path).unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_watch_reaches_stopped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("results.csv");

        let source = MockCounterSource::new();
        source.set_counters("r1", InterfaceCounters::new(1, 1, 1, 1));

        let mut processes = MonitoredProcessSet::new();
        processes.add(CountdownProbe::alive_for(1));

        let aggregator = ClusterAggregator::new(source, one_node());
        let recorder = SampleRecorder::open(&path).unwrap();
        let (sampler, _stop) =
            Sampler::new(aggregator, recorder, processes, fast_config(&path));

        let state_rx = sampler.state_watch();
        assert_eq!(*state_rx.borrow(), SamplerState::Idle);

        sampler.run().await.unwrap();
        assert_eq!(*state_rx.borrow(), SamplerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_policy_fails_run() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("results.csv");

        let source = MockCounterSource::new();
        source.fail_node("r1", "connection refused");

        let mut config = fast_config(&path);
        config.on_exhausted = PartialTickPolicy::Abort;
        config.tick_retries = 1;
        config.retry_node_once = false;

        let aggregator = ClusterAggregator::new(source, one_node())
            .with_node_retry(false, Duration::from_millis(1));
        let recorder = SampleRecorder::open(&path).unwrap();
        let mut processes = MonitoredProcessSet::new();
        processes.add(CountdownProbe::alive_for(10));

        let (sampler, _stop) = Sampler::new(aggregator, recorder, processes, config);
        let err = sampler.run().await.unwrap_err();
        assert!(matches!(err, SamplerError::Aborted { tick: 0, .. }));

        let rows = read_samples(&path).unwrap();
        assert!(rows.is_empty(), "aborted run must not fabricate samples");
    }

    #[tokio::test(start_paused = true)]
    async fn test_skip_policy_counts_and_reuses_ids() {
        init_test_logging();
        info!("TEST START: test_skip_policy_counts_and_reuses_ids");

        let dir = tempdir().unwrap();
        let path = dir.path().join("results.csv");

        let source = MockCounterSource::new();
        source.set_counters("r1", InterfaceCounters::new(3, 3, 3, 3));
        // Initial tick fails through its retry, then reads succeed.
        source.fail_node_times("r1", "connection reset", 2);

        let mut config = fast_config(&path);
        config.on_exhausted = PartialTickPolicy::Skip;
        config.tick_retries = 1;

        let aggregator = ClusterAggregator::new(source, one_node())
            .with_node_retry(false, Duration::from_millis(1));
        let recorder = SampleRecorder::open(&path).unwrap();
        let mut processes = MonitoredProcessSet::new();
        processes.add(CountdownProbe::alive_for(2));

        let (sampler, _stop) = Sampler::new(aggregator, recorder, processes, config);
        let summary = sampler.run().await.unwrap();
        info!(
            samples = summary.samples_recorded,
            skipped = summary.ticks_skipped,
            "RESULT: run summary"
        );

        assert_eq!(summary.ticks_skipped, 1);
        // Skipped tick consumed no id: recorded series still starts at "0".
        let rows = read_samples(&path).unwrap();
        assert_eq!(rows.len() as u64, summary.samples_recorded);
        assert_eq!(rows[0].sample_id, "0");
        assert_eq!(rows[1].sample_id, "0.1");

        info!("TEST PASS: test_skip_policy_counts_and_reuses_ids");
    }
}
