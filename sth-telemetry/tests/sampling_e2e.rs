//! End-to-end sampling run over a scripted three-node cluster.

use std::time::Duration;

use tempfile::tempdir;
use tracing::info;
use tracing::Level;
use tracing_subscriber::fmt;

use sth_common::config::SamplingConfig;
use sth_common::types::{NodeConfig, NodeId};
use sth_telemetry::aggregate::ClusterAggregator;
use sth_telemetry::counters::InterfaceCounters;
use sth_telemetry::lifecycle::MonitoredProcessSet;
use sth_telemetry::mock::{CountdownProbe, MockCounterSource};
use sth_telemetry::recorder::{read_samples, SampleRecorder};
use sth_telemetry::sampler::{Sampler, StopReason};

fn init_test_logging() {
    let _ = fmt()
        .with_max_level(Level::DEBUG)
        .with_test_writer()
        .try_init();
}

fn cluster(ids: &[&str]) -> Vec<NodeConfig> {
    ids.iter()
        .enumerate()
        .map(|(i, id)| NodeConfig {
            id: NodeId::new(*id),
            host: format!("10.0.0.{}", 11 + i),
            user: "root".to_string(),
            identity_file: "~/.ssh/id_rsa".to_string(),
            interfaces: vec![format!("{id}-eth0")],
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn three_node_run_records_cluster_totals() {
    init_test_logging();
    info!("TEST START: three_node_run_records_cluster_totals");

    let dir = tempdir().unwrap();
    let path = dir.path().join("results.csv");

    // Per-node counter progression across successive reads. First tick sums
    // to (35, 17, 3500, 1700), the next to (38, 20, 3800, 2000).
    let source = MockCounterSource::new();
    source.set_sequence(
        "r1",
        vec![
            InterfaceCounters::new(10, 5, 1000, 500),
            InterfaceCounters::new(11, 6, 1100, 600),
        ],
    );
    source.set_sequence(
        "r2",
        vec![
            InterfaceCounters::new(20, 10, 2000, 1000),
            InterfaceCounters::new(21, 11, 2100, 1100),
        ],
    );
    source.set_sequence(
        "r3",
        vec![
            InterfaceCounters::new(5, 2, 500, 200),
            InterfaceCounters::new(6, 3, 600, 300),
        ],
    );

    let mut processes = MonitoredProcessSet::new();
    processes.add(CountdownProbe::alive_for(1));

    let mut config = SamplingConfig::default();
    config.period_ms = 100;
    config.liveness_interval_ms = 100;
    config.retry_node_once = false;
    config.results_path = path.clone();

    let aggregator = ClusterAggregator::new(source, cluster(&["r1", "r2", "r3"]))
        .with_node_retry(false, Duration::from_millis(1));
    let recorder = SampleRecorder::open(&path).unwrap();
    let (sampler, _stop) = Sampler::new(aggregator, recorder, processes, config);

    let summary = sampler.run().await.unwrap();
    info!(samples = summary.samples_recorded, "RESULT: run summary");

    assert_eq!(summary.stop_reason, StopReason::WorkloadExited);
    assert_eq!(summary.ticks_skipped, 0);
    // Baseline, one live tick, one drain sample.
    assert_eq!(summary.samples_recorded, 3);

    let rows = read_samples(&path).unwrap();
    assert_eq!(rows.len(), 3);

    assert_eq!(rows[0].sample_id, "0");
    assert_eq!(rows[0].counters, InterfaceCounters::new(35, 17, 3500, 1700));
    assert_eq!(rows[1].sample_id, "0.1");
    assert_eq!(rows[1].counters, InterfaceCounters::new(38, 20, 3800, 2000));
    assert_eq!(rows[2].sample_id, "0.2");

    // Cumulative counters never decrease across the recorded series.
    for pair in rows.windows(2) {
        assert!(
            pair[1].counters.is_monotonic_from(&pair[0].counters),
            "row {} regressed from row {}",
            pair[1].sample_id,
            pair[0].sample_id
        );
        assert!(pair[1].timestamp_ns >= pair[0].timestamp_ns);
    }

    info!("TEST PASS: three_node_run_records_cluster_totals");
}

#[tokio::test(start_paused = true)]
async fn failing_node_discards_tick_without_zero_fill() {
    init_test_logging();
    info!("TEST START: failing_node_discards_tick_without_zero_fill");

    let dir = tempdir().unwrap();
    let path = dir.path().join("results.csv");

    let source = MockCounterSource::new();
    source.set_counters("r1", InterfaceCounters::new(10, 5, 1000, 500));
    source.set_counters("r2", InterfaceCounters::new(20, 10, 2000, 1000));
    // r2 drops out for the baseline tick and its retry, then recovers.
    source.fail_node_times("r2", "connection refused", 2);

    let mut processes = MonitoredProcessSet::new();
    processes.add(CountdownProbe::alive_for(1));

    let mut config = SamplingConfig::default();
    config.period_ms = 100;
    config.liveness_interval_ms = 100;
    config.retry_node_once = false;
    config.tick_retries = 1;
    config.tick_retry_backoff_ms = 1;
    config.results_path = path.clone();

    let aggregator = ClusterAggregator::new(source, cluster(&["r1", "r2"]))
        .with_node_retry(false, Duration::from_millis(1));
    let recorder = SampleRecorder::open(&path).unwrap();
    let (sampler, _stop) = Sampler::new(aggregator, recorder, processes, config);

    let summary = sampler.run().await.unwrap();
    info!(
        samples = summary.samples_recorded,
        skipped = summary.ticks_skipped,
        "RESULT: run summary"
    );

    assert_eq!(summary.ticks_skipped, 1);

    let rows = read_samples(&path).unwrap();
    assert_eq!(rows.len() as u64, summary.samples_recorded);
    for row in &rows {
        assert_eq!(
            row.counters,
            InterfaceCounters::new(30, 15, 3000, 1500),
            "recorded rows must hold full cluster totals, never partial zeros"
        );
    }

    info!("TEST PASS: failing_node_discards_tick_without_zero_fill");
}
