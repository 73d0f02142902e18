//! Telemetry CLI for the storage testbed harness.
#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};

use sth_common::config::{
    example_cluster_config, example_sampling_config, load_nodes, load_sampling_config,
};
use sth_common::logging::{init_logging, LogConfig};
use sth_common::ssh::{SshOptions, SshPool};
use sth_telemetry::aggregate::{ClusterAggregator, ClusterSample};
use sth_telemetry::lifecycle::MonitoredProcessSet;
use sth_telemetry::recorder::SampleRecorder;
use sth_telemetry::sampler::start_sampling;
use sth_telemetry::source::SshCounterSource;

#[derive(Parser)]
#[command(name = "sth-telemetry", about = "Network telemetry for testbed experiments")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Take one cluster-wide counter snapshot and print it
    Collect {
        /// Path to cluster.toml (defaults to the user config directory)
        #[arg(long)]
        cluster: Option<PathBuf>,

        /// Output format
        #[arg(long, default_value = "json")]
        format: OutputFormat,
    },

    /// Sample the cluster while monitored processes run
    Run {
        /// Path to cluster.toml (defaults to the user config directory)
        #[arg(long)]
        cluster: Option<PathBuf>,

        /// Path to sampling.toml (defaults to the user config directory)
        #[arg(long)]
        sampling: Option<PathBuf>,

        /// Workload process to monitor; repeatable
        #[arg(long = "pid")]
        pids: Vec<u32>,

        /// Override the results file path from sampling.toml
        #[arg(long)]
        results: Option<PathBuf>,
    },

    /// Print example configuration files
    ExampleConfig {
        /// Which example to print
        #[arg(long, default_value = "cluster")]
        which: ExampleKind,
    },
}

#[derive(ValueEnum, Clone, Copy)]
enum OutputFormat {
    Json,
    Pretty,
    Csv,
}

#[derive(ValueEnum, Clone, Copy)]
enum ExampleKind {
    Cluster,
    Sampling,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut log_config = LogConfig::from_env("info").with_stderr();
    if cli.verbose {
        log_config = log_config.with_level("debug");
    }
    let _logging_guards = init_logging(&log_config)?;

    match cli.command {
        Commands::Collect { cluster, format } => collect(cluster, format).await,
        Commands::Run {
            cluster,
            sampling,
            pids,
            results,
        } => run(cluster, sampling, pids, results).await,
        Commands::ExampleConfig { which } => {
            match which {
                ExampleKind::Cluster => print!("{}", example_cluster_config()),
                ExampleKind::Sampling => print!("{}", example_sampling_config()),
            }
            Ok(())
        }
    }
}

async fn collect(cluster: Option<PathBuf>, format: OutputFormat) -> Result<()> {
    let nodes = load_nodes(cluster.as_deref())?;
    anyhow::ensure!(!nodes.is_empty(), "no enabled nodes in cluster config");

    let pool = Arc::new(SshPool::new(SshOptions::default()));
    let aggregator = ClusterAggregator::new(SshCounterSource::new(Arc::clone(&pool)), nodes);

    let sample = aggregator
        .sample_cluster()
        .await
        .context("cluster snapshot failed")?;

    match format {
        OutputFormat::Json => println!("{}", sample_to_json(&sample)),
        OutputFormat::Pretty => {
            println!(
                "{}",
                serde_json::to_string_pretty(&sample_to_json(&sample))?
            );
        }
        OutputFormat::Csv => {
            let t = &sample.total;
            println!(
                "{},{},{},{}",
                t.rx_packets, t.tx_packets, t.rx_bytes, t.tx_bytes
            );
        }
    }

    pool.close_all().await;
    Ok(())
}

fn sample_to_json(sample: &ClusterSample) -> serde_json::Value {
    serde_json::json!({
        "total": sample.total,
        "nodes": sample
            .nodes
            .iter()
            .map(|n| serde_json::json!({ "node": n.node.as_str(), "counters": n.counters }))
            .collect::<Vec<_>>(),
    })
}

async fn run(
    cluster: Option<PathBuf>,
    sampling: Option<PathBuf>,
    pids: Vec<u32>,
    results: Option<PathBuf>,
) -> Result<()> {
    let nodes = load_nodes(cluster.as_deref())?;
    anyhow::ensure!(!nodes.is_empty(), "no enabled nodes in cluster config");

    let mut config = load_sampling_config(sampling.as_deref())?;
    if let Some(results) = results {
        config.results_path = results;
    }

    if pids.is_empty() {
        warn!("no --pid given; run records a baseline and a final sample, then stops");
    }
    let processes = MonitoredProcessSet::from_pids(&pids);

    let ssh_options = SshOptions {
        command_timeout: config.read_timeout(),
        ..SshOptions::default()
    };
    let pool = Arc::new(SshPool::new(ssh_options));
    let source = SshCounterSource::new(Arc::clone(&pool));
    let recorder = SampleRecorder::open(&config.results_path)?;

    let run = start_sampling(source, nodes, processes, config, recorder);

    let stop = run.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping sampling");
            stop.stop();
        }
    });

    let summary = run.join().await?;
    println!(
        "recorded {} samples ({} ticks skipped) to {}",
        summary.samples_recorded,
        summary.ticks_skipped,
        summary.results_path.display()
    );

    pool.close_all().await;
    Ok(())
}
