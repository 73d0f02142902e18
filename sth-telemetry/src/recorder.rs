//! Durable append-only sample recording.
//!
//! Samples land in a plain-text results file, one row per cluster sample:
//!
//! ```text
//! <sample_id>,<timestamp_ns>,<rx_packets>,<tx_packets>,<rx_bytes>,<tx_bytes>
//! ```
//!
//! Rows are flushed and synced as they are appended so a crash mid-run loses
//! at most the sample being written, never earlier ones. Writes are tiny and
//! synchronous; the sampler tick budget absorbs them.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info};

use crate::counters::InterfaceCounters;

/// Columns per results row.
const ROW_FIELDS: usize = 6;

#[derive(Error, Debug)]
pub enum RecordingError {
    #[error("failed to {action} results file {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed results row {line_no} in {path}: '{line}'")]
    Malformed {
        path: PathBuf,
        line_no: usize,
        line: String,
    },
}

/// One recorded row of the results file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleRow {
    /// Elapsed-time label of the sample ("0", "0.1", "0.2", ...).
    pub sample_id: String,
    /// Wall-clock nanoseconds since the Unix epoch at recording time.
    pub timestamp_ns: i64,
    /// Cluster-wide counter totals.
    pub counters: InterfaceCounters,
}

/// Append-only writer for an experiment run's results file.
pub struct SampleRecorder {
    path: PathBuf,
    file: File,
    rows_written: u64,
}

impl SampleRecorder {
    /// Open the results file for appending, creating parent directories and
    /// the file as needed. An existing file is extended, not truncated, so a
    /// resumed run keeps its earlier samples.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, RecordingError> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| RecordingError::Io {
                    action: "create directory for",
                    path: path.clone(),
                    source,
                })?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| RecordingError::Io {
                action: "open",
                path: path.clone(),
                source,
            })?;

        info!(path = %path.display(), "results file opened");
        Ok(Self {
            path,
            file,
            rows_written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    /// Append one sample row, stamped with the current wall clock, then flush
    /// and sync.
    pub fn append(
        &mut self,
        sample_id: &str,
        counters: &InterfaceCounters,
    ) -> Result<SampleRow, RecordingError> {
        let timestamp_ns = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let row = SampleRow {
            sample_id: sample_id.to_string(),
            timestamp_ns,
            counters: *counters,
        };
        self.append_row(&row)?;
        Ok(row)
    }

    fn append_row(&mut self, row: &SampleRow) -> Result<(), RecordingError> {
        let io_err = |action: &'static str, source| RecordingError::Io {
            action,
            path: self.path.clone(),
            source,
        };

        writeln!(
            self.file,
            "{},{},{},{},{},{}",
            row.sample_id,
            row.timestamp_ns,
            row.counters.rx_packets,
            row.counters.tx_packets,
            row.counters.rx_bytes,
            row.counters.tx_bytes
        )
        .map_err(|e| io_err("write", e))?;

        self.file.flush().map_err(|e| io_err("flush", e))?;
        self.file.sync_data().map_err(|e| io_err("sync", e))?;

        self.rows_written += 1;
        debug!(
            path = %self.path.display(),
            sample_id = %row.sample_id,
            "sample row recorded"
        );
        Ok(())
    }
}

/// Read back a results file into rows.
///
/// Blank lines are skipped; anything else that does not parse as a full row
/// is an error naming the offending line.
pub fn read_samples(path: impl AsRef<Path>) -> Result<Vec<SampleRow>, RecordingError> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|source| RecordingError::Io {
        action: "open",
        path: path.to_path_buf(),
        source,
    })?;

    let mut rows = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|source| RecordingError::Io {
            action: "read",
            path: path.to_path_buf(),
            source,
        })?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        rows.push(parse_row(path, idx + 1, trimmed)?);
    }
    Ok(rows)
}

fn parse_row(path: &Path, line_no: usize, line: &str) -> Result<SampleRow, RecordingError> {
    let malformed = || RecordingError::Malformed {
        path: path.to_path_buf(),
        line_no,
        line: line.to_string(),
    };

    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() != ROW_FIELDS {
        return Err(malformed());
    }

    let timestamp_ns: i64 = fields[1].parse().map_err(|_| malformed())?;
    let parse_u64 = |s: &str| s.parse::<u64>().map_err(|_| malformed());

    Ok(SampleRow {
        sample_id: fields[0].to_string(),
        timestamp_ns,
        counters: InterfaceCounters::new(
            parse_u64(fields[2])?,
            parse_u64(fields[3])?,
            parse_u64(fields[4])?,
            parse_u64(fields[5])?,
        ),
    })
}
