//! Workload process liveness.
//!
//! The sampler keeps running while any monitored workload process is alive.
//! Liveness is observed, not controlled: the harness never signals or reaps
//! the workload, it only asks whether the process still exists.

use std::path::PathBuf;

use tracing::debug;

/// Answers "is this workload still running".
pub trait ProcessProbe: Send + Sync {
    fn is_running(&self) -> bool;

    /// Short identifier for log lines.
    fn label(&self) -> String {
        "process".to_string()
    }
}

/// Probe for a local process by pid, via `/proc/<pid>` existence.
///
/// A pid that was never valid simply reads as not running. Zombies still have
/// a `/proc` entry and count as running until reaped by their parent, which
/// matches how long the workload can still be producing exit-time effects.
#[derive(Debug, Clone)]
pub struct PidProbe {
    pid: u32,
    proc_root: PathBuf,
}

impl PidProbe {
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            proc_root: PathBuf::from("/proc"),
        }
    }

    #[cfg(test)]
    fn with_proc_root(pid: u32, proc_root: PathBuf) -> Self {
        Self { pid, proc_root }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }
}

impl ProcessProbe for PidProbe {
    fn is_running(&self) -> bool {
        let running = self.proc_root.join(self.pid.to_string()).exists();
        if !running {
            debug!(pid = self.pid, "process no longer present");
        }
        running
    }

    fn label(&self) -> String {
        format!("pid {}", self.pid)
    }
}

/// The set of workload processes an experiment run monitors.
///
/// The run is considered active while at least one member is running. An
/// empty set is never active, so a run constructed without workloads stops
/// after its initial sample.
pub struct MonitoredProcessSet {
    probes: Vec<Box<dyn ProcessProbe>>,
}

impl MonitoredProcessSet {
    pub fn new() -> Self {
        Self { probes: Vec::new() }
    }

    pub fn from_pids(pids: &[u32]) -> Self {
        let mut set = Self::new();
        for &pid in pids {
            set.add(PidProbe::new(pid));
        }
        set
    }

    pub fn add<P: ProcessProbe + 'static>(&mut self, probe: P) -> &mut Self {
        self.probes.push(Box::new(probe));
        self
    }

    pub fn len(&self) -> usize {
        self.probes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }

    /// True while at least one monitored process is running.
    pub fn any_running(&self) -> bool {
        self.probes.iter().any(|p| p.is_running())
    }

    /// Probe labels, for log lines.
    pub fn labels(&self) -> Vec<String> {
        self.probes.iter().map(|p| p.label()).collect()
    }
}

impl Default for MonitoredProcessSet {
    fn default() -> Self {
        Self::new()
    }
}
