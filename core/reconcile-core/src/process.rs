//! Live worker process discovery.
//!
//! [`ProcessSnapshotCollector`] walks the OS process table once per pass and
//! keeps only processes whose invocation resolves to a worker id through the
//! [`IdentityTable`]. The table walk goes through [`ProcessSource`] so tests can
//! feed a fixed process list.

use chrono::{DateTime, Utc};
use sysinfo::{Pid, ProcessRefreshKind, System, UpdateKind};
use tracing::{debug, warn};

use crate::identity::IdentityTable;
use crate::types::{ProcessFact, ProcessSnapshot, INVOCATION_SUMMARY_LEN};

/// One process as listed by the OS. An empty `cmd` means the invocation could
/// not be read (kernel thread, permission denied, exited mid-scan).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawProcess {
    pub pid: u32,
    pub cmd: Vec<String>,
    /// Seconds since the Unix epoch; 0 when unknown.
    pub start_time: u64,
}

impl RawProcess {
    pub fn new(pid: u32, cmd: &[&str], start_time: u64) -> Self {
        RawProcess {
            pid,
            cmd: cmd.iter().map(|arg| arg.to_string()).collect(),
            start_time,
        }
    }
}

/// Read-only process listing primitive.
pub trait ProcessSource {
    fn list(&self) -> Vec<RawProcess>;
}

/// Lists processes through `sysinfo`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SysinfoProcessSource;

impl ProcessSource for SysinfoProcessSource {
    fn list(&self) -> Vec<RawProcess> {
        let mut sys = System::new();
        sys.refresh_processes_specifics(ProcessRefreshKind::new().with_cmd(UpdateKind::Always));

        sys.processes()
            .iter()
            .map(|(pid, process)| RawProcess {
                pid: pid.as_u32(),
                cmd: process.cmd().to_vec(),
                start_time: process.start_time(),
            })
            .collect()
    }
}

/// A fixed process list.
#[derive(Debug, Default, Clone)]
pub struct StaticProcessSource {
    processes: Vec<RawProcess>,
}

impl StaticProcessSource {
    pub fn new(processes: Vec<RawProcess>) -> Self {
        StaticProcessSource { processes }
    }
}

impl ProcessSource for StaticProcessSource {
    fn list(&self) -> Vec<RawProcess> {
        self.processes.clone()
    }
}

/// Start time (Unix seconds) of a single process, refreshing only that PID.
pub fn process_start_time(pid: u32) -> Option<u64> {
    let mut sys = System::new();
    let sys_pid = Pid::from(pid as usize);
    sys.refresh_process_specifics(sys_pid, ProcessRefreshKind::new());
    sys.process(sys_pid).map(|process| process.start_time())
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

fn started_at(start_time: u64) -> Option<DateTime<Utc>> {
    if start_time == 0 {
        return None;
    }
    DateTime::from_timestamp(i64::try_from(start_time).ok()?, 0)
}

pub struct ProcessSnapshotCollector {
    source: Box<dyn ProcessSource>,
    identities: IdentityTable,
}

impl ProcessSnapshotCollector {
    pub fn new(source: Box<dyn ProcessSource>, identities: IdentityTable) -> Self {
        ProcessSnapshotCollector { source, identities }
    }

    /// Builds the worker id → process mapping for this instant.
    ///
    /// Processes are visited oldest first (ties broken by PID), so when two
    /// processes resolve to the same worker the longest-running one is kept.
    /// The duplicate is logged, never an error.
    pub fn collect(&self) -> ProcessSnapshot {
        let mut processes = self.source.list();
        processes.sort_by_key(|p| (p.start_time, p.pid));

        let mut snapshot = ProcessSnapshot::new();
        for process in processes {
            if process.cmd.is_empty() {
                continue;
            }
            let invocation = process.cmd.join(" ");
            let Some(worker_id) = self.identities.resolve(&invocation) else {
                continue;
            };

            if let Some(kept) = snapshot.get(worker_id) {
                warn!(
                    worker_id,
                    kept_pid = kept.pid,
                    dropped_pid = process.pid,
                    "Multiple processes resolve to the same worker; keeping the oldest"
                );
                continue;
            }

            debug!(worker_id, pid = process.pid, "Found worker process");
            snapshot.insert(
                worker_id.to_string(),
                ProcessFact {
                    worker_id: worker_id.to_string(),
                    pid: process.pid,
                    started_at: started_at(process.start_time),
                    invocation: truncate_chars(&invocation, INVOCATION_SUMMARY_LEN),
                },
            );
        }
        snapshot
    }
}
