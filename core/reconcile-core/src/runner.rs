//! Pass orchestration: single pass or a continuous, stoppable loop.
//!
//! A pass is collect processes → collect records → reconcile → append report.
//! Nothing suspends mid-pass; the continuous loop only waits between passes,
//! and that wait wakes early when the [`StopSignal`] fires.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use tracing::{error, info, warn};

use crate::config::ReconcileConfig;
use crate::error::Result;
use crate::identity::IdentityTable;
use crate::process::{ProcessSnapshotCollector, ProcessSource, SysinfoProcessSource};
use crate::reconciler::Reconciler;
use crate::records::FileStateCollector;
use crate::report_log::ReportLog;
use crate::types::ReconciliationReport;
use crate::writer::StateWriter;

/// Cloneable stop flag for the continuous loop.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        let (flag, wake) = &*self.inner;
        *flag.lock().unwrap_or_else(PoisonError::into_inner) = true;
        wake.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleeps up to `timeout`. Returns true if stopped.
    pub fn wait(&self, timeout: Duration) -> bool {
        let (flag, wake) = &*self.inner;
        let guard = flag.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = wake
            .wait_timeout_while(guard, timeout, |stopped| !*stopped)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

pub struct ReconciliationLoop {
    config: ReconcileConfig,
    processes: ProcessSnapshotCollector,
    records: FileStateCollector,
    writer: StateWriter,
    report_log: ReportLog,
    auto_fix: bool,
}

impl ReconciliationLoop {
    pub fn new(
        config: ReconcileConfig,
        source: Box<dyn ProcessSource>,
        auto_fix: bool,
    ) -> Result<Self> {
        let identities = IdentityTable::compile(&config.identity_rules)?;
        Ok(ReconciliationLoop {
            processes: ProcessSnapshotCollector::new(source, identities),
            records: FileStateCollector::new(config.state_dir()),
            writer: StateWriter::new(&config),
            report_log: ReportLog::new(config.report_log()),
            auto_fix,
            config,
        })
    }

    /// Loop over the live OS process table.
    pub fn with_system_processes(config: ReconcileConfig, auto_fix: bool) -> Result<Self> {
        Self::new(config, Box::new(SysinfoProcessSource), auto_fix)
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    pub fn writer(&self) -> &StateWriter {
        &self.writer
    }

    /// Runs one complete pass. Fails only when the state directory itself is
    /// unreadable; a report log failure is logged and does not fail the pass.
    pub fn run_once(&self) -> Result<ReconciliationReport> {
        let processes = self.processes.collect();
        let records = self.records.collect()?;
        let report = Reconciler::new(&self.writer).reconcile(&processes, &records, self.auto_fix);

        if let Err(err) = self.report_log.append(&report) {
            warn!(
                path = %self.report_log.path().display(),
                error = %err,
                "Failed to append reconciliation report"
            );
        }

        info!(
            processes_found = report.processes_found,
            records_found = report.records_found,
            mismatches = report.mismatches.len(),
            fixed = report.fixed.len(),
            healthy = report.healthy(),
            "Reconciliation pass complete"
        );
        Ok(report)
    }

    /// Runs passes every `config.interval` until `stop` fires. `on_pass` sees
    /// each pass result. Returns the health of the last pass (false if none ran
    /// or the last one failed).
    pub fn run_continuous<F>(&self, stop: &StopSignal, mut on_pass: F) -> bool
    where
        F: FnMut(&Result<ReconciliationReport>),
    {
        let mut last_healthy = false;
        while !stop.is_stopped() {
            let result = self.run_once();
            match &result {
                Ok(report) => last_healthy = report.healthy(),
                Err(err) => {
                    error!(error = %err, "Reconciliation pass failed");
                    last_healthy = false;
                }
            }
            on_pass(&result);

            if stop.wait(self.config.interval) {
                break;
            }
        }
        info!("Reconciliation loop stopped");
        last_healthy
    }
}
