//! Append-only JSON Lines log of reconciliation reports.

use std::io::Write;
use std::path::{Path, PathBuf};

use fs_err as fs;

use crate::error::{ReconcileError, Result};
use crate::types::ReconciliationReport;

#[derive(Debug, Clone)]
pub struct ReportLog {
    path: PathBuf,
}

impl ReportLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        ReportLog { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one report as a single line.
    pub fn append(&self, report: &ReconciliationReport) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| ReconcileError::io("Failed to create report log directory", err))?;
        }

        let mut line = serde_json::to_string(report)
            .map_err(|err| ReconcileError::json("Failed to serialize report", err))?;
        line.push('\n');

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|err| ReconcileError::io("Failed to open report log", err))?;
        // One write per line so concurrent appenders do not interleave.
        file.write_all(line.as_bytes())
            .map_err(|err| ReconcileError::io("Failed to append report", err))
    }
}
