//! Persisted state record discovery.
//!
//! Reads every `*.json` file in the state directory once. The file stem is the
//! worker id. Any JSON object is a record; a file that cannot be read or is
//! not a JSON object is skipped with a warning:
//! the worker then has no record for this pass, which is different from having
//! a record with unknown status.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs_err as fs;
use tracing::{debug, warn};

use crate::error::{ReconcileError, Result};
use crate::types::{CollectedRecord, RecordSnapshot, StateRecord};

/// Parses one record file. The record's id is always `worker_id`, the file
/// stem, whatever its `bot_id` says.
pub fn read_record(path: &Path, worker_id: &str) -> Result<StateRecord> {
    let content = fs::read_to_string(path)
        .map_err(|err| ReconcileError::io(format!("Failed to read {}", path.display()), err))?;
    parse_record(&content, worker_id)
        .map_err(|err| ReconcileError::json(format!("Failed to parse {}", path.display()), err))
}

pub(crate) fn parse_record(
    content: &str,
    worker_id: &str,
) -> std::result::Result<StateRecord, serde_json::Error> {
    let mut record: StateRecord = serde_json::from_str(content)?;
    record.worker_id = worker_id.to_string();
    Ok(record)
}

fn file_modified(path: &Path) -> Option<DateTime<Utc>> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    Some(DateTime::<Utc>::from(modified))
}

#[derive(Debug, Clone)]
pub struct FileStateCollector {
    state_dir: PathBuf,
}

impl FileStateCollector {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        FileStateCollector {
            state_dir: state_dir.into(),
        }
    }

    /// Builds the worker id → record mapping.
    ///
    /// A missing state directory yields an empty mapping. Any other failure to
    /// list the directory is structural and ends the pass.
    pub fn collect(&self) -> Result<RecordSnapshot> {
        let mut snapshot = RecordSnapshot::new();

        let entries = match std::fs::read_dir(&self.state_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(dir = %self.state_dir.display(), "State directory missing; no records");
                return Ok(snapshot);
            }
            Err(err) => {
                return Err(ReconcileError::StateDirUnreadable {
                    path: self.state_dir.clone(),
                    source: err,
                });
            }
        };

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(dir = %self.state_dir.display(), error = %err, "Skipping unreadable directory entry");
                    continue;
                }
            };
            let path = entry.path();
            if !path.is_file() || path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }
            let Some(worker_id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };

            match read_record(&path, worker_id) {
                Ok(record) => {
                    snapshot.insert(
                        worker_id.to_string(),
                        CollectedRecord {
                            record,
                            file_modified: file_modified(&path),
                        },
                    );
                }
                Err(err) => {
                    warn!(worker_id, error = %err, "Skipping unreadable state record");
                }
            }
        }

        Ok(snapshot)
    }
}
