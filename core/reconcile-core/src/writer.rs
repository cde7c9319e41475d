//! Crash-safe, lock-serialized persistence of state records.
//!
//! # Write Path
//!
//! 1. Take the sidecar lock for the record ([`LockGuard`]), bounded by the
//!    configured timeout.
//! 2. Serialize the full record into a temp file in the same directory.
//! 3. Flush, sync, and rename it over the record.
//! 4. Drop the guard, releasing the lock on every exit path.
//!
//! Readers therefore see either the old file or the new one, never a mix.
//! Workers should write through [`WorkerState`] so they take the same lock.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use fs_err as fs;
use serde_json::{Map, Value};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::config::ReconcileConfig;
use crate::error::{ReconcileError, Result};
use crate::lock::LockGuard;
use crate::records::read_record;
use crate::types::{is_valid_worker_id, StateRecord, WorkerStatus};

#[derive(Debug, Clone)]
pub struct StateWriter {
    state_dir: PathBuf,
    lock_timeout: Duration,
    lock_poll: Duration,
}

impl StateWriter {
    pub fn new(config: &ReconcileConfig) -> Self {
        StateWriter {
            state_dir: config.state_dir().to_path_buf(),
            lock_timeout: config.lock_timeout,
            lock_poll: config.lock_poll,
        }
    }

    pub fn record_path(&self, worker_id: &str) -> PathBuf {
        self.state_dir.join(format!("{}.json", worker_id))
    }

    /// Replaces the record for `worker_id` with `record`.
    pub fn write(&self, worker_id: &str, record: &StateRecord) -> Result<()> {
        self.with_lock(worker_id, |path| {
            let mut record = record.clone();
            record.worker_id = worker_id.to_string();
            record.status_color = record.status.color().to_string();
            persist(path, &record)
        })?;
        debug!(worker_id, status = %record.status, "State record written");
        Ok(())
    }

    /// Writes `record` unless a readable record already exists.
    ///
    /// A file that exists but is not a JSON object counts as no record and is
    /// replaced. Returns whether anything was written.
    pub fn create_if_absent(&self, worker_id: &str, record: &StateRecord) -> Result<bool> {
        let created = self.with_lock(worker_id, |path| {
            if path.exists() {
                match read_record(path, worker_id) {
                    Ok(_) => return Ok(false),
                    Err(ReconcileError::Json { source, .. }) => {
                        warn!(worker_id, error = %source, "Replacing unparseable state record");
                    }
                    Err(err) => return Err(err),
                }
            }
            let mut record = record.clone();
            record.worker_id = worker_id.to_string();
            record.status_color = record.status.color().to_string();
            persist(path, &record)?;
            Ok(true)
        })?;
        if created {
            debug!(worker_id, status = %record.status, "State record created");
        }
        Ok(created)
    }

    /// Read-modify-write under the record lock.
    ///
    /// `apply` receives the current record (`None` if the file is missing) and
    /// returns the full replacement. A record that exists but cannot be parsed
    /// fails the update rather than being overwritten.
    pub fn update<F>(&self, worker_id: &str, apply: F) -> Result<StateRecord>
    where
        F: FnOnce(Option<StateRecord>) -> Result<StateRecord>,
    {
        self.modify(worker_id, |current| apply(current).map(Some))?
            .ok_or_else(|| {
                ReconcileError::io(
                    format!("Update of {} produced no record", worker_id),
                    std::io::Error::from(std::io::ErrorKind::InvalidData),
                )
            })
    }

    /// Like [`StateWriter::update`], but `apply` may return `None` to leave the
    /// file untouched. Returns the record that was written, if any.
    pub fn modify<F>(&self, worker_id: &str, apply: F) -> Result<Option<StateRecord>>
    where
        F: FnOnce(Option<StateRecord>) -> Result<Option<StateRecord>>,
    {
        let written = self.with_lock(worker_id, |path| {
            let current = if path.exists() {
                Some(read_record(path, worker_id)?)
            } else {
                None
            };

            let Some(mut record) = apply(current)? else {
                return Ok(None);
            };
            record.worker_id = worker_id.to_string();
            record.status_color = record.status.color().to_string();
            persist(path, &record)?;
            Ok(Some(record))
        })?;
        if let Some(record) = &written {
            debug!(worker_id, status = %record.status, "State record updated");
        }
        Ok(written)
    }

    fn with_lock<T>(&self, worker_id: &str, body: impl FnOnce(&Path) -> Result<T>) -> Result<T> {
        check_worker_id(worker_id)?;
        self.ensure_state_dir()?;
        let path = self.record_path(worker_id);
        let _guard = LockGuard::acquire(&path, self.lock_timeout, self.lock_poll)?;
        body(&path)
    }

    /// Reads the current record without taking the lock. Safe because writes
    /// are atomic renames.
    pub fn read(&self, worker_id: &str) -> Result<Option<StateRecord>> {
        check_worker_id(worker_id)?;
        let path = self.record_path(worker_id);
        if !path.exists() {
            return Ok(None);
        }
        read_record(&path, worker_id).map(Some)
    }

    fn ensure_state_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.state_dir)
            .map_err(|err| ReconcileError::io("Failed to create state directory", err))
    }
}

fn check_worker_id(worker_id: &str) -> Result<()> {
    if is_valid_worker_id(worker_id) {
        Ok(())
    } else {
        Err(ReconcileError::InvalidWorkerId {
            worker_id: worker_id.to_string(),
        })
    }
}

fn persist(path: &Path, record: &StateRecord) -> Result<()> {
    let content = serde_json::to_string_pretty(record)
        .map_err(|err| ReconcileError::json("Failed to serialize state record", err))?;

    let parent_dir = path.parent().ok_or_else(|| {
        ReconcileError::io(
            "State record path has no parent directory",
            std::io::Error::from(std::io::ErrorKind::InvalidInput),
        )
    })?;
    let mut temp_file = NamedTempFile::new_in(parent_dir)
        .map_err(|err| ReconcileError::io("Failed to create temp state file", err))?;
    temp_file
        .write_all(content.as_bytes())
        .map_err(|err| ReconcileError::io("Failed to write temp state file", err))?;
    temp_file
        .flush()
        .map_err(|err| ReconcileError::io("Failed to flush temp state file", err))?;
    temp_file
        .as_file()
        .sync_all()
        .map_err(|err| ReconcileError::io("Failed to sync temp state file", err))?;
    temp_file
        .persist(path)
        .map_err(|err| ReconcileError::io("Failed to replace state record", err.error))?;
    Ok(())
}

/// Worker-side handle for publishing a worker's own state.
///
/// Goes through the same lock as the reconciler, so a worker update and a
/// corrective write never interleave.
#[derive(Debug, Clone)]
pub struct WorkerState {
    worker_id: String,
    display_name: Option<String>,
    writer: StateWriter,
}

impl WorkerState {
    pub fn new(writer: StateWriter, worker_id: impl Into<String>) -> Self {
        WorkerState {
            worker_id: worker_id.into(),
            display_name: None,
            writer,
        }
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Merges `fields` into the record. Known keys (`status`, `pid`, ...) update
    /// the typed fields; anything else lands in the worker's extra fields.
    /// `last_update` is always set to now and `reconciled` is cleared.
    pub fn update(&self, fields: Map<String, Value>) -> Result<StateRecord> {
        StateRecord::check_fields(&fields)
            .map_err(|err| ReconcileError::json("Invalid state fields", err))?;
        let worker_id = self.worker_id.clone();
        let display_name = self.display_name.clone();
        self.writer.update(&self.worker_id, move |current| {
            let base = current.unwrap_or_else(|| {
                let mut fresh = StateRecord::new(&worker_id, WorkerStatus::Initializing);
                if let Some(name) = &display_name {
                    fresh.display_name = name.clone();
                }
                fresh
            });

            let mut merged = base
                .to_fields()
                .map_err(|err| ReconcileError::json("Failed to encode state record", err))?;
            merged.extend(fields);
            merged.remove("status_color");

            let mut record = StateRecord::from_fields(merged);
            record.last_update = Some(Utc::now());
            record.reconciled = false;
            Ok(record)
        })
    }

    pub fn set_status(&self, status: WorkerStatus) -> Result<StateRecord> {
        let mut fields = Map::new();
        fields.insert("status".to_string(), Value::String(status.as_str().to_string()));
        self.update(fields)
    }

    pub fn set_running(&self, pid: Option<u32>) -> Result<StateRecord> {
        let mut fields = Map::new();
        fields.insert("status".to_string(), Value::from("running"));
        if let Some(pid) = pid {
            fields.insert("pid".to_string(), Value::from(pid));
        }
        self.update(fields)
    }

    pub fn set_paused(&self) -> Result<StateRecord> {
        self.set_status(WorkerStatus::Paused)
    }

    pub fn set_stopped(&self) -> Result<StateRecord> {
        self.set_status(WorkerStatus::Stopped)
    }

    pub fn set_error(&self, message: &str) -> Result<StateRecord> {
        let mut fields = Map::new();
        fields.insert("status".to_string(), Value::from("error"));
        fields.insert("last_error".to_string(), Value::from(message));
        self.update(fields)
    }

    pub fn get(&self) -> Result<Option<StateRecord>> {
        self.writer.read(&self.worker_id)
    }
}
