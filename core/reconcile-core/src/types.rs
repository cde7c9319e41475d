//! Data model shared by the collectors, the reconciler and the writer.
//!
//! On-disk records keep the field names the workers already write
//! (`bot_id`, `bot_name`, `last_update`, ...). Fields this crate does not model
//! are carried in [`StateRecord::extra`] so a rewrite never drops them.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

/// Longest invocation text kept as evidence on a [`ProcessFact`].
pub const INVOCATION_SUMMARY_LEN: usize = 200;

/// Live processes keyed by worker id. Iteration order is the key order, which
/// keeps mismatch ordering reproducible for identical inputs.
pub type ProcessSnapshot = BTreeMap<String, ProcessFact>;

/// Parsed state records keyed by worker id (the file stem).
pub type RecordSnapshot = BTreeMap<String, CollectedRecord>;

/// Worker status as written by the worker or by a corrective write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Running,
    Active,
    Initializing,
    Paused,
    Stopped,
    Error,
    Offline,
    #[default]
    #[serde(other)]
    Unknown,
}

impl WorkerStatus {
    /// `running` and `active` are the only statuses that claim a live process.
    pub fn claims_alive(self) -> bool {
        matches!(self, WorkerStatus::Running | WorkerStatus::Active)
    }

    pub fn color(self) -> &'static str {
        match self {
            WorkerStatus::Running | WorkerStatus::Active => "green",
            WorkerStatus::Initializing | WorkerStatus::Paused => "yellow",
            WorkerStatus::Stopped | WorkerStatus::Error => "red",
            WorkerStatus::Offline => "gray",
            WorkerStatus::Unknown => "yellow",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkerStatus::Running => "running",
            WorkerStatus::Active => "active",
            WorkerStatus::Initializing => "initializing",
            WorkerStatus::Paused => "paused",
            WorkerStatus::Stopped => "stopped",
            WorkerStatus::Error => "error",
            WorkerStatus::Offline => "offline",
            WorkerStatus::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether `worker_id` can name a record file: non-empty, no path separators,
/// no leading dot.
pub fn is_valid_worker_id(worker_id: &str) -> bool {
    !worker_id.trim().is_empty()
        && !worker_id.contains(['/', '\\'])
        && !worker_id.starts_with('.')
}

/// On-disk keys modelled by [`StateRecord`]. Everything else lands in `extra`.
const KNOWN_FIELDS: [&str; 9] = [
    "bot_id",
    "bot_name",
    "status",
    "status_color",
    "pid",
    "started_at",
    "last_update",
    "last_error",
    "reconciled",
];

/// Missing or wrongly-typed values read as the field's default.
fn read_as<T: DeserializeOwned + Default>(raw: Option<&Value>) -> T {
    raw.and_then(|value| T::deserialize(value).ok())
        .unwrap_or_default()
}

fn check<T: DeserializeOwned>(fields: &Map<String, Value>, key: &str) -> serde_json::Result<()> {
    if let Some(value) = fields.get(key) {
        T::deserialize(value)?;
    }
    Ok(())
}

/// Persisted last-known state of one worker.
///
/// Reading is lenient: any JSON object is a record, and a known field holding
/// a value of the wrong type reads as that field's default. Known fields keep
/// their on-disk form on rewrite unless their value changes, so a corrective
/// write touches only what it sets.
#[derive(Debug, Clone, PartialEq)]
pub struct StateRecord {
    /// `bot_id` on disk.
    pub worker_id: String,
    /// `bot_name` on disk.
    pub display_name: String,
    pub status: WorkerStatus,
    /// Derived from `status`; recomputed on every write.
    pub status_color: String,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_update: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub reconciled: bool,
    /// Worker-owned fields (pnl, position, version, ...) preserved verbatim.
    pub extra: Map<String, Value>,
    as_read: AsRead,
}

/// Known fields exactly as read. Ignored by equality.
#[derive(Debug, Clone, Default)]
struct AsRead(Map<String, Value>);

impl PartialEq for AsRead {
    fn eq(&self, _other: &Self) -> bool {
        true
    }
}

impl StateRecord {
    /// A fresh record for a worker nobody has written yet.
    pub fn new(worker_id: &str, status: WorkerStatus) -> Self {
        StateRecord {
            worker_id: worker_id.to_string(),
            display_name: display_name_for(worker_id),
            status,
            status_color: status.color().to_string(),
            pid: None,
            started_at: None,
            last_update: None,
            last_error: None,
            reconciled: false,
            extra: Map::new(),
            as_read: AsRead::default(),
        }
    }

    /// Builds a record from a JSON object. Never fails.
    pub fn from_fields(mut fields: Map<String, Value>) -> Self {
        let mut known = Map::new();
        for key in KNOWN_FIELDS {
            if let Some(value) = fields.remove(key) {
                known.insert(key.to_string(), value);
            }
        }

        StateRecord {
            worker_id: read_as(known.get("bot_id")),
            display_name: read_as(known.get("bot_name")),
            status: read_as(known.get("status")),
            status_color: read_as(known.get("status_color")),
            pid: read_as(known.get("pid")),
            started_at: read_as(known.get("started_at")),
            last_update: read_as(known.get("last_update")),
            last_error: read_as(known.get("last_error")),
            reconciled: read_as(known.get("reconciled")),
            extra: fields,
            as_read: AsRead(known),
        }
    }

    /// The record as a JSON object.
    pub fn to_fields(&self) -> serde_json::Result<Map<String, Value>> {
        let mut fields = self.extra.clone();
        self.put(&mut fields, "bot_id", &self.worker_id, false)?;
        self.put(&mut fields, "bot_name", &self.display_name, false)?;
        self.put(&mut fields, "status", &self.status, false)?;
        self.put(&mut fields, "status_color", &self.status_color, false)?;
        self.put(&mut fields, "pid", &self.pid, true)?;
        self.put(&mut fields, "started_at", &self.started_at, true)?;
        self.put(&mut fields, "last_update", &self.last_update, false)?;
        self.put(&mut fields, "last_error", &self.last_error, false)?;
        self.put(&mut fields, "reconciled", &self.reconciled, false)?;
        Ok(fields)
    }

    fn put<T>(
        &self,
        fields: &mut Map<String, Value>,
        key: &str,
        value: &T,
        omit_default: bool,
    ) -> serde_json::Result<()>
    where
        T: Serialize + DeserializeOwned + Default + PartialEq,
    {
        if let Some(raw) = self.as_read.0.get(key) {
            if read_as::<T>(Some(raw)) == *value {
                fields.insert(key.to_string(), raw.clone());
                return Ok(());
            }
        }
        if omit_default && *value == T::default() {
            fields.remove(key);
            return Ok(());
        }
        fields.insert(key.to_string(), serde_json::to_value(value)?);
        Ok(())
    }

    /// Strict type check for known keys in a worker-supplied update.
    pub fn check_fields(fields: &Map<String, Value>) -> serde_json::Result<()> {
        check::<String>(fields, "bot_id")?;
        check::<String>(fields, "bot_name")?;
        check::<Option<WorkerStatus>>(fields, "status")?;
        check::<Option<u32>>(fields, "pid")?;
        check::<Option<DateTime<Utc>>>(fields, "started_at")?;
        check::<Option<DateTime<Utc>>>(fields, "last_update")?;
        check::<Option<String>>(fields, "last_error")?;
        check::<bool>(fields, "reconciled")
    }

    /// Record synthesized for a live process that had no record.
    pub fn from_process(fact: &ProcessFact, now: DateTime<Utc>) -> Self {
        let mut record = StateRecord::new(&fact.worker_id, WorkerStatus::Running);
        record.pid = Some(fact.pid);
        record.started_at = fact.started_at;
        record.last_update = Some(now);
        record.reconciled = true;
        record
    }

    /// Sets `status` and keeps `status_color` in step with it.
    pub fn set_status(&mut self, status: WorkerStatus) {
        self.status = status;
        self.status_color = status.color().to_string();
    }

    /// The corrective rewrite for a record whose process is gone.
    /// Only `status`, `status_color`, `last_update` and `reconciled` change.
    pub fn mark_stopped(mut self, now: DateTime<Utc>) -> Self {
        self.set_status(WorkerStatus::Stopped);
        self.last_update = Some(now);
        self.reconciled = true;
        self
    }
}

impl Serialize for StateRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_fields()
            .map_err(<S::Error as serde::ser::Error>::custom)?
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for StateRecord {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Map::<String, Value>::deserialize(deserializer).map(StateRecord::from_fields)
    }
}

/// `btc_long_v1` → `Btc Long V1`.
pub fn display_name_for(worker_id: &str) -> String {
    worker_id
        .split('_')
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

/// A state record plus the file facts observed while collecting it.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectedRecord {
    pub record: StateRecord,
    pub file_modified: Option<DateTime<Utc>>,
}

/// Facts about one live worker process. Rebuilt every pass, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessFact {
    pub worker_id: String,
    pub pid: u32,
    pub started_at: Option<DateTime<Utc>>,
    /// Invocation text truncated to [`INVOCATION_SUMMARY_LEN`] characters.
    pub invocation: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MismatchKind {
    /// A worker process is alive but has no readable record.
    RunningNoRecord,
    /// The record claims the worker is alive but no process exists.
    RecordSaysRunningNoProcess,
    /// The process is alive but the record says otherwise. Never auto-fixed.
    RunningButRecordNotRunning,
}

impl MismatchKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MismatchKind::RunningNoRecord => "RUNNING_NO_RECORD",
            MismatchKind::RecordSaysRunningNoProcess => "RECORD_SAYS_RUNNING_NO_PROCESS",
            MismatchKind::RunningButRecordNotRunning => "RUNNING_BUT_RECORD_NOT_RUNNING",
        }
    }
}

impl std::fmt::Display for MismatchKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordEvidence {
    pub status: WorkerStatus,
    pub last_update: Option<DateTime<Utc>>,
    pub file_modified: Option<DateTime<Utc>>,
}

impl From<&CollectedRecord> for RecordEvidence {
    fn from(collected: &CollectedRecord) -> Self {
        RecordEvidence {
            status: collected.record.status,
            last_update: collected.record.last_update,
            file_modified: collected.file_modified,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MismatchEvidence {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process: Option<ProcessFact>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<RecordEvidence>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Mismatch {
    pub worker_id: String,
    pub kind: MismatchKind,
    pub evidence: MismatchEvidence,
}

/// Outcome of one reconciliation pass.
///
/// `healthy` is not stored: it is derived from `mismatches` whenever it is read
/// or serialized.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconciliationReport {
    pub timestamp: DateTime<Utc>,
    pub processes_found: usize,
    pub records_found: usize,
    pub mismatches: Vec<Mismatch>,
    pub fixed: BTreeSet<String>,
}

impl ReconciliationReport {
    pub fn healthy(&self) -> bool {
        self.mismatches.is_empty()
    }

    /// Mismatches that were not corrected in this pass.
    pub fn unresolved(&self) -> impl Iterator<Item = &Mismatch> {
        self.mismatches
            .iter()
            .filter(|m| !self.fixed.contains(&m.worker_id))
    }
}

#[derive(Serialize)]
struct ReportLine<'a> {
    timestamp: &'a DateTime<Utc>,
    processes_found: usize,
    records_found: usize,
    mismatches: &'a [Mismatch],
    fixed: &'a BTreeSet<String>,
    healthy: bool,
}

impl Serialize for ReconciliationReport {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        ReportLine {
            timestamp: &self.timestamp,
            processes_found: self.processes_found,
            records_found: self.records_found,
            mismatches: &self.mismatches,
            fixed: &self.fixed,
            healthy: self.healthy(),
        }
        .serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_name_title_cases_worker_id() {
        assert_eq!(display_name_for("btc_long_v1"), "Btc Long V1");
        assert_eq!(display_name_for("mm_15m"), "Mm 15m");
        assert_eq!(display_name_for("hummingbot"), "Hummingbot");
    }

    #[test]
    fn only_running_and_active_claim_alive() {
        assert!(WorkerStatus::Running.claims_alive());
        assert!(WorkerStatus::Active.claims_alive());
        for status in [
            WorkerStatus::Initializing,
            WorkerStatus::Paused,
            WorkerStatus::Stopped,
            WorkerStatus::Error,
            WorkerStatus::Offline,
            WorkerStatus::Unknown,
        ] {
            assert!(!status.claims_alive(), "{status} should not claim alive");
        }
    }

    #[test]
    fn unrecognized_and_null_status_read_as_unknown() {
        let record: StateRecord =
            serde_json::from_str(r#"{"bot_id": "x", "status": "warming_up"}"#).expect("parse");
        assert_eq!(record.status, WorkerStatus::Unknown);

        let record: StateRecord =
            serde_json::from_str(r#"{"bot_id": "x", "status": null}"#).expect("parse");
        assert_eq!(record.status, WorkerStatus::Unknown);

        let record: StateRecord = serde_json::from_str(r#"{"bot_id": "x"}"#).expect("parse");
        assert_eq!(record.status, WorkerStatus::Unknown);
    }

    #[test]
    fn extra_fields_survive_a_stop_rewrite() {
        let raw = r#"{
            "bot_id": "mm_15m",
            "bot_name": "Market Maker 15m",
            "status": "running",
            "status_color": "green",
            "pnl_total": 12.5,
            "position": {"side": "long", "size": 0.5},
            "last_update": "2026-01-31T00:00:00+00:00",
            "last_error": null
        }"#;
        let record: StateRecord = serde_json::from_str(raw).expect("parse");
        let now = Utc::now();
        let stopped = record.clone().mark_stopped(now);

        assert_eq!(stopped.status, WorkerStatus::Stopped);
        assert_eq!(stopped.status_color, "red");
        assert!(stopped.reconciled);
        assert_eq!(stopped.last_update, Some(now));
        assert_eq!(stopped.display_name, "Market Maker 15m");
        assert_eq!(stopped.extra, record.extra);

        let value = serde_json::to_value(&stopped).expect("serialize");
        assert_eq!(value["pnl_total"], serde_json::json!(12.5));
        assert_eq!(value["position"]["side"], "long");
        assert_eq!(value["bot_id"], "mm_15m");
    }

    #[test]
    fn wrongly_typed_known_fields_do_not_reject_the_record() {
        let record: StateRecord = serde_json::from_str(
            r#"{"bot_id": "mm_1h", "status": "running", "last_update": 1706659200.5, "pid": "abc"}"#,
        )
        .expect("any object is a record");
        assert_eq!(record.status, WorkerStatus::Running);
        assert_eq!(record.last_update, None);
        assert_eq!(record.pid, None);

        assert!(serde_json::from_str::<StateRecord>("[1, 2]").is_err());
        assert!(serde_json::from_str::<StateRecord>("\"running\"").is_err());
    }

    #[test]
    fn rewrite_keeps_untouched_fields_as_read() {
        let raw = r#"{
            "bot_id": "mm_1h",
            "status": "active",
            "pid": null,
            "started_at": "2026-01-31T08:00:00.123456+00:00",
            "last_update": 1706659200.5,
            "last_error": 17
        }"#;
        let record: StateRecord = serde_json::from_str(raw).expect("parse");
        let stopped = record.mark_stopped(Utc::now());
        let value = serde_json::to_value(&stopped).expect("serialize");

        assert_eq!(value["status"], "stopped");
        assert_eq!(value["status_color"], "red");
        assert_eq!(value["reconciled"], true);
        assert!(value["last_update"].is_string());
        assert_eq!(value["pid"], Value::Null);
        assert!(value.as_object().expect("object").contains_key("pid"));
        assert_eq!(value["started_at"], "2026-01-31T08:00:00.123456+00:00");
        assert_eq!(value["last_error"], 17);
    }

    #[test]
    fn changed_fields_are_written_typed() {
        let mut record: StateRecord =
            serde_json::from_str(r#"{"bot_id": "mm_1h", "status": "paused", "pid": "abc"}"#)
                .expect("parse");
        record.pid = Some(42);
        record.set_status(WorkerStatus::Running);

        let value = serde_json::to_value(&record).expect("serialize");
        assert_eq!(value["pid"], 42);
        assert_eq!(value["status"], "running");
    }

    #[test]
    fn check_fields_is_strict() {
        let ok: Map<String, Value> =
            serde_json::from_str(r#"{"status": "paused", "pid": null, "pnl": "n/a"}"#).expect("map");
        assert!(StateRecord::check_fields(&ok).is_ok());

        let bad: Map<String, Value> = serde_json::from_str(r#"{"pid": "abc"}"#).expect("map");
        assert!(StateRecord::check_fields(&bad).is_err());
    }

    #[test]
    fn worker_ids_must_be_file_stems() {
        assert!(is_valid_worker_id("btc_long_v1"));
        assert!(!is_valid_worker_id(""));
        assert!(!is_valid_worker_id("../escaped"));
        assert!(!is_valid_worker_id("a\\b"));
        assert!(!is_valid_worker_id(".hidden"));
    }

    #[test]
    fn report_serializes_derived_health() {
        let report = ReconciliationReport {
            timestamp: Utc::now(),
            processes_found: 0,
            records_found: 1,
            mismatches: vec![Mismatch {
                worker_id: "mm_1h".to_string(),
                kind: MismatchKind::RecordSaysRunningNoProcess,
                evidence: MismatchEvidence {
                    process: None,
                    record: None,
                },
            }],
            fixed: BTreeSet::new(),
        };
        let value = serde_json::to_value(&report).expect("serialize");
        assert_eq!(value["healthy"], false);
        assert_eq!(value["records_found"], 1);
        assert_eq!(value["mismatches"][0]["kind"], "RECORD_SAYS_RUNNING_NO_PROCESS");
        assert_eq!(value["fixed"], serde_json::json!([]));
    }
}
