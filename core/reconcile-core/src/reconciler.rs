//! Drift detection between live processes and persisted records.
//!
//! # Rules (evaluated in this order)
//!
//! | # | Process | Record                    | Mismatch                          | Auto-fix          |
//! |---|---------|---------------------------|-----------------------------------|-------------------|
//! | 1 | yes     | none                      | `RUNNING_NO_RECORD`               | create `running`  |
//! | 2 | no      | `running` / `active`      | `RECORD_SAYS_RUNNING_NO_PROCESS`  | rewrite `stopped` |
//! | 3 | yes     | anything else             | `RUNNING_BUT_RECORD_NOT_RUNNING`  | never             |
//!
//! Rule 3 is report-only: a deliberately paused worker looks exactly like a
//! stale record, and overwriting it would undo the pause.
//!
//! [`diff`] is pure. [`Reconciler::reconcile`] adds the corrective writes.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::types::{
    Mismatch, MismatchEvidence, MismatchKind, ProcessFact, ProcessSnapshot, RecordEvidence,
    RecordSnapshot, ReconciliationReport, StateRecord,
};
use crate::writer::StateWriter;

/// Computes mismatches for two snapshots. Category 1 entries come first, then
/// category 2, then category 3; within a category, key order of the source map.
pub fn diff(processes: &ProcessSnapshot, records: &RecordSnapshot) -> Vec<Mismatch> {
    let mut mismatches = Vec::new();

    for (worker_id, fact) in processes {
        if !records.contains_key(worker_id) {
            mismatches.push(Mismatch {
                worker_id: worker_id.clone(),
                kind: MismatchKind::RunningNoRecord,
                evidence: MismatchEvidence {
                    process: Some(fact.clone()),
                    record: None,
                },
            });
        }
    }

    for (worker_id, collected) in records {
        if !processes.contains_key(worker_id) && collected.record.status.claims_alive() {
            mismatches.push(Mismatch {
                worker_id: worker_id.clone(),
                kind: MismatchKind::RecordSaysRunningNoProcess,
                evidence: MismatchEvidence {
                    process: None,
                    record: Some(RecordEvidence::from(collected)),
                },
            });
        }
    }

    for (worker_id, fact) in processes {
        if let Some(collected) = records.get(worker_id) {
            if !collected.record.status.claims_alive() {
                mismatches.push(Mismatch {
                    worker_id: worker_id.clone(),
                    kind: MismatchKind::RunningButRecordNotRunning,
                    evidence: MismatchEvidence {
                        process: Some(fact.clone()),
                        record: Some(RecordEvidence::from(collected)),
                    },
                });
            }
        }
    }

    mismatches
}

pub struct Reconciler<'a> {
    writer: &'a StateWriter,
}

impl<'a> Reconciler<'a> {
    pub fn new(writer: &'a StateWriter) -> Self {
        Reconciler { writer }
    }

    /// Diffs the snapshots and, when `auto_fix` is set, applies the corrective
    /// writes for categories 1 and 2.
    ///
    /// A worker enters `fixed` only when its corrective write happened. A
    /// failed write is logged and the pass carries on.
    pub fn reconcile(
        &self,
        processes: &ProcessSnapshot,
        records: &RecordSnapshot,
        auto_fix: bool,
    ) -> ReconciliationReport {
        let timestamp = Utc::now();
        let mismatches = diff(processes, records);
        let mut fixed = BTreeSet::new();

        if auto_fix {
            for mismatch in &mismatches {
                let outcome = match mismatch.kind {
                    MismatchKind::RunningNoRecord => match processes.get(&mismatch.worker_id) {
                        Some(fact) => self.create_running(&mismatch.worker_id, fact, timestamp),
                        None => continue,
                    },
                    MismatchKind::RecordSaysRunningNoProcess => {
                        match records.get(&mismatch.worker_id) {
                            Some(collected) => {
                                self.mark_stopped(&mismatch.worker_id, &collected.record, timestamp)
                            }
                            None => continue,
                        }
                    }
                    MismatchKind::RunningButRecordNotRunning => continue,
                };

                match outcome {
                    Ok(false) => {
                        debug!(
                            worker_id = %mismatch.worker_id,
                            kind = %mismatch.kind,
                            "Record changed since the snapshot; nothing written"
                        );
                    }
                    Ok(true) => {
                        info!(
                            worker_id = %mismatch.worker_id,
                            kind = %mismatch.kind,
                            "Corrected state record"
                        );
                        fixed.insert(mismatch.worker_id.clone());
                    }
                    Err(err) => {
                        warn!(
                            worker_id = %mismatch.worker_id,
                            kind = %mismatch.kind,
                            error = %err,
                            "Failed to correct state record"
                        );
                    }
                }
            }
        }

        ReconciliationReport {
            timestamp,
            processes_found: processes.len(),
            records_found: records.len(),
            mismatches,
            fixed,
        }
    }

    /// Writes a `running` record for `fact`. A record the worker wrote since
    /// the snapshot is kept; an unparseable file is replaced.
    fn create_running(
        &self,
        worker_id: &str,
        fact: &ProcessFact,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.writer
            .create_if_absent(worker_id, &StateRecord::from_process(fact, now))
    }

    fn mark_stopped(
        &self,
        worker_id: &str,
        snapshot: &StateRecord,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.writer
            .modify(worker_id, |current| {
                let record = current.unwrap_or_else(|| snapshot.clone());
                if record.status.claims_alive() {
                    Ok(Some(record.mark_stopped(now)))
                } else {
                    // Already corrected by the worker since the snapshot.
                    Ok(None)
                }
            })
            .map(|written| written.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CollectedRecord, WorkerStatus};

    fn fact(worker_id: &str, pid: u32) -> ProcessFact {
        ProcessFact {
            worker_id: worker_id.to_string(),
            pid,
            started_at: None,
            invocation: format!("python3 {}.py", worker_id),
        }
    }

    fn record(worker_id: &str, status: WorkerStatus) -> CollectedRecord {
        CollectedRecord {
            record: StateRecord::new(worker_id, status),
            file_modified: None,
        }
    }

    #[test]
    fn diff_orders_by_category_then_key() {
        let processes: ProcessSnapshot = [
            ("zeta".to_string(), fact("zeta", 3)),
            ("alpha".to_string(), fact("alpha", 1)),
            ("paused_one".to_string(), fact("paused_one", 2)),
        ]
        .into_iter()
        .collect();
        let records: RecordSnapshot = [
            ("paused_one".to_string(), record("paused_one", WorkerStatus::Paused)),
            ("gone_b".to_string(), record("gone_b", WorkerStatus::Active)),
            ("gone_a".to_string(), record("gone_a", WorkerStatus::Running)),
            ("idle".to_string(), record("idle", WorkerStatus::Stopped)),
        ]
        .into_iter()
        .collect();

        let summary: Vec<(String, MismatchKind)> = diff(&processes, &records)
            .into_iter()
            .map(|m| (m.worker_id, m.kind))
            .collect();

        assert_eq!(
            summary,
            vec![
                ("alpha".to_string(), MismatchKind::RunningNoRecord),
                ("zeta".to_string(), MismatchKind::RunningNoRecord),
                ("gone_a".to_string(), MismatchKind::RecordSaysRunningNoProcess),
                ("gone_b".to_string(), MismatchKind::RecordSaysRunningNoProcess),
                ("paused_one".to_string(), MismatchKind::RunningButRecordNotRunning),
            ]
        );
    }

    #[test]
    fn diff_ignores_consistent_workers() {
        let processes: ProcessSnapshot =
            [("mm_1h".to_string(), fact("mm_1h", 10))].into_iter().collect();
        let records: RecordSnapshot = [
            ("mm_1h".to_string(), record("mm_1h", WorkerStatus::Active)),
            ("old".to_string(), record("old", WorkerStatus::Error)),
            ("odd".to_string(), record("odd", WorkerStatus::Unknown)),
        ]
        .into_iter()
        .collect();

        assert!(diff(&processes, &records).is_empty());
    }

    #[test]
    fn diff_carries_evidence() {
        let processes: ProcessSnapshot =
            [("doge_short_v1".to_string(), fact("doge_short_v1", 9))].into_iter().collect();
        let records: RecordSnapshot = [(
            "doge_short_v1".to_string(),
            record("doge_short_v1", WorkerStatus::Paused),
        )]
        .into_iter()
        .collect();

        let mismatches = diff(&processes, &records);
        assert_eq!(mismatches.len(), 1);
        let evidence = &mismatches[0].evidence;
        assert_eq!(evidence.process.as_ref().map(|p| p.pid), Some(9));
        assert_eq!(
            evidence.record.as_ref().map(|r| r.status),
            Some(WorkerStatus::Paused)
        );
    }

    #[test]
    fn concurrent_worker_write_is_not_counted_as_fixed() {
        let temp = tempfile::tempdir().expect("temp dir");
        let writer = StateWriter::new(&crate::config::ReconcileConfig::with_root(temp.path()));
        let processes: ProcessSnapshot =
            [("mm_1h".to_string(), fact("mm_1h", 10))].into_iter().collect();
        let stale: RecordSnapshot =
            [("mm_15m".to_string(), record("mm_15m", WorkerStatus::Running))]
                .into_iter()
                .collect();
        // Both workers wrote their own records after the snapshots were taken.
        writer
            .write("mm_1h", &StateRecord::new("mm_1h", WorkerStatus::Paused))
            .expect("worker write");
        writer
            .write("mm_15m", &StateRecord::new("mm_15m", WorkerStatus::Stopped))
            .expect("worker write");

        let report = Reconciler::new(&writer).reconcile(&processes, &stale, true);

        assert_eq!(report.mismatches.len(), 2);
        assert!(report.fixed.is_empty());
        assert_eq!(
            writer.read("mm_1h").expect("read").map(|r| r.status),
            Some(WorkerStatus::Paused)
        );
        assert_eq!(
            writer.read("mm_15m").expect("read").map(|r| r.reconciled),
            Some(false)
        );
    }
}
