//! Report rendering for stdout.

use reconcile_core::ReconciliationReport;

const RULE: &str = "============================================================";

/// Multi-line report for humans.
pub fn render_human(report: &ReconciliationReport) -> String {
    let mut out = String::new();
    out.push_str(RULE);
    out.push('\n');
    out.push_str("STATE RECONCILIATION REPORT\n");
    out.push_str(RULE);
    out.push('\n');
    out.push_str(&format!("Timestamp: {}\n", report.timestamp.to_rfc3339()));
    out.push_str(&format!("Processes Found: {}\n", report.processes_found));
    out.push_str(&format!("State Files Found: {}\n", report.records_found));

    if report.healthy() {
        out.push_str("\n✓ All states reconciled\n");
    } else {
        out.push_str(&format!(
            "\n⚠ {} mismatch(es) found:\n",
            report.mismatches.len()
        ));
        for mismatch in &report.mismatches {
            out.push_str(&format!("  - {}: {}\n", mismatch.worker_id, mismatch.kind));
        }
    }

    if !report.fixed.is_empty() {
        let fixed: Vec<&str> = report.fixed.iter().map(String::as_str).collect();
        out.push_str(&format!("\nFixed: {}\n", fixed.join(", ")));
    }

    out.push_str(RULE);
    out
}

/// JSON report. Pretty for a single pass, one line per pass in daemon mode.
pub fn render_json(report: &ReconciliationReport, pretty: bool) -> Result<String, String> {
    let rendered = if pretty {
        serde_json::to_string_pretty(report)
    } else {
        serde_json::to_string(report)
    };
    rendered.map_err(|err| format!("Failed to serialize report: {}", err))
}
