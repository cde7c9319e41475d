//! reconcile-state: compares running worker processes with their persisted
//! state records and reports (or fixes) any drift.
//!
//! Exit status is 0 when the last pass found nothing unresolved, 1 otherwise.

mod logging;
mod output;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use reconcile_core::{ReconcileConfig, ReconciliationLoop, ReconciliationReport, StopSignal};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "reconcile-state")]
#[command(about = "Reconcile worker state records with running processes")]
#[command(version)]
struct Cli {
    /// Keep running, one pass per interval
    #[arg(long)]
    daemon: bool,

    /// Apply corrective writes for fixable mismatches
    #[arg(long)]
    fix: bool,

    /// Print reports as JSON
    #[arg(long)]
    json: bool,

    /// Workspace root (defaults to ~/.openclaw/workspace)
    #[arg(long, value_name = "DIR")]
    root: Option<PathBuf>,

    /// Config file (defaults to <root>/reconcile.toml)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Seconds between passes in daemon mode
    #[arg(long, value_name = "SECS")]
    interval: Option<u64>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let root = match &cli.root {
        Some(root) => root.clone(),
        None => match ReconcileConfig::from_home() {
            Ok(config) => config.workspace_root().to_path_buf(),
            Err(err) => {
                eprintln!("reconcile-state: {}", err);
                return ExitCode::FAILURE;
            }
        },
    };

    let _logging_guard = logging::init(&root.join("logs"));

    match run(&cli, root) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            error!(error = %err, "Reconciliation failed");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli, root: PathBuf) -> Result<bool, String> {
    let mut config =
        ReconcileConfig::load(root, cli.config.as_deref()).map_err(|err| err.to_string())?;
    if let Some(secs) = cli.interval {
        if secs == 0 {
            return Err("--interval must be greater than zero".to_string());
        }
        config = config.with_interval(Duration::from_secs(secs));
    }

    let interval_secs = config.interval.as_secs();
    let runner =
        ReconciliationLoop::with_system_processes(config, cli.fix).map_err(|err| err.to_string())?;

    if !cli.daemon {
        let report = runner.run_once().map_err(|err| err.to_string())?;
        print_report(&report, cli.json, true)?;
        return Ok(report.healthy());
    }

    info!(
        interval_secs,
        fix = cli.fix,
        state_dir = %runner.config().state_dir().display(),
        "Starting state reconciliation daemon"
    );
    if !cli.json {
        println!(
            "Starting state reconciliation daemon (interval: {}s)",
            interval_secs
        );
    }

    // Runs until the process is killed.
    let stop = StopSignal::new();
    let healthy = runner.run_continuous(&stop, |result| {
        if let Ok(report) = result {
            if let Err(err) = print_report(report, cli.json, false) {
                error!(error = %err, "Failed to print report");
            }
        }
    });
    Ok(healthy)
}

fn print_report(report: &ReconciliationReport, json: bool, pretty: bool) -> Result<(), String> {
    if json {
        println!("{}", output::render_json(report, pretty)?);
    } else {
        println!("{}", output::render_human(report));
    }
    Ok(())
}
