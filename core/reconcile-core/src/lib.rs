//! # reconcile-core
//!
//! Keeps worker state records in step with the worker processes that are
//! actually running.
//!
//! ## Design Principles
//!
//! - **Synchronous**: No async runtime. A pass is a short sequential job.
//! - **Explicit configuration**: Every component takes its paths and timings
//!   from a [`ReconcileConfig`]; nothing reads global state.
//! - **Graceful degradation**: An unreadable process or corrupt record is
//!   skipped; only an unreadable state directory fails a pass.
//! - **Atomic records**: Writes go through a sidecar lock and a temp-file
//!   rename, so readers never see a half-written record.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use reconcile_core::{ReconcileConfig, ReconciliationLoop};
//!
//! let config = ReconcileConfig::from_home()?;
//! let runner = ReconciliationLoop::with_system_processes(config, true)?;
//! let report = runner.run_once()?;
//! std::process::exit(if report.healthy() { 0 } else { 1 });
//! ```

pub mod config;
pub mod error;
pub mod identity;
pub mod lock;
pub mod process;
pub mod reconciler;
pub mod records;
pub mod report_log;
pub mod runner;
pub mod types;
pub mod writer;

pub use config::ReconcileConfig;
pub use error::{ReconcileError, Result};
pub use identity::{default_rules, IdentityRule, IdentityTable};
pub use process::{
    ProcessSnapshotCollector, ProcessSource, RawProcess, StaticProcessSource,
    SysinfoProcessSource,
};
pub use reconciler::{diff, Reconciler};
pub use records::FileStateCollector;
pub use report_log::ReportLog;
pub use runner::{ReconciliationLoop, StopSignal};
pub use types::*;
pub use writer::{StateWriter, WorkerState};
