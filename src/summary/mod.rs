//! Run results: per-suite records, phase outcomes and run_summary.json.

mod failure;
mod run_summary;
mod suite_summary;

pub use failure::FailureKind;
pub use run_summary::{
    DeviceSummary, PhaseOutcome, RunSummary, RUN_SUMMARY_FILE, RUN_SUMMARY_SCHEMA_ID, RUN_SUMMARY_SCHEMA_VERSION,
};
pub use suite_summary::{SuiteStatus, SuiteSummary};
