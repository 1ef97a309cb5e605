//! Emulator test orchestrator.
//!
//! Boots a fixed set of emulated devices, forwards their agent ports,
//! installs the artifact under test, runs one test suite per device in
//! parallel as child processes, classifies each suite's output into a
//! severity, and tears every device down again. The run ends with a
//! `run_summary.json` and an exit code CI understands.
//!
//! Entry point: [`lifecycle::Controller`].

pub mod config;
pub mod context;
pub mod device;
pub mod dispatch;
pub mod lifecycle;
pub mod mock;
pub mod signal;
pub mod summary;
pub mod supervisor;
pub mod timeout;

pub use config::{ConfigError, HarnessConfig};
pub use context::RunContext;
pub use emu_classifier::{CiStatus, Classification, Classifier, Severity};
pub use lifecycle::{Controller, LifecycleError, LifecycleState, RunReport};
pub use summary::RunSummary;
