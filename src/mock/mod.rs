//! Test doubles for devices.
//!
//! - [`MockConsole`] / [`MockAgent`]: TCP servers speaking the emulator
//!   console and device agent protocols, for driving the real backend
//! - [`RecordingBackend`]: a [`crate::device::DeviceBackend`] that records
//!   calls and fails where told to
//! - [`FailureInjector`]: scripted faults with fail counts

mod backend;
mod console;
mod failure;

pub use backend::{BackendCall, CallLog, RecordingBackend};
pub use console::{MockAgent, MockConsole};
pub use failure::{FailureConfig, FailureInjector, FaultPoint};
