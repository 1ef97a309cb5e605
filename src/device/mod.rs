//! Devices under test.
//!
//! A [`DeviceInstance`] is one configured emulator slot plus what the run
//! has learned about it. The [`DeviceBackend`] trait is the seam between
//! the lifecycle controller and the real emulator tooling; tests swap in a
//! recording backend with scripted faults.

mod emulator;

pub use emulator::EmulatorBackend;

use std::path::{Path, PathBuf};

use emu_console::{AgentError, ConsoleError, Redirect};
use serde::{Deserialize, Serialize};

use crate::config::{DeviceConfig, EmulatorConfig};
use crate::dispatch::UnresolvedPlaceholder;
use crate::supervisor::{ExitOutcome, LaunchError, ProcessId, Supervisor, SupervisorError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthState {
    NotStarted,
    Launched,
    Redirected,
    Healthy,
    Unhealthy,
    Stopped,
}

/// One emulator slot for the duration of a run.
#[derive(Debug, Clone)]
pub struct DeviceInstance {
    pub index: usize,
    pub config: DeviceConfig,
    pub health: HealthState,
    /// Current emulator process.
    pub process: Option<ProcessId>,
    pub logcat: Option<ProcessId>,
    /// OS pids of every emulator launched for this slot.
    pub launched_pids: Vec<u32>,
    /// Most recent console status report.
    pub status_report: Option<String>,
}

impl DeviceInstance {
    pub fn new(index: usize, config: DeviceConfig) -> Self {
        Self {
            index,
            config,
            health: HealthState::NotStarted,
            process: None,
            logcat: None,
            launched_pids: Vec::new(),
            status_report: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn device_id(&self) -> String {
        self.config.device_id()
    }

    /// Host-local agent ports forwarded to the agent inside the device.
    pub fn redirects(&self, emulator: &EmulatorConfig) -> [Redirect; 2] {
        [
            Redirect {
                local: self.config.agent_port1,
                device: emulator.device_agent_port1,
            },
            Redirect {
                local: self.config.agent_port2,
                device: emulator.device_agent_port2,
            },
        ]
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error("{device}: emulator command: {source}")]
    Command {
        device: String,
        #[source]
        source: UnresolvedPlaceholder,
    },

    #[error("{device}: port redirection failed: {source}")]
    Redirect {
        device: String,
        #[source]
        source: ConsoleError,
    },

    #[error("{device}: agent unreachable: {source}")]
    Agent {
        device: String,
        #[source]
        source: AgentError,
    },

    #[error("{device}: emulator exited early ({outcome})")]
    Exited { device: String, outcome: ExitOutcome },

    #[error("{device}: not launched")]
    NotLaunched { device: String },

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}

impl DeviceError {
    /// Launch failures end the run; everything else is worth a restart.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DeviceError::Launch(_) | DeviceError::Command { .. } | DeviceError::Supervisor(SupervisorError::Launch(_))
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error("{package}: {} not found", .path.display())]
    MissingArtifact { package: String, path: PathBuf },

    #[error("{device}: installing {package} failed ({outcome}): {output}")]
    Failed {
        device: String,
        package: String,
        outcome: String,
        output: String,
    },

    #[error("{device}: installing {package} timed out")]
    TimedOut { device: String, package: String },

    #[error("{device}: install command: {source}")]
    Command {
        device: String,
        #[source]
        source: UnresolvedPlaceholder,
    },

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}

/// Emulator operations the lifecycle controller drives, in call order.
///
/// Every method receives the run's supervisor so that processes a backend
/// starts are owned and cleaned up like every other child.
pub trait DeviceBackend {
    /// Claim the slot before anything is started.
    fn acquire(&mut self, device: &mut DeviceInstance) -> Result<(), DeviceError>;

    /// Start the emulator process.
    fn launch(&mut self, supervisor: &mut Supervisor, device: &mut DeviceInstance) -> Result<(), DeviceError>;

    /// Forward the agent ports through the emulator console.
    fn redirect(&mut self, supervisor: &mut Supervisor, device: &mut DeviceInstance) -> Result<(), DeviceError>;

    /// Kill a half-started emulator before the startup phase is retried.
    fn abort_start(&mut self, supervisor: &mut Supervisor, device: &mut DeviceInstance);

    fn check_health(&mut self, supervisor: &mut Supervisor, device: &mut DeviceInstance) -> Result<(), DeviceError>;

    /// Start the per-device log companion, if one is configured.
    fn start_log_capture(&mut self, supervisor: &mut Supervisor, device: &mut DeviceInstance) -> Result<(), DeviceError>;

    fn install(
        &mut self,
        supervisor: &mut Supervisor,
        device: &mut DeviceInstance,
        package: &str,
        path: &Path,
    ) -> Result<(), InstallError>;

    /// Log what the device looks like after its suite ended.
    fn collect_diagnostics(&mut self, supervisor: &mut Supervisor, device: &mut DeviceInstance);

    /// Stop everything started for `device`. Never fails.
    fn teardown(&mut self, supervisor: &mut Supervisor, device: &mut DeviceInstance);
}
