//! Recording device backend.
//!
//! Stands in for real emulators: each "emulator" is a long `sleep` owned by
//! the run's supervisor, so process cleanup is exercised for real. Every
//! call is appended to a shared log, and faults are scripted through a
//! [`FailureInjector`].

use std::path::Path;
use std::sync::{Arc, Mutex};

use emu_console::ConsoleError;

use super::failure::{FailureConfig, FailureInjector, FaultPoint};
use crate::device::{DeviceBackend, DeviceError, DeviceInstance, HealthState, InstallError};
use crate::supervisor::{LaunchSpec, Supervisor};

/// Binary that cannot exist, for fatal launch faults.
const MISSING_BINARY: &str = "/nonexistent/emu-harness-mock-emulator";

/// One backend call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    Acquire(String),
    Launch(String),
    Redirect(String),
    AbortStart(String),
    CheckHealth(String),
    StartLogCapture(String),
    Install { device: String, package: String },
    CollectDiagnostics(String),
    Teardown(String),
}

impl BackendCall {
    pub fn device(&self) -> &str {
        match self {
            BackendCall::Acquire(d)
            | BackendCall::Launch(d)
            | BackendCall::Redirect(d)
            | BackendCall::AbortStart(d)
            | BackendCall::CheckHealth(d)
            | BackendCall::StartLogCapture(d)
            | BackendCall::CollectDiagnostics(d)
            | BackendCall::Teardown(d) => d,
            BackendCall::Install { device, .. } => device,
        }
    }
}

/// Shared view of what a [`RecordingBackend`] was asked to do.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<BackendCall>>>);

impl CallLog {
    fn push(&self, call: BackendCall) {
        if let Ok(mut calls) = self.0.lock() {
            calls.push(call);
        }
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.0.lock().map(|c| c.to_vec()).unwrap_or_default()
    }

    pub fn count(&self, pred: impl Fn(&BackendCall) -> bool) -> usize {
        self.calls().iter().filter(|c| pred(c)).count()
    }

    pub fn teardowns(&self, device: &str) -> usize {
        self.count(|c| matches!(c, BackendCall::Teardown(d) if d == device))
    }
}

#[derive(Debug, Default)]
pub struct RecordingBackend {
    log: CallLog,
    failures: Arc<Mutex<FailureInjector>>,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle on the call log that outlives the backend.
    pub fn log(&self) -> CallLog {
        self.log.clone()
    }

    /// Handle for scripting faults.
    pub fn failures(&self) -> Arc<Mutex<FailureInjector>> {
        Arc::clone(&self.failures)
    }

    fn fault(&self, point: FaultPoint, device: &DeviceInstance, package: Option<&str>) -> Option<FailureConfig> {
        self.failures
            .lock()
            .ok()
            .and_then(|mut f| f.check(point, device.name(), package))
    }
}

impl DeviceBackend for RecordingBackend {
    fn acquire(&mut self, device: &mut DeviceInstance) -> Result<(), DeviceError> {
        self.log.push(BackendCall::Acquire(device.name().to_string()));
        if self.fault(FaultPoint::Acquire, device, None).is_some() {
            return Err(DeviceError::NotLaunched {
                device: device.name().to_string(),
            });
        }
        Ok(())
    }

    fn launch(&mut self, supervisor: &mut Supervisor, device: &mut DeviceInstance) -> Result<(), DeviceError> {
        self.log.push(BackendCall::Launch(device.name().to_string()));
        let argv = match self.fault(FaultPoint::Launch, device, None) {
            Some(fault) if fault.fatal => vec![MISSING_BINARY.to_string()],
            Some(_) => {
                return Err(DeviceError::NotLaunched {
                    device: device.name().to_string(),
                })
            }
            None => vec!["sleep".to_string(), "30".to_string()],
        };
        let id = supervisor.launch(LaunchSpec::new(format!("emulator:{}", device.name()), argv))?;
        device.launched_pids.push(supervisor.pid(id)?);
        device.process = Some(id);
        device.health = HealthState::Launched;
        Ok(())
    }

    fn redirect(&mut self, _supervisor: &mut Supervisor, device: &mut DeviceInstance) -> Result<(), DeviceError> {
        self.log.push(BackendCall::Redirect(device.name().to_string()));
        if let Some(fault) = self.fault(FaultPoint::Redirect, device, None) {
            return Err(DeviceError::Redirect {
                device: device.name().to_string(),
                source: ConsoleError::Protocol {
                    expected: emu_console::console::OK_MARKER.to_string(),
                    got: fault.message,
                },
            });
        }
        device.health = HealthState::Redirected;
        Ok(())
    }

    fn abort_start(&mut self, supervisor: &mut Supervisor, device: &mut DeviceInstance) {
        self.log.push(BackendCall::AbortStart(device.name().to_string()));
        if let Some(id) = device.process.take() {
            let _ = supervisor.terminate(id);
        }
        device.health = HealthState::NotStarted;
    }

    fn check_health(&mut self, supervisor: &mut Supervisor, device: &mut DeviceInstance) -> Result<(), DeviceError> {
        self.log.push(BackendCall::CheckHealth(device.name().to_string()));
        if let Some(id) = device.process {
            if let Some(outcome) = supervisor.poll(id)? {
                return Err(DeviceError::Exited {
                    device: device.name().to_string(),
                    outcome,
                });
            }
        }
        if self.fault(FaultPoint::Health, device, None).is_some() {
            device.health = HealthState::Unhealthy;
            return Err(DeviceError::NotLaunched {
                device: device.name().to_string(),
            });
        }
        device.health = HealthState::Healthy;
        Ok(())
    }

    fn start_log_capture(&mut self, _supervisor: &mut Supervisor, device: &mut DeviceInstance) -> Result<(), DeviceError> {
        self.log.push(BackendCall::StartLogCapture(device.name().to_string()));
        Ok(())
    }

    fn install(
        &mut self,
        _supervisor: &mut Supervisor,
        device: &mut DeviceInstance,
        package: &str,
        path: &Path,
    ) -> Result<(), InstallError> {
        self.log.push(BackendCall::Install {
            device: device.name().to_string(),
            package: package.to_string(),
        });
        if let Some(fault) = self.fault(FaultPoint::Install, device, Some(package)) {
            return Err(InstallError::Failed {
                device: device.name().to_string(),
                package: package.to_string(),
                outcome: "exit code 1".to_string(),
                output: format!("{} ({})", fault.message, path.display()),
            });
        }
        Ok(())
    }

    fn collect_diagnostics(&mut self, _supervisor: &mut Supervisor, device: &mut DeviceInstance) {
        self.log.push(BackendCall::CollectDiagnostics(device.name().to_string()));
    }

    fn teardown(&mut self, supervisor: &mut Supervisor, device: &mut DeviceInstance) {
        self.log.push(BackendCall::Teardown(device.name().to_string()));
        if let Some(id) = device.process {
            let _ = supervisor.terminate(id);
        }
        device.health = HealthState::Stopped;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::SAMPLE;
    use crate::config::HarnessConfig;
    use std::time::Duration;

    fn device() -> DeviceInstance {
        let config = HarnessConfig::parse(SAMPLE).unwrap();
        DeviceInstance::new(0, config.devices[0].clone())
    }

    #[test]
    fn test_launch_and_teardown_are_recorded() {
        let mut backend = RecordingBackend::new();
        let log = backend.log();
        let mut sup = Supervisor::new(Duration::from_secs(1));
        let mut dev = device();

        backend.launch(&mut sup, &mut dev).unwrap();
        assert_eq!(sup.running().len(), 1);
        backend.teardown(&mut sup, &mut dev);
        assert!(sup.running().is_empty());
        assert_eq!(
            log.calls(),
            vec![
                BackendCall::Launch("emulator-1".to_string()),
                BackendCall::Teardown("emulator-1".to_string())
            ]
        );
        assert_eq!(dev.health, HealthState::Stopped);
    }

    #[test]
    fn test_fatal_launch_fault_is_spawn_failure() {
        let mut backend = RecordingBackend::new();
        backend
            .failures()
            .lock()
            .unwrap()
            .inject(FaultPoint::Launch, FailureConfig::error("gone").fatal());
        let mut sup = Supervisor::new(Duration::from_secs(1));
        let mut dev = device();

        let err = backend.launch(&mut sup, &mut dev).unwrap_err();
        assert!(matches!(err, DeviceError::Launch(crate::supervisor::LaunchError::Spawn { .. })));
        assert!(err.is_fatal());
        assert!(dev.launched_pids.is_empty());
    }

    #[test]
    fn test_redirect_fault_is_retryable() {
        let mut backend = RecordingBackend::new();
        backend
            .failures()
            .lock()
            .unwrap()
            .inject(FaultPoint::Redirect, FailureConfig::error("KO: busy").with_fail_count(1));
        let mut sup = Supervisor::new(Duration::from_secs(1));
        let mut dev = device();

        let err = backend.redirect(&mut sup, &mut dev).unwrap_err();
        assert!(!err.is_fatal());
        backend.redirect(&mut sup, &mut dev).unwrap();
        assert_eq!(dev.health, HealthState::Redirected);
    }
}
