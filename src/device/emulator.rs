//! Backend for real emulators driven by the `emulator` and `adb` tools.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use emu_console::{agent, console};

use super::{DeviceBackend, DeviceError, DeviceInstance, HealthState, InstallError};
use crate::config::{EmulatorConfig, HarnessConfig, Timing};
use crate::context::{path_string, RunContext};
use crate::dispatch::render_all;
use crate::supervisor::{stray, LaunchSpec, Supervisor};

/// Lines of emulator output logged after each suite.
const DIAGNOSTIC_TAIL_LINES: usize = 40;

/// Substring `adb install` prints on failure even with exit status 0.
const INSTALL_FAILURE_MARKER: &str = "Failure";

#[derive(Debug, Clone)]
pub struct EmulatorBackend {
    emulator: EmulatorConfig,
    host: String,
    upload_dir: PathBuf,
    timing: Timing,
}

impl EmulatorBackend {
    pub fn new(config: &HarnessConfig, ctx: &RunContext, timing: Timing) -> Self {
        Self {
            emulator: config.emulator.clone(),
            host: ctx.console_host.clone(),
            upload_dir: ctx.upload_dir.clone(),
            timing,
        }
    }

    fn values(device: &DeviceInstance) -> BTreeMap<String, String> {
        let mut values = BTreeMap::new();
        values.insert("name".to_string(), device.name().to_string());
        values.insert("console_port".to_string(), device.config.console_port.to_string());
        values.insert("device_id".to_string(), device.device_id());
        values
    }

    fn logcat_path(&self, device: &DeviceInstance) -> PathBuf {
        self.upload_dir.join(format!("logcat-{}.log", device.device_id()))
    }

    fn ensure_running(&self, supervisor: &mut Supervisor, device: &DeviceInstance) -> Result<(), DeviceError> {
        let id = device.process.ok_or_else(|| DeviceError::NotLaunched {
            device: device.name().to_string(),
        })?;
        if let Some(outcome) = supervisor.poll(id)? {
            return Err(DeviceError::Exited {
                device: device.name().to_string(),
                outcome,
            });
        }
        Ok(())
    }

    /// Run a short adb command and log its output.
    fn run_aux(&self, supervisor: &mut Supervisor, device: &DeviceInstance, label: &str, argv: &[String]) {
        if argv.is_empty() {
            return;
        }
        let argv = match render_all(argv, &Self::values(device)) {
            Ok(argv) => argv,
            Err(e) => {
                tracing::warn!(device = %device.name(), error = %e, "{} command not rendered", label);
                return;
            }
        };
        let spec = LaunchSpec::new(format!("{}:{}", label, device.name()), argv);
        match supervisor.run_to_completion(spec, self.timing.install_timeout) {
            Ok(done) if done.outcome.success() && !done.timed_out => {
                tracing::info!(device = %device.name(), "{}:\n{}", label, done.output.trim_end());
            }
            Ok(done) => {
                tracing::warn!(
                    device = %device.name(),
                    outcome = %done.outcome,
                    timed_out = done.timed_out,
                    "{} failed:\n{}",
                    label,
                    done.output.trim_end()
                );
            }
            Err(e) => tracing::warn!(device = %device.name(), error = %e, "{} not run", label),
        }
    }

    fn log_status_report(&self, device: &mut DeviceInstance) {
        match console::status_report(&self.host, device.config.console_port, self.timing.console) {
            Ok(report) => {
                tracing::info!(device = %device.name(), "console status:\n{}", report.trim_end());
                device.status_report = Some(report);
            }
            Err(e) => tracing::warn!(device = %device.name(), error = %e, "console status report failed"),
        }
    }
}

impl DeviceBackend for EmulatorBackend {
    fn acquire(&mut self, device: &mut DeviceInstance) -> Result<(), DeviceError> {
        // An emulator left behind by an earlier run would hold the ports.
        if let Some(pattern) = &self.emulator.process_name {
            match stray::kill_matching(pattern) {
                Ok(0) => {}
                Ok(n) => tracing::warn!(device = %device.name(), pattern = %pattern, killed = n, "killed leftover emulators"),
                Err(e) => tracing::warn!(pattern = %pattern, error = %e, "leftover emulator sweep failed"),
            }
        }
        Ok(())
    }

    fn launch(&mut self, supervisor: &mut Supervisor, device: &mut DeviceInstance) -> Result<(), DeviceError> {
        let argv = render_all(&self.emulator.command, &Self::values(device)).map_err(|source| DeviceError::Command {
            device: device.name().to_string(),
            source,
        })?;
        let spec = LaunchSpec::new(format!("emulator:{}", device.name()), argv)
            .envs(self.emulator.env.clone())
            .stray_pattern(self.emulator.process_name.clone());
        let id = supervisor.launch(spec)?;
        device.launched_pids.push(supervisor.pid(id)?);
        device.process = Some(id);
        device.health = HealthState::Launched;
        Ok(())
    }

    fn redirect(&mut self, supervisor: &mut Supervisor, device: &mut DeviceInstance) -> Result<(), DeviceError> {
        self.ensure_running(supervisor, device)?;
        let redirects = device.redirects(&self.emulator);
        let reply = console::redirect(
            &self.host,
            device.config.console_port,
            &redirects,
            &self.timing.redirect,
            self.timing.console,
        )
        .map_err(|source| DeviceError::Redirect {
            device: device.name().to_string(),
            source,
        })?;
        tracing::debug!(device = %device.name(), reply = %reply.trim(), "redirects added");
        device.health = HealthState::Redirected;
        Ok(())
    }

    fn abort_start(&mut self, supervisor: &mut Supervisor, device: &mut DeviceInstance) {
        if let Some(id) = device.process.take() {
            if let Err(e) = supervisor.terminate(id) {
                tracing::warn!(device = %device.name(), error = %e, "failed to stop emulator");
            }
        }
        device.health = HealthState::NotStarted;
    }

    fn check_health(&mut self, supervisor: &mut Supervisor, device: &mut DeviceInstance) -> Result<(), DeviceError> {
        self.ensure_running(supervisor, device)?;

        if let Err(source) = agent::probe(
            &self.host,
            device.config.agent_port1,
            &self.timing.agent,
            self.timing.console.connect,
            self.timing.console.read,
        ) {
            if self.emulator.require_agent_health {
                device.health = HealthState::Unhealthy;
                return Err(DeviceError::Agent {
                    device: device.name().to_string(),
                    source,
                });
            }
            tracing::warn!(device = %device.name(), error = %source, "agent not answering, continuing");
        }

        self.run_aux(supervisor, device, "shell check", &self.emulator.health_command);
        self.log_status_report(device);
        device.health = HealthState::Healthy;
        Ok(())
    }

    fn start_log_capture(&mut self, supervisor: &mut Supervisor, device: &mut DeviceInstance) -> Result<(), DeviceError> {
        if self.emulator.logcat_command.is_empty() {
            return Ok(());
        }
        let argv = render_all(&self.emulator.logcat_command, &Self::values(device)).map_err(|source| {
            DeviceError::Command {
                device: device.name().to_string(),
                source,
            }
        })?;
        let id = supervisor.launch(LaunchSpec::new(format!("logcat:{}", device.name()), argv))?;
        device.logcat = Some(id);
        Ok(())
    }

    fn install(
        &mut self,
        supervisor: &mut Supervisor,
        device: &mut DeviceInstance,
        package: &str,
        path: &Path,
    ) -> Result<(), InstallError> {
        if !path.exists() {
            return Err(InstallError::MissingArtifact {
                package: package.to_string(),
                path: path.to_path_buf(),
            });
        }
        let mut values = Self::values(device);
        values.insert("package".to_string(), path_string(path));
        let argv = render_all(&self.emulator.install_command, &values).map_err(|source| InstallError::Command {
            device: device.name().to_string(),
            source,
        })?;

        tracing::info!(device = %device.name(), package, path = %path.display(), "installing");
        let spec = LaunchSpec::new(format!("install-{}:{}", package, device.name()), argv);
        let done = supervisor.run_to_completion(spec, self.timing.install_timeout)?;
        if done.timed_out {
            return Err(InstallError::TimedOut {
                device: device.name().to_string(),
                package: package.to_string(),
            });
        }
        if !done.outcome.success() || done.output.contains(INSTALL_FAILURE_MARKER) {
            return Err(InstallError::Failed {
                device: device.name().to_string(),
                package: package.to_string(),
                outcome: done.outcome.to_string(),
                output: done.output.trim().to_string(),
            });
        }
        Ok(())
    }

    fn collect_diagnostics(&mut self, supervisor: &mut Supervisor, device: &mut DeviceInstance) {
        if let Some(id) = device.process {
            match supervisor.read_output(id) {
                Ok(output) => {
                    let lines: Vec<&str> = output.lines().collect();
                    let tail = &lines[lines.len().saturating_sub(DIAGNOSTIC_TAIL_LINES)..];
                    tracing::info!(device = %device.name(), "emulator output (last {} lines):\n{}", tail.len(), tail.join("\n"));
                }
                Err(e) => tracing::warn!(device = %device.name(), error = %e, "emulator output unavailable"),
            }
        }
        self.log_status_report(device);
    }

    fn teardown(&mut self, supervisor: &mut Supervisor, device: &mut DeviceInstance) {
        if let Some(id) = device.logcat.take() {
            if let Err(e) = supervisor.terminate(id) {
                tracing::warn!(device = %device.name(), error = %e, "failed to stop logcat");
            }
            let dest = self.logcat_path(device);
            let file_name = dest.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
            match supervisor.preserve(id, &self.upload_dir, &file_name) {
                Ok(path) => tracing::info!(device = %device.name(), path = %path.display(), "logcat saved"),
                Err(e) => tracing::warn!(device = %device.name(), error = %e, "failed to save logcat"),
            }
            if let Err(e) = supervisor.release(id) {
                tracing::debug!(device = %device.name(), error = %e, "logcat release failed");
            }
        }

        if let Some(id) = device.process {
            if supervisor.is_running(id).unwrap_or(false) {
                self.log_status_report(device);
            }
            if let Err(e) = supervisor.terminate(id) {
                tracing::warn!(device = %device.name(), error = %e, "failed to stop emulator");
            }
        }
        device.health = HealthState::Stopped;
        tracing::info!(device = %device.name(), "device stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::SAMPLE;
    use crate::config::TimingConfig;
    use std::time::Duration;

    fn backend(dir: &Path, edit: impl FnOnce(&mut HarnessConfig)) -> (HarnessConfig, EmulatorBackend) {
        let mut config = HarnessConfig::parse(SAMPLE).unwrap();
        config.paths.work_dir = dir.to_path_buf();
        config.paths.upload_dir = dir.join("upload");
        config.emulator.process_name = None;
        config.timing = TimingConfig {
            redirect_attempts: 1,
            agent_attempts: 1,
            connect_timeout_secs: 0.5,
            read_timeout_secs: 0.5,
            install_timeout_secs: 5.0,
            terminate_grace_secs: 1.0,
            ..TimingConfig::default()
        };
        edit(&mut config);
        let ctx = RunContext::resolve(&config).unwrap();
        let timing = config.timing.to_timing();
        let backend = EmulatorBackend::new(&config, &ctx, timing);
        (config, backend)
    }

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_launch_renders_command_and_records_pid() {
        let dir = tempfile::tempdir().unwrap();
        let (config, mut backend) = backend(dir.path(), |c| {
            c.emulator.command = argv(&["sh", "-c", "echo avd={name} port={console_port}; sleep 30"]);
        });
        let mut sup = Supervisor::new(Duration::from_secs(1));
        let mut device = DeviceInstance::new(0, config.devices[0].clone());
        backend.launch(&mut sup, &mut device).unwrap();
        assert_eq!(device.health, HealthState::Launched);
        assert_eq!(device.launched_pids.len(), 1);
        std::thread::sleep(Duration::from_millis(200));
        let output = sup.read_output(device.process.unwrap()).unwrap();
        assert!(output.contains("avd=emulator-1 port=5554"));
        backend.teardown(&mut sup, &mut device);
        assert_eq!(device.health, HealthState::Stopped);
        assert!(sup.running().is_empty());
    }

    #[test]
    fn test_redirect_fails_when_emulator_died() {
        let dir = tempfile::tempdir().unwrap();
        let (config, mut backend) = backend(dir.path(), |c| {
            c.emulator.command = argv(&["sh", "-c", "exit 1"]);
        });
        let mut sup = Supervisor::new(Duration::from_secs(1));
        let mut device = DeviceInstance::new(0, config.devices[0].clone());
        backend.launch(&mut sup, &mut device).unwrap();
        std::thread::sleep(Duration::from_millis(300));
        let err = backend.redirect(&mut sup, &mut device).unwrap_err();
        assert!(matches!(err, DeviceError::Exited { .. }));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_missing_emulator_binary_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let (config, mut backend) = backend(dir.path(), |c| {
            c.emulator.command = argv(&["/nonexistent/emulator", "-avd", "{name}"]);
        });
        let mut sup = Supervisor::default();
        let mut device = DeviceInstance::new(0, config.devices[0].clone());
        let err = backend.launch(&mut sup, &mut device).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_install_reports_failure_marker() {
        let dir = tempfile::tempdir().unwrap();
        let apk = dir.path().join("fennec.apk");
        std::fs::write(&apk, b"apk").unwrap();
        let (config, mut backend) = backend(dir.path(), |c| {
            c.emulator.install_command = argv(&["sh", "-c", "echo Failure [INSTALL_FAILED_INSUFFICIENT_STORAGE]", "{package}"]);
        });
        let mut sup = Supervisor::default();
        let mut device = DeviceInstance::new(0, config.devices[0].clone());
        let err = backend.install(&mut sup, &mut device, "main", &apk).unwrap_err();
        assert!(matches!(err, InstallError::Failed { .. }), "{}", err);
    }

    #[test]
    fn test_install_success_and_missing_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let apk = dir.path().join("fennec.apk");
        std::fs::write(&apk, b"apk").unwrap();
        let (config, mut backend) = backend(dir.path(), |c| {
            c.emulator.install_command = argv(&["sh", "-c", "test -f \"$0\" && echo Success", "{package}"]);
        });
        let mut sup = Supervisor::default();
        let mut device = DeviceInstance::new(0, config.devices[0].clone());
        backend.install(&mut sup, &mut device, "main", &apk).unwrap();

        let err = backend
            .install(&mut sup, &mut device, "robocop", &dir.path().join("robocop.apk"))
            .unwrap_err();
        assert!(matches!(err, InstallError::MissingArtifact { .. }));
    }

    #[test]
    fn test_logcat_saved_to_upload_dir_at_teardown() {
        let dir = tempfile::tempdir().unwrap();
        let (config, mut backend) = backend(dir.path(), |c| {
            c.emulator.command = argv(&["sleep", "30"]);
            c.emulator.logcat_command = argv(&["sh", "-c", "echo I/ActivityManager: {device_id}; sleep 30"]);
        });
        let mut sup = Supervisor::new(Duration::from_secs(1));
        let mut device = DeviceInstance::new(0, config.devices[0].clone());
        backend.launch(&mut sup, &mut device).unwrap();
        backend.start_log_capture(&mut sup, &mut device).unwrap();
        std::thread::sleep(Duration::from_millis(200));
        backend.teardown(&mut sup, &mut device);

        let saved = std::fs::read_to_string(dir.path().join("upload/logcat-emulator-5554.log")).unwrap();
        assert!(saved.contains("I/ActivityManager: emulator-5554"));
        assert!(device.logcat.is_none());
        assert!(sup.running().is_empty());
    }
}
