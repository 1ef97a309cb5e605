//! Lifecycle controller.
//!
//! Drives one run through acquire → start → install → run suites →
//! collect → stop on a single thread. Suites run in parallel as child
//! processes while the controller polls them. Device teardown happens
//! exactly once per acquired device on every path, including failures
//! and cancellation.

mod state;

pub use state::{InvalidTransition, Lifecycle, LifecycleState};

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use emu_classifier::{Classifier, Severity};

use crate::config::{ConfigError, HarnessConfig, Timing};
use crate::context::{ContextError, RunContext};
use crate::device::{DeviceBackend, DeviceError, DeviceInstance, EmulatorBackend};
use crate::dispatch::{DispatchError, Dispatcher, SuiteRun};
use crate::signal::SignalState;
use crate::summary::{
    DeviceSummary, FailureKind, PhaseOutcome, RunSummary, SuiteSummary, RUN_SUMMARY_FILE,
};
use crate::supervisor::{ExitOutcome, ProcessId, Supervisor, SupervisorError};
use crate::timeout::Heartbeat;

/// Package name used for the artifact under test.
pub const MAIN_PACKAGE: &str = "main";

/// Subdirectory of the upload dir that receives preserved captures.
pub const LOGS_DIR: &str = "logs";

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Context(#[from] ContextError),
}

/// Everything a finished run reports.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub summary: RunSummary,
    /// States entered, in order.
    pub history: Vec<LifecycleState>,
    /// `None` when run_summary.json could not be written.
    pub summary_path: Option<PathBuf>,
    /// Set when captures were preserved.
    pub logs_dir: Option<PathBuf>,
}

impl RunReport {
    pub fn verdict(&self) -> Severity {
        self.summary.verdict
    }

    pub fn exit_code(&self) -> i32 {
        self.summary.exit_code
    }

    pub fn failed_from(&self) -> Option<LifecycleState> {
        self.summary.failed_from
    }
}

/// Outcome of polling one suite.
enum Poll {
    Running,
    Exited(ExitOutcome, Option<&'static str>),
}

pub struct Controller<B: DeviceBackend> {
    config: HarnessConfig,
    ctx: RunContext,
    timing: Timing,
    classifier: Classifier,
    backend: B,
    supervisor: Supervisor,
    signal: Arc<SignalState>,
    machine: Lifecycle,
    devices: Vec<DeviceInstance>,
    devices_stopped: bool,
    phases: Vec<PhaseOutcome>,
    results: Vec<SuiteSummary>,
    /// Preserved file name per suite capture.
    log_names: BTreeMap<ProcessId, String>,
    /// Final capture of each recorded suite, by index into `results`.
    result_logs: Vec<(usize, ProcessId)>,
}

impl Controller<EmulatorBackend> {
    /// Controller for real emulators.
    pub fn emulator(config: HarnessConfig) -> Result<Self, LifecycleError> {
        config.validate()?;
        let ctx = RunContext::resolve(&config)?;
        let backend = EmulatorBackend::new(&config, &ctx, config.timing.to_timing());
        Self::with_context(config, ctx, backend)
    }
}

impl<B: DeviceBackend> Controller<B> {
    pub fn new(config: HarnessConfig, backend: B) -> Result<Self, LifecycleError> {
        config.validate()?;
        let ctx = RunContext::resolve(&config)?;
        Self::with_context(config, ctx, backend)
    }

    fn with_context(config: HarnessConfig, ctx: RunContext, backend: B) -> Result<Self, LifecycleError> {
        let timing = config.timing.to_timing();
        let classifier = config.classifier.build()?;
        let signal = Arc::new(SignalState::new());
        let mut supervisor = Supervisor::new(timing.terminate_grace);
        supervisor.set_process_groups(signal.process_groups());
        Ok(Self {
            config,
            ctx,
            timing,
            classifier,
            backend,
            supervisor,
            signal,
            machine: Lifecycle::new(),
            devices: Vec::new(),
            devices_stopped: false,
            phases: Vec::new(),
            results: Vec::new(),
            log_names: BTreeMap::new(),
            result_logs: Vec::new(),
        })
    }

    /// Share cancellation state with a signal handler.
    pub fn with_signal_state(mut self, signal: Arc<SignalState>) -> Self {
        self.supervisor.set_process_groups(signal.process_groups());
        self.signal = signal;
        self
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Run the whole lifecycle. Never fails: problems are folded into the
    /// report's verdict.
    pub fn run(mut self) -> RunReport {
        let started = Instant::now();
        tracing::info!(
            suites = self.config.test_suites.len(),
            devices = self.config.bound_devices().len(),
            "starting run"
        );

        if let Err(outcome) = self.execute() {
            tracing::error!(phase = %outcome.phase, "{}", outcome.message);
            self.phases.push(outcome);
            self.machine.fail();
        }
        self.stop_devices();
        self.finish(started)
    }

    fn execute(&mut self) -> Result<(), PhaseOutcome> {
        self.enter(LifecycleState::AcquiringDevices)?;
        self.acquire_devices()?;

        self.enter(LifecycleState::DevicesStarting)?;
        self.start_devices()?;

        self.enter(LifecycleState::DevicesHealthy)?;
        self.start_log_capture();

        self.enter(LifecycleState::ArtifactInstalling)?;
        let blocked = self.install_artifacts();

        self.enter(LifecycleState::SuitesRunning)?;
        self.run_suites(&blocked)?;

        self.enter(LifecycleState::ResultsCollected)?;
        Ok(())
    }

    fn enter(&mut self, target: LifecycleState) -> Result<(), PhaseOutcome> {
        if self.signal.is_cancel_requested() {
            return Err(self.cancelled());
        }
        self.machine
            .transition(target)
            .map_err(|e| PhaseOutcome::new(self.machine.state(), Severity::Fatal, e.to_string()))
    }

    fn cancelled(&self) -> PhaseOutcome {
        PhaseOutcome::failure(self.machine.state(), FailureKind::Cancelled, "run cancelled")
    }

    fn acquire_devices(&mut self) -> Result<(), PhaseOutcome> {
        let bound = self.config.bound_devices().to_vec();
        for (index, device_config) in bound.into_iter().enumerate() {
            let mut device = DeviceInstance::new(index, device_config);
            self.backend.acquire(&mut device).map_err(|e| {
                PhaseOutcome::failure(LifecycleState::AcquiringDevices, FailureKind::Acquire, e.to_string())
            })?;
            tracing::info!(device = %device.name(), console_port = device.config.console_port, "device acquired");
            self.devices.push(device);
        }
        Ok(())
    }

    /// Start every device; on any failure kill them all and start over.
    fn start_devices(&mut self) -> Result<(), PhaseOutcome> {
        let policy = self.timing.startup;
        let mut attempt = 1;
        loop {
            let err = match self.start_attempt() {
                Ok(()) => {
                    self.phases.push(PhaseOutcome::new(
                        LifecycleState::DevicesStarting,
                        Severity::Success,
                        format!("{} device(s) healthy after {} attempt(s)", self.devices.len(), attempt),
                    ));
                    return Ok(());
                }
                Err(err) => err,
            };

            for device in &mut self.devices {
                self.backend.abort_start(&mut self.supervisor, device);
            }
            if err.is_fatal() {
                return Err(PhaseOutcome::failure(
                    LifecycleState::DevicesStarting,
                    FailureKind::Launch,
                    err.to_string(),
                ));
            }
            if attempt >= policy.max_attempts() {
                return Err(PhaseOutcome::failure(
                    LifecycleState::DevicesStarting,
                    FailureKind::Startup,
                    format!("{} (gave up after {} attempts)", err, attempt),
                ));
            }

            let delay = policy.backoff().delay_for_retry(attempt);
            tracing::warn!(
                attempt,
                error = %err,
                delay_secs = delay.as_secs_f64(),
                "device startup failed, restarting all devices"
            );
            if self.signal.sleep(delay) {
                return Err(self.cancelled());
            }
            attempt += 1;
        }
    }

    fn start_attempt(&mut self) -> Result<(), DeviceError> {
        for device in &mut self.devices {
            self.backend.launch(&mut self.supervisor, device)?;
        }
        for device in &mut self.devices {
            self.backend.redirect(&mut self.supervisor, device)?;
        }
        for device in &mut self.devices {
            self.backend.check_health(&mut self.supervisor, device)?;
        }
        Ok(())
    }

    fn start_log_capture(&mut self) {
        for device in &mut self.devices {
            if let Err(e) = self.backend.start_log_capture(&mut self.supervisor, device) {
                tracing::warn!(device = %device.name(), error = %e, "log capture not started");
            }
        }
    }

    /// Install the artifact and auxiliary packages on every device.
    /// Returns, per device index, why its suite cannot run.
    fn install_artifacts(&mut self) -> BTreeMap<usize, String> {
        let main_path = self.ctx.installer_path.clone();
        let packages: Vec<(String, PathBuf, bool)> = self
            .config
            .packages
            .iter()
            .map(|(name, pkg)| (name.clone(), self.config.work_path(&pkg.path), pkg.always))
            .collect();

        let mut blocked = BTreeMap::new();
        let mut optional_failures = 0;
        for (index, suite_name) in self.config.test_suites.iter().enumerate() {
            let Some(device) = self.devices.get_mut(index) else {
                continue;
            };
            let requires = self
                .config
                .suites
                .get(suite_name)
                .map(|s| s.requires.clone())
                .unwrap_or_default();

            if let Err(e) = self.backend.install(&mut self.supervisor, device, MAIN_PACKAGE, &main_path) {
                tracing::error!(device = %device.name(), suite = %suite_name, error = %e, "artifact install failed");
                blocked.insert(index, e.to_string());
                continue;
            }
            for (name, path, always) in &packages {
                let required = requires.contains(name);
                if !required && !always {
                    continue;
                }
                if let Err(e) = self.backend.install(&mut self.supervisor, device, name, path) {
                    if required {
                        tracing::error!(device = %device.name(), suite = %suite_name, error = %e, "required package install failed");
                        blocked.insert(index, e.to_string());
                        break;
                    }
                    tracing::warn!(device = %device.name(), error = %e, "optional package install failed");
                    optional_failures += 1;
                }
            }
        }

        let outcome = if !blocked.is_empty() {
            PhaseOutcome::failure(
                LifecycleState::ArtifactInstalling,
                FailureKind::Install,
                format!("{} device(s) blocked by failed installs", blocked.len()),
            )
        } else if optional_failures > 0 {
            PhaseOutcome::new(
                LifecycleState::ArtifactInstalling,
                Severity::Warning,
                format!("{} optional install(s) failed", optional_failures),
            )
        } else {
            PhaseOutcome::new(LifecycleState::ArtifactInstalling, Severity::Success, "all packages installed")
        };
        self.phases.push(outcome);
        blocked
    }

    fn run_suites(&mut self, blocked: &BTreeMap<usize, String>) -> Result<(), PhaseOutcome> {
        let suites = self.config.test_suites.clone();
        let mut active = Vec::new();
        for (index, name) in suites.iter().enumerate() {
            let category = self.category_of(name);
            let device_name = self.devices.get(index).map(|d| d.name().to_string()).unwrap_or_default();
            if let Some(reason) = blocked.get(&index) {
                tracing::warn!(suite = %name, device = %device_name, "suite blocked");
                self.results
                    .push(SuiteSummary::blocked(name, &category, &device_name, FailureKind::Install, reason.clone()));
                continue;
            }
            match self.trigger(name, index, 1) {
                Ok(run) => active.push(run),
                Err(DispatchError::Launch(e)) => {
                    self.cancel_runs(active);
                    return Err(PhaseOutcome::failure(
                        LifecycleState::SuitesRunning,
                        FailureKind::Launch,
                        e.to_string(),
                    ));
                }
                Err(e) => {
                    tracing::error!(suite = %name, error = %e, "suite not started");
                    self.results
                        .push(SuiteSummary::blocked(name, &category, &device_name, FailureKind::Dispatch, e.to_string()));
                }
            }
        }
        self.poll_until_done(active)
    }

    fn category_of(&self, suite: &str) -> String {
        self.config.suites.get(suite).map(|s| s.category.clone()).unwrap_or_default()
    }

    fn trigger(&mut self, suite: &str, device_index: usize, attempt: u32) -> Result<SuiteRun, DispatchError> {
        let device = self
            .devices
            .get(device_index)
            .ok_or_else(|| DispatchError::UnknownSuite(suite.to_string()))?;
        let dispatcher = Dispatcher::new(&self.config, &self.ctx, self.timing.suite);
        let run = dispatcher.trigger(&mut self.supervisor, suite, device_index, &device.config, attempt)?;
        self.log_names.insert(run.process, run.log_file_name());
        Ok(run)
    }

    fn poll_until_done(&mut self, mut active: Vec<SuiteRun>) -> Result<(), PhaseOutcome> {
        let mut heartbeat = Heartbeat::new(self.timing.heartbeat_interval);
        while !active.is_empty() {
            let mut still_running = Vec::with_capacity(active.len());
            for mut run in active {
                match self.poll_run(&mut run) {
                    Ok(Poll::Running) => still_running.push(run),
                    Ok(Poll::Exited(outcome, reason)) => {
                        if let Some(rerun) = self.complete(run, outcome, reason) {
                            still_running.push(rerun);
                        }
                    }
                    Err(e) => self.lost(run, e),
                }
            }
            active = still_running;
            if active.is_empty() {
                break;
            }

            if heartbeat.due() {
                // Keeps an outer no-output watchdog from killing the job.
                tracing::info!(running = active.len(), "#");
            }
            if self.signal.sleep(self.timing.poll_interval) {
                self.cancel_runs(active);
                return Err(self.cancelled());
            }
        }
        Ok(())
    }

    fn poll_run(&mut self, run: &mut SuiteRun) -> Result<Poll, SupervisorError> {
        if let Some(outcome) = self.supervisor.poll(run.process)? {
            return Ok(Poll::Exited(outcome, None));
        }
        run.enforcer.observe_output(self.supervisor.output_len(run.process)?);
        if let Some(reason) = run.enforcer.check().reason() {
            tracing::warn!(suite = %run.suite, device = %run.device, reason, "terminating suite");
            let outcome = self.supervisor.terminate(run.process)?;
            return Ok(Poll::Exited(outcome, Some(reason)));
        }
        Ok(Poll::Running)
    }

    /// Classify a finished suite. Returns the next attempt when the suite
    /// asked to be rerun and may still be.
    fn complete(&mut self, mut run: SuiteRun, outcome: ExitOutcome, reason: Option<&'static str>) -> Option<SuiteRun> {
        tracing::info!(suite = %run.suite, device = %run.device, %outcome, "suite finished");
        if let Err(e) = run.mark_exited(outcome, reason) {
            tracing::error!(error = %e, "suite state");
        }
        let output = self.supervisor.read_output(run.process).unwrap_or_else(|e| {
            tracing::warn!(suite = %run.suite, error = %e, "capture unreadable");
            String::new()
        });
        let classification = self.classifier.classify(&run.category, &output, run.exit_code());
        tracing::info!(suite = %run.suite, "{}", classification.summary_line(&run.suite));

        if let Some(device) = self.devices.get_mut(run.device_index) {
            self.backend.collect_diagnostics(&mut self.supervisor, device);
        }

        let (max_runs, marker) = self
            .config
            .suites
            .get(&run.suite)
            .map(|s| (s.run_limit(), s.rerun_on.clone()))
            .unwrap_or((1, None));
        let wants_rerun =
            classification.rerun_requested || marker.map(|m| output.contains(m.as_str())).unwrap_or(false);

        let mut failure_kind = reason.map(FailureKind::from_timeout_reason);
        if wants_rerun && failure_kind.is_none() {
            if run.attempt < max_runs {
                tracing::warn!(suite = %run.suite, attempt = run.attempt, max_runs, "suite asked to be rerun");
                match self.trigger(&run.suite, run.device_index, run.attempt + 1) {
                    Ok(next) => return Some(next),
                    Err(e) => {
                        tracing::error!(suite = %run.suite, error = %e, "rerun not started");
                        failure_kind = Some(FailureKind::Dispatch);
                    }
                }
            } else {
                failure_kind = Some(FailureKind::RerunExhausted);
            }
        }
        if failure_kind.is_none() && classification.ambiguous {
            failure_kind = Some(FailureKind::Ambiguous);
        }

        if let Err(e) = run.mark_classified(classification.clone()) {
            tracing::error!(error = %e, "suite state");
        }
        let duration_ms = run.enforcer.elapsed().as_millis() as u64;
        self.results.push(SuiteSummary::classified(
            &run.suite,
            &run.category,
            &run.device,
            run.attempt,
            classification,
            failure_kind,
            duration_ms,
        ));
        self.result_logs.push((self.results.len() - 1, run.process));
        None
    }

    /// The supervisor failed on a running suite; stop it and record it.
    fn lost(&mut self, run: SuiteRun, error: SupervisorError) {
        tracing::error!(suite = %run.suite, error = %error, "lost track of suite");
        if let Err(e) = self.supervisor.terminate(run.process) {
            tracing::warn!(suite = %run.suite, error = %e, "terminate failed");
        }
        self.results.push(SuiteSummary::errored(
            &run.suite,
            &run.category,
            &run.device,
            run.attempt,
            FailureKind::Launch,
            error.to_string(),
        ));
        self.result_logs.push((self.results.len() - 1, run.process));
    }

    fn cancel_runs(&mut self, active: Vec<SuiteRun>) {
        for mut run in active {
            let outcome = self.supervisor.terminate(run.process).unwrap_or_else(|e| {
                tracing::warn!(suite = %run.suite, error = %e, "terminate failed");
                ExitOutcome::Signaled("unknown".to_string())
            });
            if let Err(e) = run.mark_exited(outcome, None) {
                tracing::error!(error = %e, "suite state");
            }
            tracing::warn!(suite = %run.suite, device = %run.device, "suite cancelled");
            let duration_ms = run.enforcer.elapsed().as_millis() as u64;
            self.results.push(SuiteSummary::cancelled(
                &run.suite,
                &run.category,
                &run.device,
                run.attempt,
                duration_ms,
            ));
            self.result_logs.push((self.results.len() - 1, run.process));
        }
    }

    /// Tear down every acquired device, once.
    fn stop_devices(&mut self) {
        if self.devices_stopped {
            return;
        }
        self.devices_stopped = true;

        for device in &mut self.devices {
            self.backend.teardown(&mut self.supervisor, device);
        }
        // Anything still alive (suites after a failure, stray helpers).
        self.supervisor.terminate_all();

        if !self.machine.is_failed() {
            for state in [LifecycleState::DevicesStopped, LifecycleState::Done] {
                if let Err(e) = self.machine.transition(state) {
                    tracing::error!(error = %e, "lifecycle");
                }
            }
        }
        self.phases.push(PhaseOutcome::new(
            LifecycleState::DevicesStopped,
            Severity::Success,
            format!("{} device(s) stopped", self.devices.len()),
        ));
    }

    fn finish(&mut self, started: Instant) -> RunReport {
        let devices = self
            .devices
            .iter()
            .map(|d| DeviceSummary {
                name: d.name().to_string(),
                device_id: d.device_id(),
                console_port: d.config.console_port,
                health: d.health,
                launched_pids: d.launched_pids.clone(),
            })
            .collect();
        let mut summary = RunSummary::new(
            self.machine.state(),
            self.machine.failed_from(),
            std::mem::take(&mut self.phases),
            std::mem::take(&mut self.results),
            devices,
            started.elapsed().as_millis() as u64,
        );

        let logs_dir = if summary.verdict > Severity::Success {
            Some(self.preserve_captures(&mut summary))
        } else {
            self.release_captures();
            None
        };

        let path = self.ctx.upload_dir.join(RUN_SUMMARY_FILE);
        let summary_path = match summary.write_to_file(&path) {
            Ok(()) => Some(path),
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "failed to write run summary");
                None
            }
        };

        tracing::info!(
            verdict = %summary.verdict,
            exit_code = summary.exit_code,
            "{}",
            summary.human_summary
        );
        RunReport {
            summary,
            history: self.machine.history(),
            summary_path,
            logs_dir,
        }
    }

    /// Copy every capture into `<upload_dir>/logs/` and release it.
    fn preserve_captures(&mut self, summary: &mut RunSummary) -> PathBuf {
        let dir = self.ctx.upload_dir.join(LOGS_DIR);
        let mut kept = BTreeMap::new();
        for id in self.supervisor.ids() {
            let name = match self.log_names.get(&id) {
                Some(name) => name.clone(),
                None => capture_file_name(self.supervisor.label(id).unwrap_or("process")),
            };
            match self.supervisor.preserve(id, &dir, &name) {
                Ok(path) => {
                    kept.insert(id, path);
                }
                Err(e) => tracing::warn!(process = %id, error = %e, "capture not preserved"),
            }
        }
        for (index, id) in &self.result_logs {
            if let Some(suite) = summary.suites.get_mut(*index) {
                suite.log_path = kept.get(id).cloned();
            }
        }
        self.release_captures();
        dir
    }

    fn release_captures(&mut self) {
        for id in self.supervisor.ids() {
            if let Err(e) = self.supervisor.release(id) {
                tracing::debug!(process = %id, error = %e, "release failed");
            }
        }
    }
}

fn capture_file_name(label: &str) -> String {
    let safe: String = label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '-' })
        .collect();
    format!("{}.log", safe)
}
