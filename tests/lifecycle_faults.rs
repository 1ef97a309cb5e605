//! Lifecycle tests against the recording backend.
//!
//! Devices are fake (`sleep` processes) but suites are real shell children,
//! so supervision, timeouts and classification run for real. Faults are
//! injected per backend step.

mod common;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use common::{suite, suite_with, unbound_ports, Workspace, RECORDING_EMULATOR};
use emu_harness::lifecycle::{Controller, LifecycleError, LifecycleState, RunReport};
use emu_harness::mock::{BackendCall, CallLog, FailureConfig, FaultPoint, RecordingBackend};
use emu_harness::signal::SignalState;
use emu_harness::summary::{FailureKind, RunSummary, SuiteStatus};
use emu_harness::{ConfigError, HarnessConfig, Severity};

fn run_with(config: HarnessConfig, setup: impl FnOnce(&RecordingBackend)) -> (RunReport, CallLog) {
    let backend = RecordingBackend::new();
    setup(&backend);
    let log = backend.log();
    let report = Controller::new(config, backend).unwrap().run();
    (report, log)
}

fn inject(backend: &RecordingBackend, point: FaultPoint, config: FailureConfig) {
    backend.failures().lock().unwrap().inject(point, config);
}

fn launches(log: &CallLog, device: &str) -> usize {
    log.count(|c| matches!(c, BackendCall::Launch(d) if d == device))
}

#[test]
fn test_all_suites_pass() {
    let ws = Workspace::new();
    let config = ws.config(&[suite("alpha", "pass"), suite("beta", "pass")], &unbound_ports(2), RECORDING_EMULATOR);
    let (report, log) = run_with(config, |_| {});

    assert_eq!(report.verdict(), Severity::Success);
    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.summary.final_state, LifecycleState::Done);
    assert_eq!(
        report.history,
        vec![
            LifecycleState::Idle,
            LifecycleState::AcquiringDevices,
            LifecycleState::DevicesStarting,
            LifecycleState::DevicesHealthy,
            LifecycleState::ArtifactInstalling,
            LifecycleState::SuitesRunning,
            LifecycleState::ResultsCollected,
            LifecycleState::DevicesStopped,
            LifecycleState::Done,
        ]
    );
    for s in &report.summary.suites {
        assert_eq!(s.status, SuiteStatus::Classified);
        assert_eq!(s.passed(), 2, "{:?}", s);
        assert_eq!(s.attempts, 1);
    }
    assert_eq!(report.summary.tests_passed, 4);

    for device in ["emu-1", "emu-2"] {
        assert_eq!(log.teardowns(device), 1);
        assert_eq!(launches(&log, device), 1);
        assert_eq!(
            log.count(|c| matches!(c, BackendCall::Install { device: d, package } if d == device && package == "main")),
            1
        );
        assert_eq!(log.count(|c| matches!(c, BackendCall::CollectDiagnostics(d) if d == device)), 1);
    }

    let path = report.summary_path.clone().unwrap();
    assert_eq!(path, ws.upload_dir().join("run_summary.json"));
    let loaded = RunSummary::from_file(&path).unwrap();
    assert_eq!(loaded.verdict, Severity::Success);
    assert!(report.logs_dir.is_none());
    assert!(!ws.upload_dir().join("logs").exists());
}

#[test]
fn test_devices_start_before_any_suite() {
    let ws = Workspace::new();
    let config = ws.config(&[suite("alpha", "pass"), suite("beta", "pass")], &unbound_ports(2), RECORDING_EMULATOR);
    let (_, log) = run_with(config, |_| {});

    let calls = log.calls();
    let last_health = calls
        .iter()
        .rposition(|c| matches!(c, BackendCall::CheckHealth(_)))
        .unwrap();
    let first_install = calls
        .iter()
        .position(|c| matches!(c, BackendCall::Install { .. }))
        .unwrap();
    let first_launch_after = calls
        .iter()
        .skip(last_health + 1)
        .position(|c| matches!(c, BackendCall::Launch(_)));
    assert!(last_health < first_install);
    assert!(first_launch_after.is_none());
}

#[test]
fn test_redirect_failure_restarts_every_device() {
    let ws = Workspace::new();
    let config = ws.config(&[suite("alpha", "pass"), suite("beta", "pass")], &unbound_ports(2), RECORDING_EMULATOR);
    let (report, log) = run_with(config, |b| {
        inject(b, FaultPoint::Redirect, FailureConfig::error("KO: busy").with_fail_count(1));
    });

    assert_eq!(report.verdict(), Severity::Success);
    for device in ["emu-1", "emu-2"] {
        assert_eq!(launches(&log, device), 2);
        assert_eq!(log.count(|c| matches!(c, BackendCall::AbortStart(d) if d == device)), 1);
        assert_eq!(log.teardowns(device), 1);
    }
    for device in &report.summary.devices {
        assert_eq!(device.launched_pids.len(), 2);
        assert_ne!(device.launched_pids[0], device.launched_pids[1]);
    }
    let startup = report
        .summary
        .phases
        .iter()
        .find(|p| p.phase == LifecycleState::DevicesStarting)
        .unwrap();
    assert!(startup.message.contains("2 attempt(s)"), "{}", startup.message);
}

#[test]
fn test_startup_gives_up_after_configured_attempts() {
    let ws = Workspace::new();
    let config = ws.config(&[suite("alpha", "pass"), suite("beta", "pass")], &unbound_ports(2), RECORDING_EMULATOR);
    let (report, log) = run_with(config, |b| {
        inject(b, FaultPoint::Redirect, FailureConfig::error("KO: busy").for_device("emu-2"));
    });

    assert_eq!(report.verdict(), Severity::Fatal);
    assert_eq!(report.exit_code(), 4);
    assert_eq!(report.summary.final_state, LifecycleState::Failed);
    assert_eq!(report.failed_from(), Some(LifecycleState::DevicesStarting));
    let failure = report.summary.phases.iter().find(|p| p.failure_kind.is_some()).unwrap();
    assert_eq!(failure.failure_kind, Some(FailureKind::Startup));
    assert_eq!(launches(&log, "emu-1"), 3);
    assert_eq!(launches(&log, "emu-2"), 3);
    assert!(report.summary.suites.is_empty());
    assert_eq!(log.count(|c| matches!(c, BackendCall::Install { .. })), 0);
}

#[test]
fn test_spawn_failure_is_not_retried() {
    let ws = Workspace::new();
    let config = ws.config(&[suite("alpha", "pass"), suite("beta", "pass")], &unbound_ports(2), RECORDING_EMULATOR);
    let (report, log) = run_with(config, |b| {
        inject(b, FaultPoint::Launch, FailureConfig::error("no emulator").fatal().for_device("emu-1"));
    });

    assert_eq!(report.failed_from(), Some(LifecycleState::DevicesStarting));
    let failure = report.summary.phases.iter().find(|p| p.failure_kind.is_some()).unwrap();
    assert_eq!(failure.failure_kind, Some(FailureKind::Launch));
    assert_eq!(launches(&log, "emu-1"), 1);
    assert_eq!(launches(&log, "emu-2"), 0);
    assert_eq!(log.teardowns("emu-1"), 1);
    assert_eq!(log.teardowns("emu-2"), 1);
}

#[test]
fn test_teardown_exactly_once_for_every_fault_point() {
    for point in [
        FaultPoint::Acquire,
        FaultPoint::Launch,
        FaultPoint::Redirect,
        FaultPoint::Health,
        FaultPoint::Install,
    ] {
        let ws = Workspace::new();
        let config = ws.config(&[suite("alpha", "pass"), suite("beta", "pass")], &unbound_ports(2), RECORDING_EMULATOR);
        let (report, log) = run_with(config, |b| {
            inject(b, point, FailureConfig::error("injected").for_device("emu-2"));
        });

        assert_eq!(report.verdict(), Severity::Fatal, "{:?}", point);
        if point == FaultPoint::Acquire {
            // Never acquired, never torn down.
            assert_eq!(log.teardowns("emu-1"), 1, "{:?}", point);
            assert_eq!(log.teardowns("emu-2"), 0, "{:?}", point);
            assert_eq!(report.failed_from(), Some(LifecycleState::AcquiringDevices));
        } else {
            assert_eq!(log.teardowns("emu-1"), 1, "{:?}", point);
            assert_eq!(log.teardowns("emu-2"), 1, "{:?}", point);
        }
        let last = log.calls().into_iter().rev().find(|c| !matches!(c, BackendCall::Teardown(_)));
        assert!(
            !matches!(last, Some(BackendCall::Launch(_))),
            "{:?}: launch after teardown",
            point
        );
    }
}

#[test]
fn test_failed_main_install_blocks_only_that_suite() {
    let ws = Workspace::new();
    let config = ws.config(&[suite("alpha", "pass"), suite("beta", "pass")], &unbound_ports(2), RECORDING_EMULATOR);
    let (report, log) = run_with(config, |b| {
        inject(
            b,
            FaultPoint::Install,
            FailureConfig::error("Failure [INSTALL_FAILED_INSUFFICIENT_STORAGE]")
                .for_device("emu-2")
                .for_package("main"),
        );
    });

    assert_eq!(report.verdict(), Severity::Fatal);
    assert_eq!(report.summary.final_state, LifecycleState::Done);
    assert_eq!(report.summary.suites_blocked, 1);

    let alpha = report.summary.suites.iter().find(|s| s.suite == "alpha").unwrap();
    let beta = report.summary.suites.iter().find(|s| s.suite == "beta").unwrap();
    assert_eq!(alpha.verdict, Severity::Success);
    assert_eq!(beta.status, SuiteStatus::Blocked);
    assert_eq!(beta.attempts, 0);
    assert_eq!(beta.failure_kind, Some(FailureKind::Install));
    assert!(beta.message.as_deref().unwrap_or("").contains("INSTALL_FAILED"));
    assert_eq!(log.count(|c| matches!(c, BackendCall::CollectDiagnostics(d) if d == "emu-2")), 0);

    // Non-clean run keeps the suite logs.
    let logs = report.logs_dir.clone().unwrap();
    assert!(logs.join("alpha-emu-1.log").exists());
    assert_eq!(alpha.log_path.as_deref(), Some(logs.join("alpha-emu-1.log").as_path()));
}

#[test]
fn test_required_and_optional_packages() {
    let ws = Workspace::new();
    let mut text = ws.config_text(
        &[
            suite_with("alpha", "pass", "requires = [\"robocop\"]"),
            suite("beta", "pass"),
        ],
        &unbound_ports(2),
        RECORDING_EMULATOR,
    );
    text.push_str("\n[package.robocop]\npath = \"robocop.apk\"\n\n[package.extras]\npath = \"extras.apk\"\nalways = true\n");
    let config = HarnessConfig::parse(&text).unwrap();

    let (report, log) = run_with(config, |b| {
        inject(b, FaultPoint::Install, FailureConfig::error("Failure").for_package("extras"));
    });

    // An optional install failure only warns.
    assert_eq!(report.verdict(), Severity::Warning);
    let install = report
        .summary
        .phases
        .iter()
        .find(|p| p.phase == LifecycleState::ArtifactInstalling)
        .unwrap();
    assert_eq!(install.severity, Severity::Warning);

    let robocop_installs =
        log.count(|c| matches!(c, BackendCall::Install { device, package } if package == "robocop" && device == "emu-1"));
    assert_eq!(robocop_installs, 1);
    assert_eq!(
        log.count(|c| matches!(c, BackendCall::Install { package, .. } if package == "robocop")),
        1,
        "robocop is only needed by alpha"
    );
    assert_eq!(log.count(|c| matches!(c, BackendCall::Install { package, .. } if package == "extras")), 2);
}

#[test]
fn test_required_package_failure_blocks_suite() {
    let ws = Workspace::new();
    let mut text = ws.config_text(
        &[suite_with("alpha", "pass", "requires = [\"robocop\"]")],
        &unbound_ports(1),
        RECORDING_EMULATOR,
    );
    text.push_str("\n[package.robocop]\npath = \"robocop.apk\"\n");
    let config = HarnessConfig::parse(&text).unwrap();

    let (report, _) = run_with(config, |b| {
        inject(b, FaultPoint::Install, FailureConfig::error("Failure").for_package("robocop"));
    });

    assert_eq!(report.verdict(), Severity::Fatal);
    assert_eq!(report.summary.suites[0].status, SuiteStatus::Blocked);
}

#[test]
fn test_warning_suite() {
    let ws = Workspace::new();
    let config = ws.config(&[suite("alpha", "warn")], &unbound_ports(1), RECORDING_EMULATOR);
    let (report, _) = run_with(config, |_| {});

    assert_eq!(report.verdict(), Severity::Warning);
    assert_eq!(report.exit_code(), 1);
    let alpha = &report.summary.suites[0];
    assert_eq!(alpha.passed(), 1);
    assert_eq!(alpha.failed(), 1);
    assert!(alpha.failure_kind.is_none());
}

#[test]
fn test_unrecognised_output_is_failure() {
    let ws = Workspace::new();
    let config = ws.config(&[suite("alpha", "quiet")], &unbound_ports(1), RECORDING_EMULATOR);
    let (report, _) = run_with(config, |_| {});

    assert_eq!(report.verdict(), Severity::Failure);
    assert_eq!(report.summary.suites[0].failure_kind, Some(FailureKind::Ambiguous));
}

#[test]
fn test_overall_timeout_kills_suite_and_keeps_log() {
    let ws = Workspace::new();
    let config = ws.config(
        &[suite_with("alpha", "hang", "timeout_secs = 1.0"), suite("beta", "pass")],
        &unbound_ports(2),
        RECORDING_EMULATOR,
    );
    let started = Instant::now();
    let (report, _) = run_with(config, |_| {});

    assert!(started.elapsed() < Duration::from_secs(15));
    assert_eq!(report.verdict(), Severity::Failure);
    assert_eq!(report.exit_code(), 2);
    let alpha = report.summary.suites.iter().find(|s| s.suite == "alpha").unwrap();
    assert_eq!(alpha.failure_kind, Some(FailureKind::TimeoutOverall));
    assert_eq!(alpha.classification.as_ref().unwrap().exit_code, None);

    let log = report.logs_dir.clone().unwrap().join("alpha-emu-1.log");
    let text = std::fs::read_to_string(log).unwrap();
    assert!(text.contains("TEST-PASS | test_a.html"));
}

#[test]
fn test_rerun_marker_triggers_second_attempt() {
    let ws = Workspace::new();
    let config = ws.config(
        &[suite_with("alpha", "rerun", "rerun_on = \"RERUN-REQUESTED\"\nmax_runs = 2")],
        &unbound_ports(1),
        RECORDING_EMULATOR,
    );
    let (report, log) = run_with(config, |_| {});

    assert_eq!(report.verdict(), Severity::Success);
    let alpha = &report.summary.suites[0];
    assert_eq!(alpha.attempts, 2);
    assert_eq!(alpha.passed(), 1);
    assert_eq!(log.count(|c| matches!(c, BackendCall::CollectDiagnostics(_))), 2);
}

#[test]
fn test_rerun_limit_is_fatal() {
    let ws = Workspace::new();
    let config = ws.config(
        &[suite_with("alpha", "always-rerun", "rerun_on = \"RERUN-REQUESTED\"\nmax_runs = 2")],
        &unbound_ports(1),
        RECORDING_EMULATOR,
    );
    let (report, _) = run_with(config, |_| {});

    let alpha = &report.summary.suites[0];
    assert_eq!(alpha.attempts, 2);
    assert_eq!(alpha.failure_kind, Some(FailureKind::RerunExhausted));
    assert_eq!(report.verdict(), Severity::Fatal);
    let logs = report.logs_dir.clone().unwrap();
    assert!(logs.join("alpha-emu-1.log").exists());
    assert!(logs.join("alpha-emu-1-run2.log").exists());
}

#[test]
fn test_more_suites_than_devices_rejected_before_any_device() {
    let ws = Workspace::new();
    let mut config = ws.config(&[suite("alpha", "pass"), suite("beta", "pass")], &unbound_ports(2), RECORDING_EMULATOR);
    config.devices.truncate(1);

    let backend = RecordingBackend::new();
    let log = backend.log();
    let err = Controller::new(config, backend).err().unwrap();

    assert!(matches!(
        err,
        LifecycleError::Config(ConfigError::TooManySuites { suites: 2, devices: 1 })
    ));
    assert!(log.calls().is_empty());
}

#[test]
fn test_cancel_before_start_touches_nothing() {
    let ws = Workspace::new();
    let config = ws.config(&[suite("alpha", "pass")], &unbound_ports(1), RECORDING_EMULATOR);
    let signal = Arc::new(SignalState::new());
    signal.cancel();

    let backend = RecordingBackend::new();
    let log = backend.log();
    let report = Controller::new(config, backend).unwrap().with_signal_state(signal).run();

    assert_eq!(report.failed_from(), Some(LifecycleState::Idle));
    assert_eq!(report.exit_code(), 4);
    assert!(log.calls().is_empty());
    let failure = report.summary.phases.iter().find(|p| p.failure_kind.is_some()).unwrap();
    assert_eq!(failure.failure_kind, Some(FailureKind::Cancelled));
}

#[test]
fn test_cancel_while_suites_run() {
    let ws = Workspace::new();
    let config = ws.config(&[suite("alpha", "hang"), suite("beta", "hang")], &unbound_ports(2), RECORDING_EMULATOR);
    let signal = Arc::new(SignalState::new());

    let backend = RecordingBackend::new();
    let log = backend.log();
    let trigger = Arc::clone(&signal);
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(800));
        let live = trigger.process_groups().list().len();
        trigger.cancel();
        live
    });

    let started = Instant::now();
    let report = Controller::new(config, backend).unwrap().with_signal_state(Arc::clone(&signal)).run();
    let live_groups = canceller.join().unwrap();

    assert!(started.elapsed() < Duration::from_secs(15));
    // Children were listed for a forced exit; teardown unlisted all of them.
    assert!(live_groups >= 2, "{} process groups listed", live_groups);
    assert!(signal.process_groups().list().is_empty());
    assert_eq!(report.failed_from(), Some(LifecycleState::SuitesRunning));
    assert_eq!(report.verdict(), Severity::Fatal);
    assert_eq!(report.summary.suites.len(), 2);
    for s in &report.summary.suites {
        assert_eq!(s.status, SuiteStatus::Cancelled);
    }
    assert_eq!(log.teardowns("emu-1"), 1);
    assert_eq!(log.teardowns("emu-2"), 1);
}
