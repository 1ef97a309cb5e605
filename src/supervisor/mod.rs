//! Process supervisor.
//!
//! Owns every child process the harness starts (emulators, suites,
//! installers, logcat) together with its capture file. Stdout and stderr
//! of a child are written straight into one temporary file, so the file
//! is complete once the exit status has been observed. Each child runs in
//! its own process group; termination signals the whole group.
//!
//! Dropping the supervisor terminates every child that is still running.
//! The process groups of live children are also listed in a shared
//! [`ProcessGroups`], so code that cannot reach the supervisor (a forced
//! exit from the signal handler) can still kill them.

pub mod stray;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tempfile::NamedTempFile;

/// Default SIGTERM to SIGKILL grace period.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10);

const POLL_STEP: Duration = Duration::from_millis(50);

/// Opaque handle for a supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(u64);

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "proc-{}", self.0)
    }
}

/// How a child ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    Exited(i32),
    Signaled(String),
}

impl ExitOutcome {
    /// Exit code, `None` when killed by a signal.
    pub fn code(&self) -> Option<i32> {
        match self {
            ExitOutcome::Exited(code) => Some(*code),
            ExitOutcome::Signaled(_) => None,
        }
    }

    pub fn success(&self) -> bool {
        matches!(self, ExitOutcome::Exited(0))
    }

    fn from_status(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return ExitOutcome::Exited(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(raw) = status.signal() {
                let name = nix::sys::signal::Signal::try_from(raw)
                    .map(|s| s.as_str().to_string())
                    .unwrap_or_else(|_| format!("SIG{}", raw));
                return ExitOutcome::Signaled(name);
            }
        }
        ExitOutcome::Signaled("unknown".to_string())
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitOutcome::Exited(code) => write!(f, "exit {}", code),
            ExitOutcome::Signaled(name) => write!(f, "killed by {}", name),
        }
    }
}

/// What to launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Human-readable name used in logs and preserved file names.
    pub label: String,
    pub argv: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Added to the inherited environment.
    pub env: BTreeMap<String, String>,
    /// Command-name fragment swept from the process table on termination.
    pub stray_pattern: Option<String>,
}

impl LaunchSpec {
    pub fn new(label: impl Into<String>, argv: Vec<String>) -> Self {
        Self {
            label: label.into(),
            argv,
            cwd: None,
            env: BTreeMap::new(),
            stray_pattern: None,
        }
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn envs(mut self, env: BTreeMap<String, String>) -> Self {
        self.env.extend(env);
        self
    }

    pub fn stray_pattern(mut self, pattern: Option<String>) -> Self {
        self.stray_pattern = pattern;
        self
    }

    /// Shell-style rendering for logs.
    pub fn command_line(&self) -> String {
        self.argv
            .iter()
            .map(|arg| {
                if arg.is_empty() || arg.chars().any(|c| c.is_whitespace() || c == '"' || c == '\'') {
                    format!("'{}'", arg.replace('\'', "'\\''"))
                } else {
                    arg.clone()
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// The child could not be started.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("{label}: empty command line")]
    EmptyCommand { label: String },

    #[error("{label}: failed to spawn '{program}': {source}")]
    Spawn {
        label: String,
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{label}: failed to create capture file: {source}")]
    Capture {
        label: String,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error("unknown process {0}")]
    UnknownProcess(ProcessId),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Output of a short auxiliary command.
#[derive(Debug, Clone)]
pub struct Completion {
    pub outcome: ExitOutcome,
    pub output: String,
    pub timed_out: bool,
}

#[derive(Debug)]
struct Supervised {
    label: String,
    child: Child,
    capture: NamedTempFile,
    outcome: Option<ExitOutcome>,
    stray_pattern: Option<String>,
}

/// Process group ids of supervised children that may still be alive.
#[derive(Debug, Clone, Default)]
pub struct ProcessGroups(Arc<Mutex<BTreeSet<u32>>>);

impl ProcessGroups {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, pgid: u32) {
        if let Ok(mut groups) = self.0.lock() {
            groups.insert(pgid);
        }
    }

    fn remove(&self, pgid: u32) {
        if let Ok(mut groups) = self.0.lock() {
            groups.remove(&pgid);
        }
    }

    pub fn list(&self) -> Vec<u32> {
        self.0.lock().map(|g| g.iter().copied().collect()).unwrap_or_default()
    }

    /// SIGKILL every listed group and clear the list. Returns how many
    /// groups were signalled.
    pub fn kill_all(&self) -> usize {
        let groups = match self.0.lock() {
            Ok(mut groups) => std::mem::take(&mut *groups),
            Err(_) => return 0,
        };
        groups.into_iter().filter(|pgid| kill_group(*pgid)).count()
    }
}

/// Owner of all child processes for one run.
#[derive(Debug)]
pub struct Supervisor {
    procs: BTreeMap<ProcessId, Supervised>,
    next_id: u64,
    grace: Duration,
    capture_dir: Option<PathBuf>,
    groups: ProcessGroups,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new(DEFAULT_GRACE_PERIOD)
    }
}

impl Supervisor {
    pub fn new(grace: Duration) -> Self {
        Self {
            procs: BTreeMap::new(),
            next_id: 1,
            grace,
            capture_dir: None,
            groups: ProcessGroups::new(),
        }
    }

    /// List child process groups in `groups` from now on, carrying over
    /// any already listed.
    pub fn set_process_groups(&mut self, groups: ProcessGroups) {
        for pgid in self.groups.list() {
            groups.insert(pgid);
        }
        self.groups = groups;
    }

    pub fn process_groups(&self) -> ProcessGroups {
        self.groups.clone()
    }

    /// Place capture files in `dir` instead of the system temp dir.
    pub fn with_capture_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.capture_dir = Some(dir.into());
        self
    }

    pub fn grace_period(&self) -> Duration {
        self.grace
    }

    /// Spawn `spec` with merged stdout/stderr captured to a temp file.
    pub fn launch(&mut self, spec: LaunchSpec) -> Result<ProcessId, LaunchError> {
        let Some((program, args)) = spec.argv.split_first() else {
            return Err(LaunchError::EmptyCommand { label: spec.label });
        };
        let capture_err = |source| LaunchError::Capture {
            label: spec.label.clone(),
            source,
        };

        let mut builder = tempfile::Builder::new();
        builder.prefix("emu-").suffix(".log");
        let capture = match &self.capture_dir {
            Some(dir) => builder.tempfile_in(dir),
            None => builder.tempfile(),
        }
        .map_err(capture_err)?;
        let stdout = capture.reopen().map_err(capture_err)?;
        let stderr = stdout.try_clone().map_err(capture_err)?;

        let mut command = Command::new(program);
        command
            .args(args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);
        if let Some(dir) = &spec.cwd {
            command.current_dir(dir);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let child = command.spawn().map_err(|source| LaunchError::Spawn {
            label: spec.label.clone(),
            program: program.clone(),
            source,
        })?;

        self.groups.insert(child.id());
        let id = ProcessId(self.next_id);
        self.next_id += 1;
        tracing::info!(
            process = %id,
            pid = child.id(),
            label = %spec.label,
            capture = %capture.path().display(),
            "launched: {}",
            spec.command_line()
        );
        self.procs.insert(
            id,
            Supervised {
                label: spec.label,
                child,
                capture,
                outcome: None,
                stray_pattern: spec.stray_pattern,
            },
        );
        Ok(id)
    }

    /// Non-blocking exit check.
    pub fn poll(&mut self, id: ProcessId) -> Result<Option<ExitOutcome>, SupervisorError> {
        let proc = self.get_mut(id)?;
        if proc.outcome.is_none() {
            if let Some(status) = proc.child.try_wait()? {
                let outcome = ExitOutcome::from_status(status);
                tracing::debug!(process = %id, label = %proc.label, %outcome, "process exited");
                proc.outcome = Some(outcome);
            }
        }
        Ok(proc.outcome.clone())
    }

    pub fn is_running(&mut self, id: ProcessId) -> Result<bool, SupervisorError> {
        Ok(self.poll(id)?.is_none())
    }

    /// Everything the child has written so far.
    pub fn read_output(&self, id: ProcessId) -> Result<String, SupervisorError> {
        let proc = self.get(id)?;
        let bytes = fs::read(proc.capture.path())?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Current size of the capture file; grows with every write.
    pub fn output_len(&self, id: ProcessId) -> Result<u64, SupervisorError> {
        Ok(fs::metadata(self.get(id)?.capture.path())?.len())
    }

    pub fn capture_path(&self, id: ProcessId) -> Result<&Path, SupervisorError> {
        Ok(self.get(id)?.capture.path())
    }

    pub fn label(&self, id: ProcessId) -> Result<&str, SupervisorError> {
        Ok(&self.get(id)?.label)
    }

    pub fn pid(&self, id: ProcessId) -> Result<u32, SupervisorError> {
        Ok(self.get(id)?.child.id())
    }

    /// Every child not yet released, running or not.
    pub fn ids(&self) -> Vec<ProcessId> {
        self.procs.keys().copied().collect()
    }

    /// Ids of children not yet observed to exit.
    pub fn running(&self) -> Vec<ProcessId> {
        self.procs
            .iter()
            .filter(|(_, p)| p.outcome.is_none())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Stop a child: SIGTERM to its process group, wait the grace
    /// period, then SIGKILL. Afterwards any process matching the launch's
    /// stray pattern is killed. Safe to call on an exited child.
    pub fn terminate(&mut self, id: ProcessId) -> Result<ExitOutcome, SupervisorError> {
        let grace = self.grace;
        let groups = self.groups.clone();
        let proc = self.get_mut(id)?;

        if proc.outcome.is_none() {
            if let Some(status) = proc.child.try_wait()? {
                proc.outcome = Some(ExitOutcome::from_status(status));
            }
        }

        if proc.outcome.is_none() {
            tracing::info!(process = %id, label = %proc.label, "terminating");
            signal_group(&mut proc.child, GroupSignal::Term);

            let start = Instant::now();
            while start.elapsed() < grace {
                if let Some(status) = proc.child.try_wait()? {
                    proc.outcome = Some(ExitOutcome::from_status(status));
                    break;
                }
                std::thread::sleep(POLL_STEP);
            }

            if proc.outcome.is_none() {
                tracing::warn!(process = %id, label = %proc.label, "grace period expired, killing");
                signal_group(&mut proc.child, GroupSignal::Kill);
                let status = proc.child.wait()?;
                proc.outcome = Some(ExitOutcome::from_status(status));
            }
        }

        groups.remove(proc.child.id());

        if let Some(pattern) = proc.stray_pattern.clone() {
            if let Err(e) = stray::kill_matching(&pattern) {
                tracing::warn!(pattern = %pattern, error = %e, "stray process sweep failed");
            }
        }

        let outcome = proc.outcome.clone().unwrap_or_else(|| ExitOutcome::Signaled("unknown".to_string()));
        Ok(outcome)
    }

    /// Terminate every child still running.
    pub fn terminate_all(&mut self) {
        let ids: Vec<_> = self.procs.keys().copied().collect();
        let mut swept = BTreeSet::new();
        for id in ids {
            let running = self.procs.get(&id).map(|p| p.outcome.is_none()).unwrap_or(false);
            if !running {
                continue;
            }
            if let Some(pattern) = self.procs.get(&id).and_then(|p| p.stray_pattern.clone()) {
                if !swept.insert(pattern) {
                    // Already swept by an earlier sibling.
                    if let Some(p) = self.procs.get_mut(&id) {
                        p.stray_pattern = None;
                    }
                }
            }
            if let Err(e) = self.terminate(id) {
                tracing::warn!(process = %id, error = %e, "terminate failed");
            }
        }
    }

    /// Copy the capture file to `dest_dir/<file_name>`.
    pub fn preserve(&self, id: ProcessId, dest_dir: &Path, file_name: &str) -> Result<PathBuf, SupervisorError> {
        let proc = self.get(id)?;
        fs::create_dir_all(dest_dir)?;
        let dest = dest_dir.join(file_name);
        fs::copy(proc.capture.path(), &dest)?;
        tracing::info!(process = %id, dest = %dest.display(), "preserved output");
        Ok(dest)
    }

    /// Forget a child, terminating it first if needed. The capture file
    /// is removed.
    pub fn release(&mut self, id: ProcessId) -> Result<(), SupervisorError> {
        if self.get(id)?.outcome.is_none() {
            self.terminate(id)?;
        }
        if let Some(proc) = self.procs.remove(&id) {
            self.groups.remove(proc.child.id());
            let path = proc.capture.path().to_path_buf();
            if let Err(e) = proc.capture.close() {
                tracing::debug!(path = %path.display(), error = %e, "capture file removal failed");
            }
        }
        Ok(())
    }

    /// Launch, wait up to `timeout`, collect output, release.
    pub fn run_to_completion(&mut self, spec: LaunchSpec, timeout: Duration) -> Result<Completion, SupervisorError> {
        let id = self.launch(spec)?;
        let start = Instant::now();
        let mut timed_out = false;
        let outcome = loop {
            if let Some(outcome) = self.poll(id)? {
                break outcome;
            }
            if start.elapsed() >= timeout {
                timed_out = true;
                break self.terminate(id)?;
            }
            std::thread::sleep(POLL_STEP);
        };
        let output = self.read_output(id)?;
        self.release(id)?;
        Ok(Completion {
            outcome,
            output,
            timed_out,
        })
    }

    fn get(&self, id: ProcessId) -> Result<&Supervised, SupervisorError> {
        self.procs.get(&id).ok_or(SupervisorError::UnknownProcess(id))
    }

    fn get_mut(&mut self, id: ProcessId) -> Result<&mut Supervised, SupervisorError> {
        self.procs.get_mut(&id).ok_or(SupervisorError::UnknownProcess(id))
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if !self.running().is_empty() {
            tracing::info!(count = self.running().len(), "supervisor dropped with live children");
            self.terminate_all();
        }
    }
}

enum GroupSignal {
    Term,
    Kill,
}

#[cfg(unix)]
fn signal_group(child: &mut Child, sig: GroupSignal) {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    let pgid = Pid::from_raw(child.id() as i32);
    let sig = match sig {
        GroupSignal::Term => Signal::SIGTERM,
        GroupSignal::Kill => Signal::SIGKILL,
    };
    if signal::killpg(pgid, sig).is_err() {
        let _ = signal::kill(pgid, sig);
    }
}

#[cfg(not(unix))]
fn signal_group(child: &mut Child, _sig: GroupSignal) {
    let _ = child.kill();
}

#[cfg(unix)]
fn kill_group(pgid: u32) -> bool {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    signal::killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL).is_ok()
}

#[cfg(not(unix))]
fn kill_group(_pgid: u32) -> bool {
    false
}
