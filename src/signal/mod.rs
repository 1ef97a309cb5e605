//! SIGINT/SIGTERM handling.
//!
//! The first signal cancels the run: the lifecycle controller stops
//! waiting, terminates running suites, tears the devices down and reports
//! the run as fatal. A second signal exits the binary at once. Exiting
//! skips every destructor, so the handler first SIGKILLs the process
//! groups the supervisor has listed in the shared [`ProcessGroups`].

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::supervisor::ProcessGroups;

/// Granularity of [`SignalState::sleep`].
const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// Cancellation flag shared between the handler and the controller.
#[derive(Debug, Default)]
pub struct SignalState {
    cancelled: AtomicBool,
    received: AtomicU8,
    groups: ProcessGroups,
}

/// What the handler does with a delivered signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    Cancel,
    Exit,
    Ignore,
}

impl SignalState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Signals delivered so far.
    pub fn received(&self) -> u8 {
        self.received.load(Ordering::SeqCst)
    }

    /// Count a delivered signal.
    pub fn on_signal(&self) -> SignalAction {
        match self.received.fetch_add(1, Ordering::SeqCst) {
            0 => {
                self.cancel();
                SignalAction::Cancel
            }
            1 => SignalAction::Exit,
            _ => SignalAction::Ignore,
        }
    }

    /// Child process groups to kill on a forced exit.
    pub fn process_groups(&self) -> ProcessGroups {
        self.groups.clone()
    }

    /// Cancel without a signal.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Sleep up to `duration`. Returns true if the run was cancelled
    /// before or during the sleep.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        while !self.is_cancel_requested() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            std::thread::sleep((deadline - now).min(SLEEP_SLICE));
        }
        true
    }
}

/// Installs the process-wide handler.
pub struct SignalHandler {
    state: Arc<SignalState>,
}

impl SignalHandler {
    pub fn new() -> Self {
        Self {
            state: Arc::new(SignalState::new()),
        }
    }

    /// State to hand to [`crate::lifecycle::Controller::with_signal_state`].
    pub fn state(&self) -> Arc<SignalState> {
        Arc::clone(&self.state)
    }

    /// Install for SIGINT and SIGTERM (and SIGHUP); a second signal kills
    /// the listed process groups and exits with `exit_code`.
    pub fn install(&self, exit_code: i32) -> Result<(), ctrlc::Error> {
        let state = Arc::clone(&self.state);
        ctrlc::set_handler(move || match state.on_signal() {
            SignalAction::Cancel => {
                eprintln!("\nInterrupted: stopping suites and emulators (signal again to exit now)");
            }
            SignalAction::Exit => {
                let killed = state.process_groups().kill_all();
                eprintln!("\nInterrupted twice, killed {} process group(s), exiting", killed);
                std::process::exit(exit_code);
            }
            SignalAction::Ignore => {}
        })
    }
}

impl Default for SignalHandler {
    fn default() -> Self {
        Self::new()
    }
}
