//! Kill processes by command name.
//!
//! Emulators fork helper processes that escape the launched process
//! group, so teardown also sweeps the process table for the configured
//! name.

use std::io;
use std::process::Command;

/// Parse `ps -A -o pid=,comm=` output into `(pid, command)` pairs whose
/// command contains `pattern`.
pub fn matching_pids(ps_output: &str, pattern: &str) -> Vec<(u32, String)> {
    ps_output
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let (pid, comm) = line.split_once(char::is_whitespace)?;
            let pid = pid.parse::<u32>().ok()?;
            let comm = comm.trim();
            comm.contains(pattern).then(|| (pid, comm.to_string()))
        })
        .collect()
}

/// SIGKILL every process whose command name contains `pattern`,
/// excluding the current process. Returns the number signalled.
pub fn kill_matching(pattern: &str) -> io::Result<usize> {
    if pattern.is_empty() {
        return Ok(0);
    }
    let output = Command::new("ps").args(["-A", "-o", "pid=,comm="]).output()?;
    let listing = String::from_utf8_lossy(&output.stdout);
    let me = std::process::id();

    let mut killed = 0;
    for (pid, comm) in matching_pids(&listing, pattern) {
        if pid == me {
            continue;
        }
        tracing::info!(pid, command = %comm, "killing stray process");
        if send_kill(pid) {
            killed += 1;
        }
    }
    Ok(killed)
}

#[cfg(unix)]
fn send_kill(pid: u32) -> bool {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL).is_ok()
}

#[cfg(not(unix))]
fn send_kill(_pid: u32) -> bool {
    false
}
