//! Emulator console protocol: port redirection and status report.
//!
//! The console greets with a banner ending in `OK`, accepts one command
//! per line and answers each with `OK` (or `KO: ...`). A session ends
//! with `quit`, after which the console closes the connection.

use std::time::{Duration, Instant};

use crate::channel::{Channel, ChannelError, ConnectError};
use crate::retry::RetryPolicy;

pub const OK_MARKER: &str = "OK";
pub const KO_MARKER: &str = "KO";

/// Console session failure.
#[derive(Debug, thiserror::Error)]
pub enum ConsoleError {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("unexpected console reply (expected '{expected}'): {got:?}")]
    Protocol { expected: String, got: String },
}

/// Read bounds for one console session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsoleTimeouts {
    pub connect: Duration,
    pub read: Duration,
}

impl Default for ConsoleTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            read: Duration::from_secs(10),
        }
    }
}

/// A host-local to device port forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Redirect {
    pub local: u16,
    pub device: u16,
}

impl Redirect {
    pub fn command(&self) -> String {
        format!("redir add tcp:{}:{}", self.local, self.device)
    }
}

/// Install every redirect through the console at `host:console_port`.
///
/// A connection is retried per `policy`; the protocol exchange itself is
/// attempted once. Each `redir add` must be answered with `OK`; the first
/// refusal ends the session with [`ConsoleError::Protocol`].
pub fn redirect(
    host: &str,
    console_port: u16,
    redirects: &[Redirect],
    policy: &RetryPolicy,
    timeouts: ConsoleTimeouts,
) -> Result<String, ConsoleError> {
    let mut channel = Channel::connect_with_retry(host, console_port, timeouts.connect, policy)?;

    let banner = channel.read_until(OK_MARKER, timeouts.read)?;
    if !banner.contains(OK_MARKER) {
        tracing::warn!(console_port, banner = %banner.trim(), "console banner missing OK");
    }

    let mut replies = Vec::with_capacity(redirects.len());
    for r in redirects {
        tracing::info!(console_port, local = r.local, device = r.device, "adding redirect");
        channel.write_line(&r.command())?;
        let reply = read_reply(&mut channel, timeouts.read)?;
        if !reply.starts_with(OK_MARKER) {
            channel.close();
            return Err(ConsoleError::Protocol {
                expected: format!("{} for '{}'", OK_MARKER, r.command()),
                got: reply,
            });
        }
        replies.push(reply);
    }
    channel.write_line("quit")?;
    channel.read_to_end(timeouts.read)?;
    channel.close();
    Ok(replies.join("\n"))
}

/// Next status line (`OK` or `KO: ...`), skipping blank and informational
/// lines. Returns whatever arrived if the console goes quiet first.
fn read_reply(channel: &mut Channel, timeout: Duration) -> Result<String, ChannelError> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let line = channel.read_until("\n", remaining)?;
        let complete = line.ends_with('\n');
        let trimmed = line.trim();
        if trimmed.starts_with(OK_MARKER) || trimmed.starts_with(KO_MARKER) || !complete {
            return Ok(trimmed.to_string());
        }
    }
}

/// Commands sent for a status report, in order.
pub const STATUS_COMMANDS: &[&str] = &["avd status", "redir list", "network status"];

/// Collect the console's view of the device: AVD state, active
/// redirects, network status. Each answer is read up to its `OK`.
pub fn status_report(host: &str, console_port: u16, timeouts: ConsoleTimeouts) -> Result<String, ConsoleError> {
    let mut channel = Channel::connect(host, console_port, timeouts.connect)?;
    channel.read_until(OK_MARKER, timeouts.read)?;

    let mut report = String::new();
    for cmd in STATUS_COMMANDS {
        channel.write_line(cmd)?;
        let answer = channel.read_until(OK_MARKER, timeouts.read)?;
        if !answer.contains(OK_MARKER) {
            channel.close();
            return Err(ConsoleError::Protocol {
                expected: OK_MARKER.to_string(),
                got: answer,
            });
        }
        report.push_str(&format!("> {}\n{}\n", cmd, answer.trim()));
    }
    channel.write_line("quit")?;
    channel.close();
    Ok(report)
}
