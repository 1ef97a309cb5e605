//! On-device test agent probe.

use std::time::Duration;

use crate::channel::{Channel, ChannelError, ConnectError};
use crate::retry::RetryPolicy;

pub const PROMPT: &str = "$>";

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("agent on port {port} did not show prompt after {attempts} attempt(s); last output: {got:?}")]
    NoPrompt { port: u16, attempts: u32, got: String },
}

/// Connect to the agent, wait for its prompt and leave with `quit`.
/// The whole exchange is retried per `policy`.
pub fn probe(
    host: &str,
    port: u16,
    policy: &RetryPolicy,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<(), AgentError> {
    policy
        .run(|attempt| probe_once(host, port, connect_timeout, read_timeout, attempt))
        .map_err(|exhausted| match exhausted.last {
            AgentError::NoPrompt { got, .. } => AgentError::NoPrompt {
                port,
                attempts: exhausted.attempts,
                got,
            },
            AgentError::Connect(e) => AgentError::Connect(ConnectError {
                attempts: exhausted.attempts,
                ..e
            }),
            other => other,
        })
}

fn probe_once(
    host: &str,
    port: u16,
    connect_timeout: Duration,
    read_timeout: Duration,
    attempt: u32,
) -> Result<(), AgentError> {
    tracing::debug!(port, attempt, "probing agent");
    let mut channel = Channel::connect(host, port, connect_timeout)?;
    let got = channel.read_until(PROMPT, read_timeout)?;
    if !got.contains(PROMPT) {
        channel.close();
        return Err(AgentError::NoPrompt { port, attempts: attempt, got });
    }
    // The prompt is the health signal; a failed goodbye is not.
    if let Err(e) = channel.write_line("quit") {
        tracing::debug!(port, error = %e, "agent quit not delivered");
    }
    channel.close();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_probe_sees_prompt() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        thread::spawn(move || {
            let (mut s, _) = listener.accept().unwrap();
            s.write_all(b"$>\x00").unwrap();
            thread::sleep(Duration::from_millis(100));
        });
        probe(
            "127.0.0.1",
            port,
            &RetryPolicy::once(),
            Duration::from_secs(1),
            Duration::from_secs(2),
        )
        .unwrap();
    }

    #[test]
    fn test_probe_retries_until_prompt() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let served = Arc::new(AtomicU32::new(0));
        let counter = served.clone();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut s) = stream else { break };
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n >= 3 {
                    let _ = s.write_all(b"$>");
                } else {
                    let _ = s.write_all(b"booting");
                }
            }
        });
        let policy = RetryPolicy::fixed(4, Duration::ZERO);
        probe("127.0.0.1", port, &policy, Duration::from_secs(1), Duration::from_secs(2)).unwrap();
        assert_eq!(served.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_probe_gives_up_without_prompt() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut s) = stream else { break };
                let _ = s.write_all(b"not a prompt");
            }
        });
        let policy = RetryPolicy::fixed(2, Duration::ZERO);
        let err = probe("127.0.0.1", port, &policy, Duration::from_secs(1), Duration::from_secs(2)).unwrap_err();
        match err {
            AgentError::NoPrompt { attempts, got, .. } => {
                assert_eq!(attempts, 2);
                assert_eq!(got, "not a prompt");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
