//! Line-oriented TCP channel with telnet-style reads.

use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use crate::retry::RetryPolicy;

/// Connection could not be established.
#[derive(Debug, thiserror::Error)]
#[error("connection to {target} failed after {attempts} attempt(s): {source}")]
pub struct ConnectError {
    pub target: String,
    pub attempts: u32,
    #[source]
    pub source: io::Error,
}

/// I/O failure on an established channel.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel I/O error: {0}")]
    Io(#[from] io::Error),
}

/// An open connection to a device console or agent.
#[derive(Debug)]
pub struct Channel {
    stream: TcpStream,
    target: String,
    pending: Vec<u8>,
}

impl Channel {
    /// Single connection attempt bounded by `timeout`.
    pub fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self, ConnectError> {
        let target = format!("{}:{}", host, port);
        let fail = |source: io::Error| ConnectError {
            target: target.clone(),
            attempts: 1,
            source,
        };
        let addrs: Vec<_> = (host, port).to_socket_addrs().map_err(fail)?.collect();
        let mut last = io::Error::new(ErrorKind::AddrNotAvailable, "no address resolved");
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    return Ok(Self {
                        stream,
                        target,
                        pending: Vec::new(),
                    });
                }
                Err(e) => last = e,
            }
        }
        Err(fail(last))
    }

    /// Connect, retrying per `policy`.
    pub fn connect_with_retry(
        host: &str,
        port: u16,
        timeout: Duration,
        policy: &RetryPolicy,
    ) -> Result<Self, ConnectError> {
        policy
            .run(|attempt| {
                tracing::info!(attempt, host, port, "connecting");
                Self::connect(host, port, timeout).map_err(|e| {
                    tracing::info!(attempt, error = %e.source, "connect attempt failed");
                    e
                })
            })
            .map_err(|exhausted| ConnectError {
                attempts: exhausted.attempts,
                ..exhausted.last
            })
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Read until `marker` has been seen, the peer closes, or `timeout`
    /// elapses. Returns everything read up to and including the marker;
    /// on timeout or close returns whatever arrived, so the caller decides
    /// whether a missing marker is an error.
    pub fn read_until(&mut self, marker: &str, timeout: Duration) -> Result<String, ChannelError> {
        let deadline = Instant::now() + timeout;
        let needle = marker.as_bytes();
        loop {
            if let Some(pos) = find(&self.pending, needle) {
                let rest = self.pending.split_off(pos + needle.len());
                let found = std::mem::replace(&mut self.pending, rest);
                return Ok(String::from_utf8_lossy(&found).into_owned());
            }
            match self.fill(deadline)? {
                Fill::Data => continue,
                Fill::Closed | Fill::TimedOut => return Ok(self.drain()),
            }
        }
    }

    /// Read until the peer closes the connection or `timeout` elapses.
    pub fn read_to_end(&mut self, timeout: Duration) -> Result<String, ChannelError> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.fill(deadline)? {
                Fill::Data => continue,
                Fill::Closed | Fill::TimedOut => return Ok(self.drain()),
            }
        }
    }

    /// Send `text` followed by a newline.
    pub fn write_line(&mut self, text: &str) -> Result<(), ChannelError> {
        let mut line = Vec::with_capacity(text.len() + 1);
        line.extend_from_slice(text.as_bytes());
        line.push(b'\n');
        self.stream.write_all(&line)?;
        self.stream.flush()?;
        Ok(())
    }

    pub fn close(self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    fn drain(&mut self) -> String {
        let data = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&data).into_owned()
    }

    fn fill(&mut self, deadline: Instant) -> Result<Fill, ChannelError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(Fill::TimedOut);
        }
        self.stream.set_read_timeout(Some(remaining))?;
        let mut chunk = [0u8; 1024];
        match self.stream.read(&mut chunk) {
            Ok(0) => Ok(Fill::Closed),
            Ok(n) => {
                self.pending.extend_from_slice(&chunk[..n]);
                Ok(Fill::Data)
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(Fill::TimedOut),
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(Fill::Data),
            Err(e) if e.kind() == ErrorKind::ConnectionReset => Ok(Fill::Closed),
            Err(e) => Err(e.into()),
        }
    }
}

enum Fill {
    Data,
    Closed,
    TimedOut,
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
