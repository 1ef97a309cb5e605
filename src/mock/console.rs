//! Mock emulator console and device agent.
//!
//! Both listen on 127.0.0.1 and serve every connection on its own thread
//! until dropped. The console speaks enough of the emulator console
//! protocol for port redirection and status reports; the agent just shows
//! its prompt.

use std::io::{self, BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const BANNER: &str = "Android Console: type 'help' for a list of commands\r\nOK\r\n";
const SESSION_TIMEOUT: Duration = Duration::from_secs(5);

/// Accept loop shared by the console and the agent.
struct Listener {
    port: u16,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Listener {
    fn spawn<F>(port: u16, serve: F) -> io::Result<Self>
    where
        F: Fn(TcpStream) + Send + Sync + 'static,
    {
        let listener = TcpListener::bind(("127.0.0.1", port))?;
        let port = listener.local_addr()?.port();
        let stop = Arc::new(AtomicBool::new(false));
        let serve = Arc::new(serve);
        let flag = Arc::clone(&stop);
        let handle = thread::spawn(move || {
            for stream in listener.incoming() {
                if flag.load(Ordering::SeqCst) {
                    break;
                }
                let Ok(stream) = stream else { continue };
                let _ = stream.set_read_timeout(Some(SESSION_TIMEOUT));
                let serve = Arc::clone(&serve);
                thread::spawn(move || serve(stream));
            }
        });
        Ok(Self {
            port,
            stop,
            handle: Some(handle),
        })
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        // Wake the accept loop so it sees the flag.
        let _ = TcpStream::connect(("127.0.0.1", self.port));
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[derive(Debug, Default)]
struct ConsoleState {
    commands: Mutex<Vec<String>>,
    sessions: AtomicU32,
    /// Sessions left whose redirects are refused.
    failing_sessions: AtomicU32,
    /// Sessions left whose first redirect only is refused.
    partial_sessions: AtomicU32,
}

/// Scripted emulator console.
pub struct MockConsole {
    state: Arc<ConsoleState>,
    listener: Listener,
}

impl MockConsole {
    /// Listen on an ephemeral port.
    pub fn start() -> io::Result<Self> {
        Self::start_on(0)
    }

    pub fn start_on(port: u16) -> io::Result<Self> {
        let state = Arc::new(ConsoleState::default());
        let shared = Arc::clone(&state);
        let listener = Listener::spawn(port, move |stream| serve_console(stream, &shared))?;
        Ok(Self { state, listener })
    }

    /// Answer `KO` to every redirect in the next `sessions` sessions.
    pub fn fail_redirects(&self, sessions: u32) {
        self.state.failing_sessions.store(sessions, Ordering::SeqCst);
    }

    /// Answer `KO` to the first redirect only, in the next `sessions`
    /// sessions; later redirects in those sessions are accepted.
    pub fn fail_first_redirect(&self, sessions: u32) {
        self.state.partial_sessions.store(sessions, Ordering::SeqCst);
    }

    pub fn port(&self) -> u16 {
        self.listener.port
    }

    /// Every command received, in order, across sessions.
    pub fn commands(&self) -> Vec<String> {
        self.state.commands.lock().map(|c| c.to_vec()).unwrap_or_default()
    }

    /// Connections that received the banner.
    pub fn sessions(&self) -> u32 {
        self.state.sessions.load(Ordering::SeqCst)
    }
}

fn serve_console(stream: TcpStream, state: &ConsoleState) {
    let Ok(mut writer) = stream.try_clone() else { return };
    if writer.write_all(BANNER.as_bytes()).is_err() {
        return;
    }
    state.sessions.fetch_add(1, Ordering::SeqCst);
    let failing = state
        .failing_sessions
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    let mut refuse_next = state
        .partial_sessions
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();

    for line in BufReader::new(stream).lines() {
        let Ok(line) = line else { break };
        let cmd = line.trim().to_string();
        if cmd.is_empty() {
            continue;
        }
        if let Ok(mut commands) = state.commands.lock() {
            commands.push(cmd.clone());
        }
        let refuse = cmd.starts_with("redir add") && (failing || std::mem::take(&mut refuse_next));
        let reply = match cmd.as_str() {
            "quit" => break,
            _ if refuse => "KO: host port already in use\r\n".to_string(),
            c if c.starts_with("redir add") => "OK\r\n".to_string(),
            "avd status" => "virtual device is running\r\nOK\r\n".to_string(),
            "redir list" => "tcp:20701  => 20701\r\ntcp:20700  => 20700\r\nOK\r\n".to_string(),
            "network status" => "Current network status:\r\n  download speed: 0 bits/s\r\nOK\r\n".to_string(),
            other => format!("KO: unknown command '{}'\r\n", other),
        };
        if writer.write_all(reply.as_bytes()).is_err() {
            break;
        }
    }
}

/// Device test agent that shows `$>` (or refuses to).
pub struct MockAgent {
    connections: Arc<AtomicU32>,
    listener: Listener,
}

impl MockAgent {
    pub fn start() -> io::Result<Self> {
        Self::start_with(0, emu_console::agent::PROMPT)
    }

    /// An agent that accepts connections but never prompts.
    pub fn silent() -> io::Result<Self> {
        Self::start_with(0, "agent starting\r\n")
    }

    fn start_with(port: u16, greeting: &'static str) -> io::Result<Self> {
        let connections = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&connections);
        let listener = Listener::spawn(port, move |mut stream| {
            counter.fetch_add(1, Ordering::SeqCst);
            if stream.write_all(greeting.as_bytes()).is_err() {
                return;
            }
            // Hold the connection until the client leaves.
            let mut line = String::new();
            let _ = BufReader::new(stream).read_line(&mut line);
        })?;
        Ok(Self { connections, listener })
    }

    pub fn port(&self) -> u16 {
        self.listener.port
    }

    pub fn connections(&self) -> u32 {
        self.connections.load(Ordering::SeqCst)
    }
}
