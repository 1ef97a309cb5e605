//! Device channel for emulated devices.
//!
//! A [`Channel`] is a line-oriented TCP connection with telnet-style
//! "read until marker" semantics. On top of it sit the two protocols the
//! harness speaks: the emulator [`console`] (port redirection, status
//! report) and the on-device test [`agent`] (prompt probe). Connection
//! attempts are bounded by a [`RetryPolicy`].

pub mod agent;
pub mod channel;
pub mod console;
pub mod retry;

pub use agent::AgentError;
pub use channel::{Channel, ChannelError, ConnectError};
pub use console::{ConsoleError, ConsoleTimeouts, Redirect};
pub use retry::{Backoff, RetryExhausted, RetryPolicy};
