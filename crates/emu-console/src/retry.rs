//! Bounded retry with fixed or escalating backoff.

use std::time::Duration;

/// Delay schedule between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same pause before every retry.
    Fixed(Duration),
    /// `first` before the first retry, `subsequent` before each later one.
    Escalating { first: Duration, subsequent: Duration },
}

impl Backoff {
    /// Pause before retry number `retry` (1-based: the pause between
    /// attempt 1 and attempt 2 is retry 1).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        match self {
            Backoff::Fixed(delay) => *delay,
            Backoff::Escalating { first, subsequent } => {
                if retry <= 1 {
                    *first
                } else {
                    *subsequent
                }
            }
        }
    }
}

/// Immutable attempt ceiling plus backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Backoff,
}

/// All attempts failed; carries the last error.
#[derive(Debug)]
pub struct RetryExhausted<E> {
    pub attempts: u32,
    pub last: E,
}

impl RetryPolicy {
    /// A ceiling of zero is treated as one attempt.
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self::new(max_attempts, Backoff::Fixed(delay))
    }

    pub fn escalating(max_attempts: u32, first: Duration, subsequent: Duration) -> Self {
        Self::new(max_attempts, Backoff::Escalating { first, subsequent })
    }

    /// Single attempt, no waiting.
    pub fn once() -> Self {
        Self::fixed(1, Duration::ZERO)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    /// Run `op` until it succeeds or the ceiling is reached, sleeping on
    /// the calling thread between attempts. `op` receives the 1-based
    /// attempt number.
    pub fn run<T, E, F>(&self, op: F) -> Result<T, RetryExhausted<E>>
    where
        F: FnMut(u32) -> Result<T, E>,
    {
        self.run_with_sleep(std::thread::sleep, op)
    }

    /// Like [`RetryPolicy::run`] with an injectable sleep.
    pub fn run_with_sleep<T, E, F, S>(&self, mut sleep: S, mut op: F) -> Result<T, RetryExhausted<E>>
    where
        F: FnMut(u32) -> Result<T, E>,
        S: FnMut(Duration),
    {
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(err) if attempt >= self.max_attempts => {
                    return Err(RetryExhausted {
                        attempts: attempt,
                        last: err,
                    });
                }
                Err(_) => {
                    let delay = self.backoff.delay_for_retry(attempt);
                    if !delay.is_zero() {
                        tracing::info!(attempt, delay_secs = delay.as_secs_f64(), "retrying after pause");
                    }
                    sleep(delay);
                    attempt += 1;
                }
            }
        }
    }
}
