//! Bounded-retry dialing for backends that are still starting up

use std::io;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Dial errors
#[derive(Debug, Error)]
pub enum DialError {
    #[error("Backend {address} not reachable after {elapsed:?} ({attempts} attempts): {last_error}")]
    Timeout {
        address: String,
        attempts: u32,
        elapsed: Duration,
        last_error: io::Error,
    },

    #[error("Dial to {address} cancelled by shutdown")]
    Cancelled { address: String },
}

/// Retry policy for backend dialing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DialPolicy {
    /// Total time allowed before giving up
    pub budget: Duration,
    /// Pause between failed attempts
    pub interval: Duration,
}

impl Default for DialPolicy {
    fn default() -> Self {
        Self {
            budget: Duration::from_secs(30),
            interval: Duration::from_millis(50),
        }
    }
}

/// Dials one fixed backend address, retrying until the budget runs out.
#[derive(Debug, Clone)]
pub struct RetryingDialer {
    address: String,
    policy: DialPolicy,
}

impl RetryingDialer {
    pub fn new(address: impl Into<String>, policy: DialPolicy) -> Self {
        Self {
            address: address.into(),
            policy,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Connect to the backend.
    ///
    /// Only connection failures are retried. The deadline is fixed when the
    /// call starts, so slow attempts do not stretch the total wait.
    pub async fn dial(&self, cancel: &CancellationToken) -> Result<TcpStream, DialError> {
        let started = Instant::now();
        let deadline = started + self.policy.budget;
        let mut attempts = 0u32;

        loop {
            attempts += 1;

            let attempt = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(self.cancelled()),
                attempt = timeout_at(deadline, TcpStream::connect(&self.address)) => attempt,
            };

            let last_error = match attempt {
                Ok(Ok(stream)) => {
                    info!(
                        "Connection established to {} after {} attempt(s)",
                        self.address, attempts
                    );
                    return Ok(stream);
                }
                Ok(Err(e)) => e,
                Err(_) => io::Error::new(io::ErrorKind::TimedOut, "connect attempt timed out"),
            };

            let now = Instant::now();
            if now >= deadline {
                let elapsed = now - started;
                warn!(
                    "Giving up on {} after {:?} ({} attempts): {}",
                    self.address, elapsed, attempts, last_error
                );
                return Err(DialError::Timeout {
                    address: self.address.clone(),
                    attempts,
                    elapsed,
                    last_error,
                });
            }

            debug!(
                "Dial attempt {} to {} failed: {}",
                attempts, self.address, last_error
            );

            let pause = self.policy.interval.min(deadline - now);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(self.cancelled()),
                _ = sleep(pause) => {}
            }
        }
    }

    fn cancelled(&self) -> DialError {
        debug!("Dial to {} cancelled", self.address);
        DialError::Cancelled {
            address: self.address.clone(),
        }
    }
}
