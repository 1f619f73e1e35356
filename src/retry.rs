// Shared retry policy for the accept loop, the hub redial loop and the raw senders

use log::debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

/// How often and how long to retry an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt, `None` retries forever
    pub max_retries: Option<u32>,
    /// Pause between attempts
    pub interval: Duration,
}

/// Raw socket writes: give up after 100 failed writes, yielding one tick between them
pub const RAW_SEND: RetryPolicy = RetryPolicy::bounded(100, Duration::from_millis(1));

/// Hub host resolution and connection attempts
pub const HUB_REDIAL: RetryPolicy = RetryPolicy::unbounded(Duration::from_secs(1));

/// Pause before the local server listens again after a client left
pub const RELISTEN: RetryPolicy = RetryPolicy::unbounded(Duration::from_millis(10));

/// Period between discovery announcements
pub const DISCOVERY_PERIOD: Duration = Duration::from_secs(1);

impl RetryPolicy {
    pub const fn bounded(max_retries: u32, interval: Duration) -> Self {
        Self {
            max_retries: Some(max_retries),
            interval,
        }
    }

    pub const fn unbounded(interval: Duration) -> Self {
        Self {
            max_retries: None,
            interval,
        }
    }

    /// True once `failures` exceeds the retry ceiling
    pub fn exhausted(&self, failures: u32) -> bool {
        match self.max_retries {
            Some(max) => failures > max,
            None => false,
        }
    }

    /// Sleep for the configured interval
    pub fn pause(&self) {
        if self.interval.is_zero() {
            thread::yield_now();
        } else {
            thread::sleep(self.interval);
        }
    }

    /// Run `op` until it succeeds or the ceiling is exceeded
    ///
    /// Returns the last error when the policy gives up. Unbounded policies only
    /// return on success.
    pub fn retry<T, E, F>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Result<T, E>,
    {
        let mut failures = 0;
        loop {
            match op(failures) {
                Ok(value) => return Ok(value),
                Err(e) => {
                    failures += 1;
                    if self.exhausted(failures) {
                        debug!("retry ceiling reached after {} failures", failures);
                        return Err(e);
                    }
                    self.pause();
                }
            }
        }
    }

    /// Like `retry` but also gives up as soon as `stop` is raised
    ///
    /// Returns `None` when stopped before a success.
    pub fn retry_until_stopped<T, E, F>(&self, stop: &AtomicBool, mut op: F) -> Option<Result<T, E>>
    where
        F: FnMut(u32) -> Result<T, E>,
    {
        let mut failures = 0;
        loop {
            if stop.load(Ordering::Acquire) {
                return None;
            }
            match op(failures) {
                Ok(value) => return Some(Ok(value)),
                Err(e) => {
                    failures += 1;
                    if self.exhausted(failures) {
                        return Some(Err(e));
                    }
                    self.pause();
                }
            }
        }
    }
}
