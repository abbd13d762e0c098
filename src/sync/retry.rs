//! One retry loop for handshake polling, start retries and the ping burst.

use std::future::Future;
use std::time::{Duration, Instant};

/// Attempt limits and pacing for a repeated peer exchange.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Maximum attempts; `None` means bounded only by `budget`.
    pub max_attempts: Option<u32>,
    /// Total wall time after which no new attempt starts.
    pub budget: Option<Duration>,
    /// Pause between attempts.
    pub delay: Duration,
    /// Transport timeout handed to each attempt.
    pub attempt_timeout: Duration,
}

impl RetryPolicy {
    pub fn attempts(max_attempts: u32, delay: Duration, attempt_timeout: Duration) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            budget: None,
            delay,
            attempt_timeout,
        }
    }

    pub fn within(budget: Duration, delay: Duration, attempt_timeout: Duration) -> Self {
        Self {
            max_attempts: None,
            budget: Some(budget),
            delay,
            attempt_timeout,
        }
    }

    fn exhausted(&self, attempt: u32, started: Instant) -> bool {
        if self.max_attempts.is_some_and(|max| attempt >= max) {
            return true;
        }
        self.budget.is_some_and(|budget| started.elapsed() > budget)
    }

    /// Run `op` until it succeeds or the policy is exhausted; returns the last
    /// error on exhaustion. `op` receives the 0-based attempt index and the
    /// per-attempt timeout.
    pub async fn run<T, E, F, Fut>(&self, op: F) -> Result<T, E>
    where
        F: FnMut(u32, Duration) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run_while(|_| true, op).await
    }

    /// Like [`run`](Self::run), but an error for which `retryable` is false
    /// is returned at once.
    pub async fn run_while<T, E, R, F, Fut>(&self, retryable: R, mut op: F) -> Result<T, E>
    where
        R: Fn(&E) -> bool,
        F: FnMut(u32, Duration) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let started = Instant::now();
        let mut attempt = 0;
        loop {
            let err = match op(attempt, self.attempt_timeout).await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            attempt += 1;
            if !retryable(&err) || self.exhausted(attempt, started) {
                return Err(err);
            }
            tokio::time::sleep(self.delay).await;
            if self.exhausted(attempt, started) {
                return Err(err);
            }
        }
    }

    /// Run `op` for every attempt the policy allows and keep the successes.
    /// Failed attempts are dropped, not counted.
    pub async fn collect<T, E, F, Fut>(&self, mut op: F) -> Vec<T>
    where
        F: FnMut(u32, Duration) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let started = Instant::now();
        let mut successes = Vec::new();
        let mut attempt = 0;
        while !self.exhausted(attempt, started) {
            if let Ok(value) = op(attempt, self.attempt_timeout).await {
                successes.push(value);
            }
            attempt += 1;
            if !self.delay.is_zero() && !self.exhausted(attempt, started) {
                tokio::time::sleep(self.delay).await;
            }
        }
        successes
    }
}
