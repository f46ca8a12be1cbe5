// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Retry Policy
//!
//! Fixed-delay retry used for control-API calls and the initial broker
//! connect. The policy is a value so callers (and tests) choose the attempt
//! budget and delay instead of relying on a hard-coded loop.

use std::{fmt::Display, future::Future, time::Duration};
use tracing::warn;

/// How many times an operation is attempted and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// `None` retries until the operation succeeds.
    pub max_attempts: Option<u32>,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn unbounded(delay: Duration) -> RetryPolicy {
        RetryPolicy {
            max_attempts: None,
            delay,
        }
    }

    pub fn bounded(max_attempts: u32, delay: Duration) -> RetryPolicy {
        RetryPolicy {
            max_attempts: Some(max_attempts.max(1)),
            delay,
        }
    }

    /// Runs `operation` until it succeeds or the attempt budget is spent.
    ///
    /// Returns the last error when every attempt failed.
    pub async fn run<T, E, F, Fut>(&self, name: &str, mut operation: F) -> Result<T, E>
    where
        E: Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if self.max_attempts.is_some_and(|max| attempt >= max) {
                        warn!(
                            error = err.to_string(),
                            attempt, "{} failed, giving up", name
                        );
                        return Err(err);
                    }

                    warn!(
                        error = err.to_string(),
                        attempt,
                        delay_ms = self.delay.as_millis() as u64,
                        "{} failed, retrying",
                        name
                    );
                    tokio::time::sleep(self.delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn unbounded_policy_retries_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let started = Instant::now();

        let result: Result<u32, String> = RetryPolicy::unbounded(Duration::from_secs(5))
            .run("flaky call", || {
                let calls = calls.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 4 {
                        Err(format!("attempt {n} failed"))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(4));
        assert!(started.elapsed() >= Duration::from_secs(15));
        assert!(started.elapsed() < Duration::from_secs(16));
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_policy_returns_last_error() {
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<(), String> = RetryPolicy::bounded(3, Duration::from_millis(100))
            .run("always failing", || {
                let calls = calls.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    Err(format!("attempt {n}"))
                }
            })
            .await;

        assert_eq!(result, Err("attempt 3".to_owned()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
