//! Background task runner and retry helpers
//!
//! Periodic tasks back off exponentially on consecutive failures and keep running in a
//! degraded state instead of taking the process down. Single operations get bounded
//! retries with jittered exponential backoff.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{error, info, warn};

/// Schedule and failure handling for a periodic background task
#[derive(Debug, Clone)]
pub struct PeriodicConfig {
    /// Delay between successful runs
    pub interval: Duration,
    /// First delay after a failure
    pub initial_retry_delay: Duration,
    /// Cap on the failure backoff
    pub max_retry_delay: Duration,
    /// Consecutive failures after which the task is reported as degraded
    pub degraded_after: u32,
}

impl PeriodicConfig {
    pub fn every(interval: Duration) -> Self {
        Self {
            interval,
            initial_retry_delay: Duration::from_secs(1),
            max_retry_delay: interval.max(Duration::from_secs(1)),
            degraded_after: 3,
        }
    }
}

#[derive(Debug)]
struct BackoffState {
    consecutive_failures: u32,
    current_retry_delay: Duration,
}

impl BackoffState {
    fn new(initial_delay: Duration) -> Self {
        Self {
            consecutive_failures: 0,
            current_retry_delay: initial_delay,
        }
    }

    /// Returns the delay to wait now and doubles the next one, up to `max_delay`
    fn record_failure(&mut self, max_delay: Duration) -> Duration {
        self.consecutive_failures += 1;
        let delay = self.current_retry_delay.min(max_delay);
        self.current_retry_delay = std::cmp::min(self.current_retry_delay * 2, max_delay);
        delay
    }

    fn reset(&mut self, initial_delay: Duration) {
        self.consecutive_failures = 0;
        self.current_retry_delay = initial_delay;
    }
}

/// Run `task_fn` every `config.interval` until `shutdown` flips to true or its sender drops.
///
/// Never panics: failures are logged, backed off and retried indefinitely.
pub async fn run_periodic<F, Fut>(
    task_name: &str,
    config: PeriodicConfig,
    mut shutdown: watch::Receiver<bool>,
    mut task_fn: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), String>>,
{
    let mut state = BackoffState::new(config.initial_retry_delay);

    loop {
        if *shutdown.borrow() {
            info!("Task '{}' stopping", task_name);
            return;
        }

        let delay = match task_fn().await {
            Ok(()) => {
                if state.consecutive_failures > 0 {
                    warn!(
                        "Task '{}' recovered after {} failures",
                        task_name, state.consecutive_failures
                    );
                }
                state.reset(config.initial_retry_delay);
                config.interval
            }
            Err(e) => {
                let delay = state.record_failure(config.max_retry_delay);
                error!(
                    "Task '{}' failed ({} consecutive): {}",
                    task_name, state.consecutive_failures, e
                );
                if state.consecutive_failures == config.degraded_after {
                    warn!(
                        "Task '{}' is degraded after {} consecutive failures; continuing with backoff",
                        task_name, state.consecutive_failures
                    );
                }
                delay
            }
        };

        tokio::select! {
            _ = sleep(delay) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("Task '{}' stopping", task_name);
                    return;
                }
            }
        }
    }
}

/// Bounded retry schedule for a single operation
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Add up to 20% random delay to each backoff
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            max_delay: initial_delay.saturating_mul(16),
            jitter: true,
        }
    }

    /// Delay before attempt `attempt + 1`, where `attempt` starts at 1
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let base = self
            .initial_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_delay);
        if self.jitter {
            let factor = rand::thread_rng().gen_range(0.0..0.2);
            base + base.mul_f64(factor)
        } else {
            base
        }
    }
}

/// The last error once every attempt has failed
#[derive(Debug, Clone, PartialEq)]
pub struct RetryExhausted<E> {
    pub attempts: u32,
    pub last_error: E,
}

/// Call `operation` until it succeeds, `is_retryable` rejects an error, or attempts run out
pub async fn retry_with_backoff<T, E, F, Fut>(
    operation: &str,
    policy: &RetryPolicy,
    is_retryable: impl Fn(&E) -> bool,
    mut f: F,
) -> Result<T, RetryExhausted<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 1;
    loop {
        match f(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if attempt >= policy.max_attempts || !is_retryable(&e) {
                    error!(
                        "{} failed after {} attempt(s): {}",
                        operation, attempt, e
                    );
                    return Err(RetryExhausted {
                        attempts: attempt,
                        last_error: e,
                    });
                }
                let delay = policy.delay_after(attempt);
                warn!(
                    "{} failed (attempt {}/{}): {}; retrying in {:?}",
                    operation, attempt, policy.max_attempts, e, delay
                );
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
