// Retry with pluggable backoff
//
// Wraps fallible async operations in a bounded retry loop. Delay between
// attempts comes from one of five strategies; optional jitter spreads
// retries from many callers apart. The random source is seedable so tests
// can pin the schedule.

use crate::error::{GatewayError, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStrategy {
    /// Constant delay
    Fixed,
    /// initial * attempt_number
    Linear,
    /// initial * base^attempt
    Exponential,
    /// initial * fib(attempt)
    Fibonacci,
    /// next in uniform(initial, prev * 3)
    Decorrelated,
}

/// Predicate deciding whether an error is worth retrying
pub type RetryPredicate = Arc<dyn Fn(&GatewayError) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub exponential_base: f64,
    /// Apply +/-25% jitter (ignored for Decorrelated, which jitters itself)
    pub jitter: bool,
    pub strategy: BackoffStrategy,
    pub retry_if: Option<RetryPredicate>,
    /// Seed for the jitter source; None draws from entropy
    pub seed: Option<u64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            exponential_base: 2.0,
            jitter: true,
            strategy: BackoffStrategy::Exponential,
            retry_if: None,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RetryStats {
    pub total_attempts: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub total_retries: u64,
    pub delay_history: Vec<Duration>,
}

pub struct RetryPolicy {
    config: RetryConfig,
    stats: Mutex<RetryStats>,
    fibonacci: Mutex<Vec<u64>>,
    rng: Mutex<StdRng>,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            config,
            stats: Mutex::new(RetryStats::default()),
            fibonacci: Mutex::new(vec![0, 1]),
            rng: Mutex::new(rng),
        }
    }

    pub fn stats(&self) -> RetryStats {
        self.stats.lock().clone()
    }

    fn fib(&self, n: usize) -> u64 {
        let mut cache = self.fibonacci.lock();
        while cache.len() <= n {
            let next = cache[cache.len() - 1] + cache[cache.len() - 2];
            cache.push(next);
        }
        cache[n]
    }

    /// Delay before retrying after the given 0-based attempt
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let initial = self.config.initial_delay.as_secs_f64();
        let raw = match self.config.strategy {
            BackoffStrategy::Fixed => initial,
            BackoffStrategy::Linear => initial * (attempt + 1) as f64,
            BackoffStrategy::Exponential => {
                initial * self.config.exponential_base.powi(attempt as i32)
            }
            BackoffStrategy::Fibonacci => initial * self.fib(attempt as usize) as f64,
            BackoffStrategy::Decorrelated => {
                if attempt == 0 {
                    initial
                } else {
                    let prev = self
                        .stats
                        .lock()
                        .delay_history
                        .last()
                        .map(|d| d.as_secs_f64())
                        .unwrap_or(initial);
                    let upper = (prev * 3.0).max(initial);
                    self.rng.lock().random_range(initial..=upper)
                }
            }
        };

        let capped = raw.min(self.config.max_delay.as_secs_f64());
        let jittered =
            if self.config.jitter && self.config.strategy != BackoffStrategy::Decorrelated {
                let spread = capped * 0.25;
                capped + self.rng.lock().random_range(-spread..=spread)
            } else {
                capped
            };

        Duration::from_secs_f64(jittered.max(0.0))
    }

    /// Run the operation until it succeeds, the predicate rejects the
    /// error, or attempts run out (the last error is returned).
    pub async fn execute<F, Fut, T>(&self, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut last_error = None;

        for attempt in 0..self.config.max_attempts {
            self.stats.lock().total_attempts += 1;
            match f().await {
                Ok(value) => {
                    self.stats.lock().successful_calls += 1;
                    return Ok(value);
                }
                Err(e) => {
                    let retryable = self
                        .config
                        .retry_if
                        .as_ref()
                        .map(|pred| pred(&e))
                        .unwrap_or(true);
                    if !retryable || attempt + 1 >= self.config.max_attempts {
                        self.stats.lock().failed_calls += 1;
                        return Err(e);
                    }

                    let delay = self.delay_for_attempt(attempt);
                    warn!(
                        attempt = attempt + 1,
                        max = self.config.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying after failure"
                    );
                    {
                        let mut stats = self.stats.lock();
                        stats.total_retries += 1;
                        stats.delay_history.push(delay);
                    }
                    last_error = Some(e);
                    tokio::time::sleep(delay).await;
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            GatewayError::RetryExhausted {
                attempts: self.config.max_attempts,
                last_error: "no attempts made".to_string(),
            }
        }))
    }
}

/// Process-wide registry of named retry policies
#[derive(Default)]
pub struct RetryManager {
    policies: DashMap<String, Arc<RetryPolicy>>,
}

impl RetryManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create a policy; config applies only on creation
    pub fn policy(&self, name: &str, config: RetryConfig) -> Arc<RetryPolicy> {
        self.policies
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(RetryPolicy::new(config)))
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<RetryPolicy>> {
        self.policies.get(name).map(|p| Arc::clone(&p))
    }
}
