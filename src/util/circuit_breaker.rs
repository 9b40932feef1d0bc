// Circuit breaker
//
// Classic three-state breaker guarding calls to an unreliable collaborator.
// Closed passes calls through, Open rejects them outright, and Half-Open
// lets a single probe through at a time to test recovery. All state
// mutations happen under one per-breaker lock.

use crate::error::{GatewayError, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,
    /// Consecutive successes in half-open before it closes
    pub success_threshold: u32,
    /// How long the circuit stays open before probing
    pub timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CircuitBreakerStats {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub rejected_calls: u64,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_failure_time: Option<Instant>,
}

struct Inner {
    state: CircuitState,
    stats: CircuitBreakerStats,
    /// Probes currently executing while half-open; at most one
    half_open_in_flight: u32,
}

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                stats: CircuitBreakerStats::default(),
                half_open_in_flight: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        self.inner.lock().stats.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == CircuitState::Closed
    }

    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    pub fn is_half_open(&self) -> bool {
        self.state() == CircuitState::HalfOpen
    }

    /// Execute a call through the breaker. While open, calls are rejected
    /// without invoking the function.
    pub async fn call<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        {
            let mut inner = self.inner.lock();
            match inner.state {
                CircuitState::Open => {
                    let elapsed_enough = inner
                        .stats
                        .last_failure_time
                        .map(|t| t.elapsed() >= self.config.timeout)
                        .unwrap_or(true);
                    if elapsed_enough {
                        info!(breaker = %self.name, "circuit transitioning to half-open");
                        inner.state = CircuitState::HalfOpen;
                        inner.stats.consecutive_failures = 0;
                        inner.stats.consecutive_successes = 0;
                        inner.half_open_in_flight = 1;
                    } else {
                        inner.stats.rejected_calls += 1;
                        return Err(GatewayError::CircuitOpen(self.name.clone()));
                    }
                }
                CircuitState::HalfOpen => {
                    if inner.half_open_in_flight > 0 {
                        inner.stats.rejected_calls += 1;
                        return Err(GatewayError::CircuitOpen(self.name.clone()));
                    }
                    inner.half_open_in_flight = 1;
                }
                CircuitState::Closed => {}
            }
        }

        match f().await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(e) => {
                self.on_failure();
                Err(e)
            }
        }
    }

    fn on_success(&self) {
        let mut inner = self.inner.lock();
        inner.stats.total_calls += 1;
        inner.stats.successful_calls += 1;
        inner.stats.consecutive_successes += 1;
        inner.stats.consecutive_failures = 0;

        if inner.state == CircuitState::HalfOpen {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
            if inner.stats.consecutive_successes >= self.config.success_threshold {
                info!(breaker = %self.name, "circuit closed");
                inner.state = CircuitState::Closed;
            }
        }
    }

    fn on_failure(&self) {
        let mut inner = self.inner.lock();
        inner.stats.total_calls += 1;
        inner.stats.failed_calls += 1;
        inner.stats.consecutive_failures += 1;
        inner.stats.consecutive_successes = 0;
        inner.stats.last_failure_time = Some(Instant::now());

        match inner.state {
            CircuitState::Closed => {
                if inner.stats.consecutive_failures >= self.config.failure_threshold {
                    warn!(breaker = %self.name, "circuit opened");
                    inner.state = CircuitState::Open;
                }
            }
            CircuitState::HalfOpen => {
                // Any failure during probing reopens immediately
                warn!(breaker = %self.name, "probe failed, circuit reopened");
                inner.state = CircuitState::Open;
                inner.half_open_in_flight = 0;
            }
            CircuitState::Open => {}
        }
    }

    /// Force the breaker closed and clear the consecutive counters
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.stats.consecutive_failures = 0;
        inner.stats.consecutive_successes = 0;
        inner.half_open_in_flight = 0;
    }

    /// Force the breaker open
    pub fn trip(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Open;
        inner.stats.last_failure_time = Some(Instant::now());
    }
}

/// Process-wide registry of named breakers, initialized once at startup
#[derive(Default)]
pub struct CircuitBreakerManager {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create a breaker; config applies only on creation
    pub fn breaker(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config)))
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|b| Arc::clone(&b))
    }

    pub fn all_closed(&self) -> bool {
        self.breakers.iter().all(|b| b.is_closed())
    }

    pub fn reset_all(&self) {
        for breaker in self.breakers.iter() {
            breaker.reset();
        }
    }

    /// (name, state, rejected) for every registered breaker
    pub fn status(&self) -> Vec<(String, CircuitState, u64)> {
        self.breakers
            .iter()
            .map(|b| (b.name().to_string(), b.state(), b.stats().rejected_calls))
            .collect()
    }
}
