//! Circuit breakers prevent cascading failures by fast-failing requests
//! to endpoints that keep erroring.
//!
//! One breaker per endpoint URL. CLOSED counts consecutive failures and
//! trips OPEN at the threshold; OPEN fast-fails until the reset interval
//! elapses, then HALF_OPEN admits exactly one probe; the probe's outcome
//! decides CLOSED or back to OPEN.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation, requests allowed.
    Closed,
    /// Failing, requests blocked.
    Open,
    /// Testing recovery, one probe allowed.
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures needed to open the circuit.
    pub failure_threshold: u32,
    /// Time before an open circuit admits a probe.
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    probe_in_flight: bool,
}

/// Per-URL breaker. All state sits behind one short mutex so the
/// single-probe rule and the state transition move together.
pub struct CircuitBreaker {
    url: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(url: String, config: CircuitBreakerConfig) -> Self {
        Self {
            url,
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure: None,
                probe_in_flight: false,
            }),
        }
    }

    /// Claim permission to send a request. In OPEN past the reset
    /// interval this transitions to HALF_OPEN and claims the probe slot.
    pub fn should_allow(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure
                    .map(|at| at.elapsed() > self.config.reset_timeout)
                    .unwrap_or(true);
                if elapsed {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    info!(url = %self.url, "Circuit breaker HALF-OPEN, probing");
                    true
                } else {
                    false
                }
            },
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    false
                } else {
                    inner.probe_in_flight = true;
                    true
                }
            },
        }
    }

    /// Non-claiming availability check used by the balancer filter.
    pub fn available(&self) -> bool {
        let inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => inner
                .last_failure
                .map(|at| at.elapsed() > self.config.reset_timeout)
                .unwrap_or(true),
            CircuitState::HalfOpen => !inner.probe_in_flight,
        }
    }

    /// Record a request outcome.
    pub fn record(&self, ok: bool) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                if ok {
                    inner.consecutive_failures = 0;
                } else {
                    inner.consecutive_failures += 1;
                    inner.last_failure = Some(Instant::now());
                    if inner.consecutive_failures >= self.config.failure_threshold {
                        inner.state = CircuitState::Open;
                        warn!(url = %self.url, "Circuit breaker OPEN");
                    }
                }
            },
            CircuitState::HalfOpen => {
                inner.probe_in_flight = false;
                if ok {
                    inner.state = CircuitState::Closed;
                    inner.consecutive_failures = 0;
                    inner.last_failure = None;
                    info!(url = %self.url, "Circuit breaker CLOSED, recovered");
                } else {
                    inner.state = CircuitState::Open;
                    inner.last_failure = Some(Instant::now());
                    warn!(url = %self.url, "Circuit breaker re-OPEN, probe failed");
                }
            },
            CircuitState::Open => {
                if !ok {
                    inner.consecutive_failures += 1;
                    inner.last_failure = Some(Instant::now());
                }
            },
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }
}

/// Breakers for the whole fleet, keyed by endpoint URL.
pub struct CircuitBreakerManager {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreakerManager {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
        }
    }

    pub fn get_or_create(&self, url: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(url.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(url.to_string(), self.config.clone()))
            })
            .clone()
    }

    /// True when no breaker exists yet (no failures recorded) or the
    /// breaker would admit a request.
    pub fn available(&self, url: &str) -> bool {
        self.breakers.get(url).map(|b| b.available()).unwrap_or(true)
    }

    pub fn record(&self, url: &str, ok: bool) {
        self.get_or_create(url).record(ok);
    }

    pub fn state(&self, url: &str) -> Option<CircuitState> {
        self.breakers.get(url).map(|b| b.state())
    }
}

impl Default for CircuitBreakerManager {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
