//! Health primitives: the per-URL circuit breaker and the process-wide
//! health flags surfaced by `/health`.

pub mod circuit_breaker;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerManager, CircuitState};

use std::sync::atomic::{AtomicBool, Ordering};

/// Process health, flipped by the registry-refresh and health-recovery
/// scheduler tasks.
#[derive(Debug, Default)]
pub struct SystemHealth {
    degraded: AtomicBool,
    initial_fetch_complete: AtomicBool,
}

impl SystemHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    pub fn set_degraded(&self, degraded: bool) {
        self.degraded.store(degraded, Ordering::Relaxed);
    }

    pub fn initial_fetch_complete(&self) -> bool {
        self.initial_fetch_complete.load(Ordering::Relaxed)
    }

    pub fn mark_initial_fetch_complete(&self) {
        self.initial_fetch_complete.store(true, Ordering::Relaxed);
    }
}
