use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::CircuitBreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,   // serving
    Open,     // rejecting until the open timeout elapses
    HalfOpen, // trial requests
}

impl CircuitState {
    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub successes: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failures: u32,
    successes: u32,
    last_failure: Option<DateTime<Utc>>,
    last_state_change: Instant,
}

impl BreakerInner {
    fn enter(&mut self, state: CircuitState) {
        self.state = state;
        self.last_state_change = Instant::now();
    }

    /// Lazy open to half-open transition once the timeout has elapsed.
    fn refresh(&mut self, open_timeout: Duration) {
        if self.state == CircuitState::Open && self.last_state_change.elapsed() >= open_timeout {
            self.enter(CircuitState::HalfOpen);
            self.successes = 0;
        }
    }
}

/// Per-provider health state machine.
#[derive(Debug)]
pub struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
    fail_threshold: u32,
    success_threshold: u32,
    open_timeout: Duration,
}

impl CircuitBreaker {
    pub fn new(cfg: &CircuitBreakerConfig) -> Self {
        Self::with_limits(
            cfg.fail_threshold,
            cfg.success_threshold,
            cfg.open_timeout(),
        )
    }

    /// Zero thresholds or timeout fall back to 5 failures, 2 successes, 30s.
    pub fn with_limits(fail_threshold: u32, success_threshold: u32, open_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: 0,
                successes: 0,
                last_failure: None,
                last_state_change: Instant::now(),
            }),
            fail_threshold: if fail_threshold == 0 { 5 } else { fail_threshold },
            success_threshold: if success_threshold == 0 { 2 } else { success_threshold },
            open_timeout: if open_timeout.is_zero() {
                Duration::from_secs(30)
            } else {
                open_timeout
            },
        }
    }

    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.refresh(self.open_timeout);
        inner.state != CircuitState::Open
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.state {
            CircuitState::HalfOpen => {
                inner.successes += 1;
                if inner.successes >= self.success_threshold {
                    inner.enter(CircuitState::Closed);
                    inner.failures = 0;
                    inner.successes = 0;
                    tracing::info!("circuit closed after successful trial requests");
                }
            }
            CircuitState::Closed => inner.failures = 0,
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.last_failure = Some(Utc::now());
        match inner.state {
            CircuitState::Closed => {
                inner.failures += 1;
                if inner.failures >= self.fail_threshold {
                    tracing::warn!(failures = inner.failures, "circuit opened");
                    inner.enter(CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                tracing::warn!("trial request failed, circuit reopened");
                inner.enter(CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.refresh(self.open_timeout);
        inner.state
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.enter(CircuitState::Closed);
        inner.failures = 0;
        inner.successes = 0;
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        CircuitSnapshot {
            state: inner.state,
            failures: inner.failures,
            successes: (inner.state == CircuitState::HalfOpen).then_some(inner.successes),
            last_failure: inner.last_failure,
        }
    }
}

/// Lazily created breakers keyed by provider name.
#[derive(Clone)]
pub struct CircuitRegistry {
    breakers: Arc<RwLock<HashMap<String, Arc<CircuitBreaker>>>>,
    cfg: CircuitBreakerConfig,
}

impl CircuitRegistry {
    pub fn new(cfg: CircuitBreakerConfig) -> Self {
        Self {
            breakers: Arc::new(RwLock::new(HashMap::new())),
            cfg,
        }
    }

    pub fn enabled(&self) -> bool {
        self.cfg.enabled
    }

    pub fn get(&self, provider: &str) -> Arc<CircuitBreaker> {
        {
            let breakers = self.breakers.read().unwrap_or_else(|e| e.into_inner());
            if let Some(cb) = breakers.get(provider) {
                return cb.clone();
            }
        }
        let mut breakers = self.breakers.write().unwrap_or_else(|e| e.into_inner());
        breakers
            .entry(provider.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(&self.cfg)))
            .clone()
    }

    pub fn status(&self) -> BTreeMap<String, CircuitSnapshot> {
        let breakers = self.breakers.read().unwrap_or_else(|e| e.into_inner());
        breakers
            .iter()
            .map(|(name, cb)| (name.clone(), cb.snapshot()))
            .collect()
    }

    /// Returns false when no breaker exists for the provider yet.
    pub fn reset(&self, provider: &str) -> bool {
        let breakers = self.breakers.read().unwrap_or_else(|e| e.into_inner());
        match breakers.get(provider) {
            Some(cb) => {
                cb.reset();
                true
            }
            None => false,
        }
    }
}

impl Default for CircuitRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
