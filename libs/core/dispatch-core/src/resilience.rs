//! C3: per-datafeed circuit breaking.
//!
//! ```text
//! ┌─────────┐  failures >= threshold   ┌────────┐
//! │ CLOSED  │ ───────────────────────> │  OPEN  │
//! └─────────┘                          └────────┘
//!      ^                                   │
//!      │                                   │ now - last_fail_at > cooldown
//!      │                                   v
//!      │      success             ┌─────────────┐
//!      └───────────────────────── │  HALF-OPEN  │
//!                     failure     └─────────────┘
//!                     ───────────────────┘
//! ```
//!
//! One breaker per `datafeed_id`, created lazily on first admission check.
//! The registry itself uses a reader-writer lock for lookup; each
//! individual breaker's counters are independent so two datafeeds never
//! contend on each other's state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

/// Per-datafeed breaker. `admit` is stateful: calling it while Open and
/// past cooldown flips the breaker to HalfOpen as a side effect.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: RwLock<CircuitState>,
    failures: AtomicU32,
    last_fail_at: RwLock<Option<Instant>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: RwLock::new(CircuitState::Closed),
            failures: AtomicU32::new(0),
            last_fail_at: RwLock::new(None),
        }
    }

    pub fn state(&self) -> CircuitState {
        *self.state.read().expect("circuit breaker lock poisoned")
    }

    pub fn admit(&self) -> bool {
        let current = self.state();
        match current {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let past_cooldown = {
                    let last = self.last_fail_at.read().expect("circuit breaker lock poisoned");
                    match *last {
                        Some(t) => t.elapsed() > self.config.cooldown,
                        None => true,
                    }
                };
                if past_cooldown {
                    self.transition_to_half_open();
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn report_success(&self) {
        match self.state() {
            CircuitState::Closed => {
                self.failures.store(0, Ordering::SeqCst);
            }
            CircuitState::HalfOpen => {
                self.transition_to_closed();
            }
            CircuitState::Open => {}
        }
    }

    pub fn report_failure(&self) {
        *self.last_fail_at.write().expect("circuit breaker lock poisoned") = Some(Instant::now());

        match self.state() {
            CircuitState::Closed => {
                let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
                if failures >= self.config.failure_threshold {
                    self.transition_to_open();
                }
            }
            CircuitState::HalfOpen => {
                self.transition_to_open();
            }
            CircuitState::Open => {}
        }
    }

    fn transition_to_open(&self) {
        *self.state.write().expect("circuit breaker lock poisoned") = CircuitState::Open;
        tracing::warn!("circuit breaker opened");
    }

    fn transition_to_half_open(&self) {
        *self.state.write().expect("circuit breaker lock poisoned") = CircuitState::HalfOpen;
        self.failures.store(0, Ordering::SeqCst);
        tracing::info!("circuit breaker half-open, testing recovery");
    }

    fn transition_to_closed(&self) {
        *self.state.write().expect("circuit breaker lock poisoned") = CircuitState::Closed;
        self.failures.store(0, Ordering::SeqCst);
        tracing::info!("circuit breaker closed, recovered");
    }

    pub fn failure_count(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }
}

/// Lazily-populated per-datafeed breaker registry.
#[derive(Default)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: RwLock<HashMap<String, CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    fn get_or_create(&self, datafeed_id: &str) -> std::sync::RwLockReadGuard<'_, HashMap<String, CircuitBreaker>> {
        {
            let guard = self.breakers.read().expect("breaker registry lock poisoned");
            if guard.contains_key(datafeed_id) {
                drop(guard);
                return self.breakers.read().expect("breaker registry lock poisoned");
            }
        }
        {
            let mut guard = self.breakers.write().expect("breaker registry lock poisoned");
            guard
                .entry(datafeed_id.to_string())
                .or_insert_with(|| CircuitBreaker::new(self.config.clone()));
        }
        self.breakers.read().expect("breaker registry lock poisoned")
    }

    pub fn admit(&self, datafeed_id: &str) -> bool {
        let guard = self.get_or_create(datafeed_id);
        guard.get(datafeed_id).expect("just inserted").admit()
    }

    pub fn report_success(&self, datafeed_id: &str) {
        let guard = self.get_or_create(datafeed_id);
        guard.get(datafeed_id).expect("just inserted").report_success();
    }

    pub fn report_failure(&self, datafeed_id: &str) {
        let guard = self.get_or_create(datafeed_id);
        guard.get(datafeed_id).expect("just inserted").report_failure();
    }

    pub fn state_of(&self, datafeed_id: &str) -> CircuitState {
        let guard = self.get_or_create(datafeed_id);
        guard.get(datafeed_id).expect("just inserted").state()
    }
}

/// Token bucket rate limiter, used by the uploader (C8) to stay under the
/// downstream ingestion API's request budget.
pub struct RateLimiter {
    max_tokens: u32,
    tokens: AtomicU32,
    window_ms: u64,
    last_refill: RwLock<Instant>,
}

impl RateLimiter {
    pub fn new(max_per_second: u32) -> Self {
        Self::with_window(max_per_second, 1000)
    }

    pub fn with_window(max_tokens: u32, window_ms: u64) -> Self {
        Self {
            max_tokens,
            tokens: AtomicU32::new(max_tokens),
            window_ms,
            last_refill: RwLock::new(Instant::now()),
        }
    }

    pub fn try_acquire(&self) -> bool {
        self.refill_if_needed();
        loop {
            let current = self.tokens.load(Ordering::SeqCst);
            if current == 0 {
                return false;
            }
            if self
                .tokens
                .compare_exchange(current, current - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Wait until a token is available, polling at a fraction of the
    /// window. Used by callers that would rather block briefly than fail
    /// the whole batch outright.
    pub async fn acquire(&self) {
        while !self.try_acquire() {
            tokio::time::sleep(Duration::from_millis((self.window_ms / 10).max(5))).await;
        }
    }

    pub fn available_tokens(&self) -> u32 {
        self.refill_if_needed();
        self.tokens.load(Ordering::SeqCst)
    }

    fn refill_if_needed(&self) {
        let mut last_refill = self.last_refill.write().expect("rate limiter lock poisoned");
        if last_refill.elapsed().as_millis() as u64 >= self.window_ms {
            self.tokens.store(self.max_tokens, Ordering::SeqCst);
            *last_refill = Instant::now();
        }
    }
}
