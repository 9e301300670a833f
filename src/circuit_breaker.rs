//! `CircuitBreaker`: CLOSED/OPEN/HALF_OPEN state machine guarding a single
//! server (spec §4.4).
//!
//! Adapted from the recovery-module circuit breaker pattern, but
//! consolidated into one `Mutex`-guarded critical section per spec §5's
//! "single exclusive critical section per breaker" invariant, and with a
//! single success in HALF_OPEN closing the circuit rather than requiring a
//! success threshold.

use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::error::GatewayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        CircuitBreakerConfig {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            half_open_max_calls: 3,
        }
    }
}

/// Snapshot for external status reporting (`ToolManager::circuit_breaker_status`).
#[derive(Debug, Clone)]
pub struct CircuitBreakerStatus {
    pub state: BreakerState,
    pub failure_count: u32,
    pub last_failure_time: Option<Instant>,
    pub next_retry_time: Option<Instant>,
}

struct Inner {
    state: BreakerState,
    failure_count: u32,
    last_failure_time: Option<Instant>,
    next_retry_time: Option<Instant>,
    half_open_calls: u32,
}

/// Guards calls to one server. Held by a `ServerPool` and shared (via `Arc`)
/// with every `ServerClient` it hands out for that server, since a pool may
/// spawn several connections to the same server and the breaker must see
/// failures across all of them.
pub struct CircuitBreaker {
    server_id: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(server_id: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        CircuitBreaker {
            server_id: server_id.into(),
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failure_count: 0,
                last_failure_time: None,
                next_retry_time: None,
                half_open_calls: 0,
            }),
        }
    }

    /// Call before attempting an operation. `Ok(())` means proceed;
    /// `Err(CircuitOpen)` means fail fast. Transitions OPEN → HALF_OPEN when
    /// `resetTimeout` has elapsed, admitting up to `halfOpenMaxCalls` trials.
    pub async fn try_acquire(&self) -> crate::Result<()> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let now = Instant::now();
                if inner.next_retry_time.map(|t| now >= t).unwrap_or(false) {
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_calls = 1;
                    Ok(())
                } else {
                    Err(GatewayError::CircuitOpen(self.server_id.clone()))
                }
            }
            BreakerState::HalfOpen => {
                if inner.half_open_calls < self.config.half_open_max_calls {
                    inner.half_open_calls += 1;
                    Ok(())
                } else {
                    Err(GatewayError::CircuitOpen(self.server_id.clone()))
                }
            }
        }
    }

    /// A single success in HALF_OPEN closes the circuit; in CLOSED it resets
    /// the failure counter.
    pub async fn record_success(&self) {
        let mut inner = self.inner.lock().await;
        match inner.state {
            BreakerState::HalfOpen | BreakerState::Closed => {
                inner.state = BreakerState::Closed;
                inner.failure_count = 0;
                inner.half_open_calls = 0;
                inner.next_retry_time = None;
            }
            BreakerState::Open => {}
        }
    }

    /// Any failure in HALF_OPEN reopens the circuit. In CLOSED, accumulates
    /// toward `failureThreshold`.
    pub async fn record_failure(&self) {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        match inner.state {
            BreakerState::Closed => {
                inner.failure_count += 1;
                inner.last_failure_time = Some(now);
                if inner.failure_count >= self.config.failure_threshold {
                    inner.state = BreakerState::Open;
                    inner.next_retry_time = Some(now + self.config.reset_timeout);
                }
            }
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.last_failure_time = Some(now);
                inner.next_retry_time = Some(now + self.config.reset_timeout);
                inner.half_open_calls = 0;
            }
            BreakerState::Open => {
                inner.last_failure_time = Some(now);
            }
        }
    }

    pub async fn state(&self) -> BreakerState {
        self.inner.lock().await.state
    }

    pub async fn snapshot(&self) -> CircuitBreakerStatus {
        let inner = self.inner.lock().await;
        CircuitBreakerStatus {
            state: inner.state,
            failure_count: inner.failure_count,
            last_failure_time: inner.last_failure_time,
            next_retry_time: inner.next_retry_time,
        }
    }
}
