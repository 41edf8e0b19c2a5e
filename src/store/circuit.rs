//! Database circuit breaker
//!
//! Converts a stream of slow database failures into a fast fail so the
//! ingest path can back the receiver off instead of queueing doomed
//! transactions. Rate-based: trips when the failure rate over a rolling
//! window of recent calls crosses the threshold, once a minimum volume has
//! been observed.

use std::collections::VecDeque;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::config::CircuitBreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
enum State {
    Closed,
    Open { since: Instant },
    HalfOpen { trials_issued: u32, successes: u32 },
}

struct BreakerInner {
    state: State,
    /// Outcomes of the most recent calls while closed; true = failure
    window: VecDeque<bool>,
}

pub struct CircuitBreaker {
    cfg: CircuitBreakerConfig,
    window_size: usize,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(cfg: CircuitBreakerConfig) -> Self {
        let window_size = (cfg.min_request_volume as usize).max(1) * 4;
        Self {
            cfg,
            window_size,
            inner: Mutex::new(BreakerInner {
                state: State::Closed,
                window: VecDeque::with_capacity(window_size),
            }),
        }
    }

    /// Ask permission for one database call. `false` means open: fail fast
    /// without touching the database.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            State::Closed => true,
            State::Open { since } => {
                if since.elapsed() >= self.cfg.open_duration {
                    info!("database circuit half-open, allowing trial calls");
                    inner.state = State::HalfOpen {
                        trials_issued: 1,
                        successes: 0,
                    };
                    true
                } else {
                    false
                }
            }
            State::HalfOpen {
                ref mut trials_issued,
                ..
            } => {
                if *trials_issued < self.cfg.half_open_trials {
                    *trials_issued += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            State::Closed => {
                self.push_outcome(&mut inner, false);
            }
            State::HalfOpen {
                trials_issued,
                successes,
            } => {
                let successes = successes + 1;
                if successes >= self.cfg.half_open_trials {
                    info!("database circuit closed");
                    inner.state = State::Closed;
                    inner.window.clear();
                } else {
                    inner.state = State::HalfOpen {
                        trials_issued,
                        successes,
                    };
                }
            }
            State::Open { .. } => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            State::Closed => {
                self.push_outcome(&mut inner, true);
                let total = inner.window.len();
                if total >= self.cfg.min_request_volume as usize {
                    let failures = inner.window.iter().filter(|&&f| f).count();
                    let rate = failures as f64 / total as f64;
                    if rate >= self.cfg.failure_rate_threshold {
                        warn!(
                            failure_rate = rate,
                            window = total,
                            "database circuit opened"
                        );
                        inner.state = State::Open {
                            since: Instant::now(),
                        };
                        inner.window.clear();
                    }
                }
            }
            State::HalfOpen { .. } => {
                warn!("database circuit reopened: trial call failed");
                inner.state = State::Open {
                    since: Instant::now(),
                };
            }
            State::Open { .. } => {}
        }
    }

    /// Force the breaker open (operations hook, also used by outage tests).
    pub fn trip(&self) {
        let mut inner = self.inner.lock();
        warn!("database circuit tripped manually");
        inner.state = State::Open {
            since: Instant::now(),
        };
        inner.window.clear();
    }

    /// Force the breaker closed, discarding history.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        info!("database circuit reset manually");
        inner.state = State::Closed;
        inner.window.clear();
    }

    pub fn state(&self) -> CircuitState {
        match self.inner.lock().state {
            State::Closed => CircuitState::Closed,
            State::Open { .. } => CircuitState::Open,
            State::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }

    fn push_outcome(&self, inner: &mut BreakerInner, failed: bool) {
        if inner.window.len() == self.window_size {
            inner.window.pop_front();
        }
        inner.window.push_back(failed);
    }
}
