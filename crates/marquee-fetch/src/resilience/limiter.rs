//! Fixed-window rate limiting per limiter key.
//!
//! A [`RateLimiter`] carries one provider's ceiling, window length, and
//! policy, and is injected into every client that should share it. Window
//! state lives behind a [`WindowStore`], so the same limiter code runs
//! against the in-process [`InMemoryWindowStore`] or a store shared between
//! instances.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::error::{FetchError, FetchResult};
use crate::resilience::clock::{Clock, SystemClock};

/// Outcome of a single admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// The window is full; it resets after the carried duration.
    Blocked(Duration),
}

/// What to do when the window is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitPolicy {
    /// Surface [`FetchError::RateLimitExceeded`] immediately.
    FailFast,
    /// Wait for the window to reset, for at most `max_wait` in total.
    Block { max_wait: Duration },
}

/// Storage for per-key windows.
///
/// `admit` must be atomic per key: two concurrent calls must never both
/// take the last free slot.
pub trait WindowStore: Send + Sync + fmt::Debug {
    fn admit(&self, key: &str, ceiling: u32, window: Duration, now: Instant) -> Admission;
}

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u32,
    started: Instant,
}

/// In-process window store; one mutex guards every key's window.
#[derive(Debug, Default)]
pub struct InMemoryWindowStore {
    windows: Mutex<HashMap<String, Window>>,
}

impl InMemoryWindowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WindowStore for InMemoryWindowStore {
    fn admit(&self, key: &str, ceiling: u32, window: Duration, now: Instant) -> Admission {
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = windows.entry(key.to_string()).or_insert(Window {
            count: 0,
            started: now,
        });

        let elapsed = now.saturating_duration_since(entry.started);
        if elapsed >= window {
            entry.count = 0;
            entry.started = now;
        }

        if entry.count < ceiling {
            entry.count += 1;
            Admission::Allowed
        } else {
            let elapsed = now.saturating_duration_since(entry.started);
            Admission::Blocked(window.saturating_sub(elapsed))
        }
    }
}

/// Admits or rejects requests per limiter key.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    ceiling: u32,
    window: Duration,
    policy: LimitPolicy,
    store: Arc<dyn WindowStore>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Create a limiter allowing `ceiling` requests per `window`, backed by
    /// a fresh in-memory store and the system clock.
    pub fn new(ceiling: u32, window: Duration, policy: LimitPolicy) -> Self {
        Self {
            ceiling,
            window,
            policy,
            store: Arc::new(InMemoryWindowStore::new()),
            clock: Arc::new(SystemClock),
        }
    }

    /// Use a shared window store.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn WindowStore>) -> Self {
        self.store = store;
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn ceiling(&self) -> u32 {
        self.ceiling
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn policy(&self) -> LimitPolicy {
        self.policy
    }

    /// One admission check; counts the request when allowed.
    pub fn admit(&self, key: &str) -> Admission {
        self.store
            .admit(key, self.ceiling, self.window, self.clock.now())
    }

    /// Admit a request under the configured policy.
    ///
    /// # Errors
    /// Returns [`FetchError::RateLimitExceeded`] when the window is full and
    /// the policy is fail-fast, or when waiting would exceed `max_wait`.
    pub async fn acquire(&self, key: &str) -> FetchResult<()> {
        let started = self.clock.now();

        loop {
            let retry_after = match self.admit(key) {
                Admission::Allowed => return Ok(()),
                Admission::Blocked(retry_after) => retry_after,
            };

            let max_wait = match self.policy {
                LimitPolicy::FailFast => {
                    return Err(FetchError::RateLimitExceeded {
                        key: key.to_string(),
                        retry_after,
                    })
                }
                LimitPolicy::Block { max_wait } => max_wait,
            };

            let waited = self.clock.now().saturating_duration_since(started);
            if waited.saturating_add(retry_after) > max_wait {
                log::debug!(
                    "Rate limit for {} not admitted within {:?}; giving up",
                    key,
                    max_wait
                );
                return Err(FetchError::RateLimitExceeded {
                    key: key.to_string(),
                    retry_after,
                });
            }

            log::debug!("Rate limit reached for {}, waiting {:?}", key, retry_after);
            self.clock.sleep(retry_after).await;
        }
    }
}
