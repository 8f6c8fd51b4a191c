//! Resilience primitives for provider fetches.

pub mod cache;
pub mod clock;
pub mod limiter;
pub mod retry;

pub use cache::ResponseCache;
pub use clock::{Clock, ManualClock, SystemClock};
pub use limiter::{Admission, InMemoryWindowStore, LimitPolicy, RateLimiter, WindowStore};
pub use retry::{BackoffSchedule, RetryingTransport};
