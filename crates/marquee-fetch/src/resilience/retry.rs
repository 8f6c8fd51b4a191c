//! Per-attempt timeout and bounded retry around an [`HttpTransport`].

use std::sync::Arc;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};

use crate::error::{FailureCause, FetchError, FetchResult};
use crate::http::{HttpRequest, HttpResponse, HttpTransport};
use crate::resilience::clock::{Clock, SystemClock};
use crate::resilience::limiter::{LimitPolicy, RateLimiter};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_ATTEMPTS: u32 = 3;
const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(500);
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(10);

/// 4xx statuses retried by default besides 429.
const DEFAULT_RETRYABLE_STATUSES: &[u16] = &[408, 425];

/// Delay strategy between attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackoffSchedule {
    /// Delays consumed in order; the last one repeats once the list runs out.
    Fixed(Vec<Duration>),
    /// `attempt * base` after the n-th failed attempt.
    Linear(Duration),
    /// Doubling delays between `min` and `max`.
    Exponential { min: Duration, max: Duration },
}

impl Default for BackoffSchedule {
    fn default() -> Self {
        Self::Linear(DEFAULT_BASE_DELAY)
    }
}

impl BackoffSchedule {
    /// The delays to sleep between attempts, at most `retries` of them.
    fn delays(&self, retries: usize) -> Box<dyn Iterator<Item = Duration> + Send> {
        match self {
            Self::Fixed(delays) => {
                let last = delays.last().copied().unwrap_or_default();
                Box::new(
                    delays
                        .clone()
                        .into_iter()
                        .chain(std::iter::repeat(last))
                        .take(retries),
                )
            }
            Self::Linear(base) => {
                let base = *base;
                Box::new((1..).map(move |n: u32| base.saturating_mul(n)).take(retries))
            }
            Self::Exponential { min, max } => Box::new(
                ExponentialBuilder::default()
                    .with_min_delay(*min)
                    .with_max_delay(*max)
                    .with_max_times(retries)
                    .build(),
            ),
        }
    }
}

/// Issues one logical HTTP call with timeout, retry, and backoff.
///
/// Network errors, timeouts, 5xx, and the configured retryable 4xx
/// statuses are retried up to `max_attempts` calls in total. Any other
/// non-success status fails at once with [`FetchError::TransportFailed`].
/// A `304 Not Modified` is returned as a response, not an error.
///
/// A 429 becomes [`FetchError::RateLimitExceeded`] at once unless the
/// provider's wait fits within `max_rate_limit_wait` (zero by default), in
/// which case it is retried no sooner than the provider asked.
///
/// With a limiter attached, every attempt (retries included) is admitted
/// by it, so retries count against the provider ceiling.
#[derive(Debug, Clone)]
pub struct RetryingTransport {
    transport: Arc<dyn HttpTransport>,
    limiter_key: String,
    limiter: Option<RateLimiter>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
    max_attempts: u32,
    schedule: BackoffSchedule,
    retryable_statuses: Vec<u16>,
    default_retry_after: Duration,
    max_rate_limit_wait: Duration,
}

impl RetryingTransport {
    pub fn new(transport: Arc<dyn HttpTransport>, limiter_key: impl Into<String>) -> Self {
        Self {
            transport,
            limiter_key: limiter_key.into(),
            limiter: None,
            clock: Arc::new(SystemClock),
            timeout: DEFAULT_TIMEOUT,
            max_attempts: DEFAULT_ATTEMPTS,
            schedule: BackoffSchedule::default(),
            retryable_statuses: DEFAULT_RETRYABLE_STATUSES.to_vec(),
            default_retry_after: DEFAULT_RETRY_AFTER,
            max_rate_limit_wait: Duration::ZERO,
        }
    }

    /// Admit every attempt through `limiter` under this transport's key.
    ///
    /// A blocking limiter also lets a provider 429 be waited out in-loop
    /// for up to its `max_wait`; a fail-fast one never waits.
    #[must_use]
    pub fn with_limiter(mut self, limiter: RateLimiter) -> Self {
        self.max_rate_limit_wait = match limiter.policy() {
            LimitPolicy::FailFast => Duration::ZERO,
            LimitPolicy::Block { max_wait } => max_wait,
        };
        self.limiter = Some(limiter);
        self
    }

    /// Clock used for backoff sleeps.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Longest provider-requested wait a 429 may be retried after.
    #[must_use]
    pub fn with_max_rate_limit_wait(mut self, max_wait: Duration) -> Self {
        self.max_rate_limit_wait = max_wait;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Total number of calls, including the first. Zero is treated as one.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    #[must_use]
    pub fn with_schedule(mut self, schedule: BackoffSchedule) -> Self {
        self.schedule = schedule;
        self
    }

    #[must_use]
    pub fn with_retryable_statuses(mut self, statuses: Vec<u16>) -> Self {
        self.retryable_statuses = statuses;
        self
    }

    /// Wait reported for a 429 that carries no usable `Retry-After`.
    #[must_use]
    pub fn with_default_retry_after(mut self, retry_after: Duration) -> Self {
        self.default_retry_after = retry_after;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn limiter_key(&self) -> &str {
        &self.limiter_key
    }

    fn is_retryable(&self, cause: &FailureCause) -> bool {
        match cause {
            FailureCause::Timeout | FailureCause::Network(_) => true,
            FailureCause::Status(status) => {
                *status >= 500 || *status == 429 || self.retryable_statuses.contains(status)
            }
            FailureCause::Decode(_) | FailureCause::Aborted(_) => false,
        }
    }

    async fn attempt(&self, request: &HttpRequest) -> Result<HttpResponse, FailureCause> {
        match tokio::time::timeout(self.timeout, self.transport.execute(request, self.timeout))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(FailureCause::Timeout),
        }
    }

    /// Send `request`, retrying transient failures.
    ///
    /// # Errors
    /// - [`FetchError::TransportFailed`] for a non-retryable failure;
    /// - [`FetchError::RateLimitExceeded`] when the limiter rejects an
    ///   attempt, or the provider answers 429 with a wait beyond
    ///   `max_rate_limit_wait` or after the last attempt;
    /// - [`FetchError::RetryExhausted`] for any other retryable failure that
    ///   outlives every attempt.
    pub async fn send(&self, request: &HttpRequest) -> FetchResult<HttpResponse> {
        let retries = usize::try_from(self.max_attempts.saturating_sub(1)).unwrap_or(usize::MAX);
        let mut delays = self.schedule.delays(retries);
        let mut attempts = 0u32;

        loop {
            attempts += 1;

            if let Some(limiter) = &self.limiter {
                limiter.acquire(&self.limiter_key).await?;
            }

            let (cause, retry_after) = match self.attempt(request).await {
                Ok(response) if response.is_success() || response.is_not_modified() => {
                    return Ok(response);
                }
                Ok(response) if response.is_rate_limited() => (
                    FailureCause::Status(429),
                    Some(response.retry_after().unwrap_or(self.default_retry_after)),
                ),
                Ok(response) => (FailureCause::Status(response.status), None),
                Err(cause) => (cause, None),
            };

            if let Some(wait) = retry_after.filter(|wait| *wait > self.max_rate_limit_wait) {
                log::warn!(
                    "{} {} rate limited by provider; retry after {:?}",
                    request.method,
                    request.path(),
                    wait
                );
                return Err(FetchError::RateLimitExceeded {
                    key: self.limiter_key.clone(),
                    retry_after: wait,
                });
            }

            if !self.is_retryable(&cause) {
                return Err(FetchError::TransportFailed {
                    method: request.method,
                    path: request.path().to_string(),
                    cause,
                });
            }

            let Some(delay) = delays.next() else {
                log::warn!(
                    "{} {} failed after {} attempts: {}",
                    request.method,
                    request.path(),
                    attempts,
                    cause
                );
                if let Some(wait) = retry_after {
                    return Err(FetchError::RateLimitExceeded {
                        key: self.limiter_key.clone(),
                        retry_after: wait,
                    });
                }
                return Err(FetchError::RetryExhausted {
                    method: request.method,
                    path: request.path().to_string(),
                    attempts,
                    last_cause: cause,
                });
            };

            // Never come back sooner than the provider asked.
            let delay = retry_after.map_or(delay, |floor| floor.max(delay));
            log::warn!(
                "{} {} attempt {}/{} failed ({}); retrying in {:?}",
                request.method,
                request.path(),
                attempts,
                self.max_attempts,
                cause,
                delay
            );
            self.clock.sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Method;
    use crate::resilience::clock::ManualClock;
    use async_trait::async_trait;
    use std::collections::{BTreeMap, VecDeque};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Replays scripted outcomes; repeats the last one when the script ends.
    #[derive(Debug)]
    struct Scripted {
        outcomes: Mutex<VecDeque<Result<HttpResponse, FailureCause>>>,
        calls: AtomicU32,
    }

    impl Scripted {
        fn new(outcomes: Vec<Result<HttpResponse, FailureCause>>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into()),
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl HttpTransport for Scripted {
        async fn execute(
            &self,
            _request: &HttpRequest,
            _timeout: Duration,
        ) -> Result<HttpResponse, FailureCause> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut outcomes = self.outcomes.lock().unwrap();
            if outcomes.len() > 1 {
                outcomes.pop_front().unwrap()
            } else {
                outcomes.front().cloned().unwrap()
            }
        }
    }

    #[derive(Debug)]
    struct Slow;

    #[async_trait]
    impl HttpTransport for Slow {
        async fn execute(
            &self,
            _request: &HttpRequest,
            _timeout: Duration,
        ) -> Result<HttpResponse, FailureCause> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(HttpResponse::new(200))
        }
    }

    fn request() -> HttpRequest {
        HttpRequest {
            method: Method::Get,
            url: reqwest::Url::parse("https://api.example.org/3/movie/1?api_key=secret").unwrap(),
            headers: BTreeMap::new(),
            body: None,
        }
    }

    fn retrying(transport: Arc<dyn HttpTransport>, attempts: u32) -> RetryingTransport {
        RetryingTransport::new(transport, "tmdb")
            .with_max_attempts(attempts)
            .with_schedule(BackoffSchedule::Fixed(vec![Duration::ZERO]))
    }

    #[test]
    fn test_fixed_schedule_repeats_last_delay() {
        let schedule = BackoffSchedule::Fixed(vec![
            Duration::from_millis(100),
            Duration::from_millis(300),
        ]);
        let delays: Vec<_> = schedule.delays(4).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(300),
                Duration::from_millis(300),
                Duration::from_millis(300),
            ]
        );
    }

    #[test]
    fn test_linear_schedule_multiplies_attempt() {
        let schedule = BackoffSchedule::Linear(Duration::from_millis(250));
        let delays: Vec<_> = schedule.delays(3).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(250),
                Duration::from_millis(500),
                Duration::from_millis(750),
            ]
        );
    }

    #[test]
    fn test_exponential_schedule_is_bounded() {
        let schedule = BackoffSchedule::Exponential {
            min: Duration::from_millis(10),
            max: Duration::from_millis(40),
        };
        let delays: Vec<_> = schedule.delays(5).collect();
        assert_eq!(delays.len(), 5);
        assert!(delays.iter().all(|d| *d <= Duration::from_millis(40)));
    }

    #[tokio::test]
    async fn test_always_retryable_failure_exhausts_exact_attempts() {
        let stub = Scripted::new(vec![Ok(HttpResponse::new(503))]);
        let transport = retrying(Arc::clone(&stub) as Arc<dyn HttpTransport>, 4);

        let err = transport.send(&request()).await.unwrap_err();

        assert_eq!(stub.calls(), 4);
        match err {
            FetchError::RetryExhausted {
                method,
                path,
                attempts,
                last_cause,
            } => {
                assert_eq!(method, Method::Get);
                assert_eq!(path, "/3/movie/1");
                assert_eq!(attempts, 4);
                assert_eq!(last_cause, FailureCause::Status(503));
            }
            other => panic!("expected RetryExhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failures() {
        let stub = Scripted::new(vec![
            Err(FailureCause::Network("connection reset".to_string())),
            Ok(HttpResponse::new(502)),
            Ok(HttpResponse::new(200)),
        ]);
        let transport = retrying(Arc::clone(&stub) as Arc<dyn HttpTransport>, 3);

        let response = transport.send(&request()).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(stub.calls(), 3);
    }

    #[tokio::test]
    async fn test_client_error_fails_immediately() {
        let stub = Scripted::new(vec![Ok(HttpResponse::new(404))]);
        let transport = retrying(Arc::clone(&stub) as Arc<dyn HttpTransport>, 5);

        let err = transport.send(&request()).await.unwrap_err();
        assert_eq!(stub.calls(), 1);
        assert!(matches!(
            err,
            FetchError::TransportFailed {
                cause: FailureCause::Status(404),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_configured_4xx_is_retried() {
        let stub = Scripted::new(vec![Ok(HttpResponse::new(409)), Ok(HttpResponse::new(200))]);
        let transport = retrying(Arc::clone(&stub) as Arc<dyn HttpTransport>, 3)
            .with_retryable_statuses(vec![409]);

        assert!(transport.send(&request()).await.is_ok());
        assert_eq!(stub.calls(), 2);
    }

    #[tokio::test]
    async fn test_short_retry_after_is_retried_then_reported() {
        let stub = Scripted::new(vec![Ok(
            HttpResponse::new(429).with_header("Retry-After", "0")
        )]);
        let transport = retrying(Arc::clone(&stub) as Arc<dyn HttpTransport>, 2);

        let err = transport.send(&request()).await.unwrap_err();
        assert_eq!(stub.calls(), 2);
        match err {
            FetchError::RateLimitExceeded { key, retry_after } => {
                assert_eq!(key, "tmdb");
                assert_eq!(retry_after, Duration::ZERO);
            }
            other => panic!("expected RateLimitExceeded, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_429_without_header_uses_default_wait() {
        let stub = Scripted::new(vec![Ok(HttpResponse::new(429))]);
        let transport = retrying(stub, 1).with_default_retry_after(Duration::from_secs(42));

        let err = transport.send(&request()).await.unwrap_err();
        assert_eq!(err.class(), crate::ErrorClass::RateLimited(Duration::from_secs(42)));
    }

    #[tokio::test]
    async fn test_long_retry_after_fails_without_waiting() {
        let clock = Arc::new(ManualClock::new());
        let stub = Scripted::new(vec![Ok(
            HttpResponse::new(429).with_header("Retry-After", "3600")
        )]);
        let transport = retrying(Arc::clone(&stub) as Arc<dyn HttpTransport>, 3)
            .with_clock(Arc::clone(&clock) as Arc<dyn Clock>);

        let start = clock.now();
        let err = tokio::time::timeout(Duration::from_secs(1), transport.send(&request()))
            .await
            .expect("429 must surface without sleeping")
            .unwrap_err();

        assert_eq!(stub.calls(), 1);
        assert_eq!(clock.now(), start);
        match err {
            FetchError::RateLimitExceeded { key, retry_after } => {
                assert_eq!(key, "tmdb");
                assert_eq!(retry_after, Duration::from_secs(3600));
            }
            other => panic!("expected RateLimitExceeded, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_retry_after_within_cap_is_waited_out() {
        let clock = Arc::new(ManualClock::new());
        let stub = Scripted::new(vec![
            Ok(HttpResponse::new(429).with_header("Retry-After", "30")),
            Ok(HttpResponse::new(200)),
        ]);
        let transport = retrying(Arc::clone(&stub) as Arc<dyn HttpTransport>, 3)
            .with_clock(Arc::clone(&clock) as Arc<dyn Clock>)
            .with_max_rate_limit_wait(Duration::from_secs(120));

        let start = clock.now();
        assert!(transport.send(&request()).await.is_ok());
        assert_eq!(stub.calls(), 2);
        assert_eq!(clock.now() - start, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_fail_fast_limiter_never_waits_for_provider() {
        let limiter = RateLimiter::new(100, Duration::from_secs(60), LimitPolicy::FailFast);
        let stub = Scripted::new(vec![Ok(
            HttpResponse::new(429).with_header("Retry-After", "5")
        )]);
        let transport = retrying(Arc::clone(&stub) as Arc<dyn HttpTransport>, 3)
            .with_max_rate_limit_wait(Duration::from_secs(600))
            .with_limiter(limiter);

        let err = transport.send(&request()).await.unwrap_err();
        assert_eq!(stub.calls(), 1);
        assert_eq!(err.class(), crate::ErrorClass::RateLimited(Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn test_limiter_admits_every_attempt() {
        let limiter = RateLimiter::new(2, Duration::from_secs(60), LimitPolicy::FailFast);
        let stub = Scripted::new(vec![Ok(HttpResponse::new(503))]);
        let transport =
            retrying(Arc::clone(&stub) as Arc<dyn HttpTransport>, 3).with_limiter(limiter);

        let err = transport.send(&request()).await.unwrap_err();
        assert_eq!(stub.calls(), 2);
        assert!(matches!(err, FetchError::RateLimitExceeded { .. }));
    }

    #[tokio::test]
    async fn test_backoff_sleeps_on_injected_clock() {
        let clock = Arc::new(ManualClock::new());
        let stub = Scripted::new(vec![Ok(HttpResponse::new(500))]);
        let transport = RetryingTransport::new(Arc::clone(&stub) as Arc<dyn HttpTransport>, "tmdb")
            .with_max_attempts(3)
            .with_schedule(BackoffSchedule::Linear(Duration::from_secs(10)))
            .with_clock(Arc::clone(&clock) as Arc<dyn Clock>);

        let start = clock.now();
        assert!(transport.send(&request()).await.is_err());
        assert_eq!(clock.now() - start, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_not_modified_is_returned_not_retried() {
        let stub = Scripted::new(vec![Ok(HttpResponse::new(304))]);
        let transport = retrying(Arc::clone(&stub) as Arc<dyn HttpTransport>, 3);

        let response = transport.send(&request()).await.unwrap();
        assert!(response.is_not_modified());
        assert_eq!(stub.calls(), 1);
    }

    #[tokio::test]
    async fn test_attempt_timeout_is_retryable() {
        let transport = RetryingTransport::new(Arc::new(Slow), "tmdb")
            .with_timeout(Duration::from_millis(20))
            .with_max_attempts(2)
            .with_schedule(BackoffSchedule::Fixed(vec![Duration::ZERO]));

        let err = transport.send(&request()).await.unwrap_err();
        assert!(matches!(
            err,
            FetchError::RetryExhausted {
                attempts: 2,
                last_cause: FailureCause::Timeout,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_decode_failure_is_terminal() {
        let stub = Scripted::new(vec![Err(FailureCause::Decode("bad gzip".to_string()))]);
        let transport = retrying(Arc::clone(&stub) as Arc<dyn HttpTransport>, 3);

        let err = transport.send(&request()).await.unwrap_err();
        assert_eq!(stub.calls(), 1);
        assert!(matches!(err, FetchError::TransportFailed { .. }));
    }
}
