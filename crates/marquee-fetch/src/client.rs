//! The rate-limited provider client.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Url;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::batch::PendingRequest;
use crate::config::ProviderConfig;
use crate::error::{FailureCause, FetchError, FetchResult};
use crate::http::{HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};
use crate::resilience::{RateLimiter, ResponseCache, RetryingTransport};
use crate::uri::ApiRequest;

/// One provider behind a single call interface.
///
/// Every call is signed against the base URL with the default query and
/// headers, served from the cache when possible, and otherwise sent through
/// the [`RetryingTransport`], which admits each attempt (retries included)
/// through the shared [`RateLimiter`] under the client's limiter key.
/// Clones share the limiter, transport, and cache.
#[derive(Debug, Clone)]
pub struct RateLimitedClient {
    base_url: Url,
    default_query: BTreeMap<String, String>,
    default_headers: BTreeMap<String, String>,
    limiter: RateLimiter,
    transport: RetryingTransport,
    cache: Option<ResponseCache>,
}

impl RateLimitedClient {
    /// The limiter key is taken from `transport`, so the limiter and any
    /// provider 429 report under the same key. Attaching the limiter also
    /// sets how long a provider 429 may be waited out (see
    /// [`RetryingTransport::with_limiter`]).
    pub fn new(base_url: Url, transport: RetryingTransport, limiter: RateLimiter) -> Self {
        Self {
            base_url,
            default_query: BTreeMap::new(),
            default_headers: BTreeMap::new(),
            transport: transport.with_limiter(limiter.clone()),
            limiter,
            cache: None,
        }
    }

    /// Build a client from a provider section over a fresh `reqwest` client.
    ///
    /// `limiter` is injected so that clients sharing a credential can share
    /// one window.
    pub fn from_config(
        name: &str,
        config: &ProviderConfig,
        limiter: RateLimiter,
    ) -> FetchResult<Self> {
        let transport = match &config.user_agent {
            Some(user_agent) => ReqwestTransport::with_user_agent(user_agent)?,
            None => ReqwestTransport::new()?,
        };
        Self::from_config_with_transport(name, config, limiter, Arc::new(transport))
    }

    /// Same as [`from_config`](Self::from_config) over any transport.
    pub fn from_config_with_transport(
        name: &str,
        config: &ProviderConfig,
        limiter: RateLimiter,
        transport: Arc<dyn HttpTransport>,
    ) -> FetchResult<Self> {
        let base_url = Url::parse(&config.base_url).map_err(|e| {
            FetchError::InvalidRequest(format!("invalid base URL for {name}: {e}"))
        })?;

        let retrying = RetryingTransport::new(transport, name)
            .with_timeout(config.timeout())
            .with_max_attempts(config.retry.attempts)
            .with_schedule(config.retry.schedule())
            .with_default_retry_after(limiter.window());

        let mut client = Self::new(base_url, retrying, limiter)
            .with_default_query(config.default_query.clone())
            .with_default_headers(config.default_headers.clone());

        if let Some(cache) = &config.cache {
            let namespace = cache.namespace.clone().unwrap_or_else(|| name.to_string());
            client = client.with_cache(ResponseCache::new(
                namespace,
                Duration::from_secs(cache.ttl_secs),
            ));
        }

        Ok(client)
    }

    /// Query parameters injected when the caller does not supply them.
    #[must_use]
    pub fn with_default_query(mut self, query: BTreeMap<String, String>) -> Self {
        self.default_query.extend(query);
        self
    }

    #[must_use]
    pub fn with_default_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.default_headers.extend(
            headers
                .into_iter()
                .map(|(name, value)| (name.to_ascii_lowercase(), value)),
        );
        self
    }

    #[must_use]
    pub fn with_cache(mut self, cache: ResponseCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn limiter_key(&self) -> &str {
        self.transport.limiter_key()
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Sign `request` exactly as [`fetch`](Self::fetch) would.
    pub fn sign(&self, request: &ApiRequest) -> FetchResult<HttpRequest> {
        request.sign(&self.base_url, &self.default_query, &self.default_headers)
    }

    /// Perform one logical call.
    ///
    /// Returns the provider response for 2xx and `304 Not Modified`.
    ///
    /// # Errors
    /// Propagates [`FetchError::RateLimitExceeded`] from the limiter, and the
    /// transport's `RetryExhausted` / `TransportFailed` / `RateLimitExceeded`
    /// unchanged.
    pub async fn fetch(&self, request: &ApiRequest) -> FetchResult<HttpResponse> {
        let signed = self.sign(request)?;

        if let Some(response) = self.cache.as_ref().and_then(|cache| cache.get(&signed)) {
            log::debug!("Cache hit for {} {}", signed.method, signed.path());
            return Ok(response);
        }

        log::debug!("{} {}", signed.method, signed.path());
        let response = self.transport.send(&signed).await?;

        if let Some(cache) = &self.cache {
            cache.put(&signed, &response);
        }

        Ok(response)
    }

    /// Fetch and decode the JSON body.
    ///
    /// # Errors
    /// [`FetchError::MissingResult`] when the body is empty, `null`, or the
    /// response is `304 Not Modified`; `TransportFailed` with a
    /// [`FailureCause::Decode`] when the body is not the expected JSON.
    pub async fn fetch_json<T: DeserializeOwned>(&self, request: &ApiRequest) -> FetchResult<T> {
        let value = self.fetch_value(request).await?;
        decode(request, &self.base_url, value)
    }

    /// Fetch and decode the value at `pointer` (RFC 6901, e.g.
    /// `/translations/0`).
    ///
    /// An absent, `null`, or empty (`[]`, `{}`, `""`) value is reported as
    /// [`FetchError::MissingResult`].
    pub async fn fetch_field<T: DeserializeOwned>(
        &self,
        request: &ApiRequest,
        pointer: &str,
    ) -> FetchResult<T> {
        let mut value = self.fetch_value(request).await?;
        let field = value
            .pointer_mut(pointer)
            .map(Value::take)
            .filter(|field| !is_empty_value(field))
            .ok_or_else(|| missing(request, &self.base_url))?;
        decode(request, &self.base_url, field)
    }

    /// Wrap a call as a lazy [`PendingRequest`] for the batch executor.
    ///
    /// Nothing is sent until the batch polls it.
    pub fn prepare(&self, request: ApiRequest) -> PendingRequest {
        let client = self.clone();
        Box::pin(async move { client.fetch(&request).await })
    }

    async fn fetch_value(&self, request: &ApiRequest) -> FetchResult<Value> {
        let response = self.fetch(request).await?;
        if response.is_not_modified() || response.body.iter().all(u8::is_ascii_whitespace) {
            return Err(missing(request, &self.base_url));
        }

        let value: Value = response.json().map_err(|e| FetchError::TransportFailed {
            method: request.method,
            path: request_path(request, &self.base_url),
            cause: FailureCause::Decode(e.to_string()),
        })?;

        if value.is_null() {
            return Err(missing(request, &self.base_url));
        }
        Ok(value)
    }
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(fields) => fields.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

fn request_path(request: &ApiRequest, base_url: &Url) -> String {
    let mut url = base_url.clone();
    if let Ok(mut segments) = url.path_segments_mut() {
        segments.pop_if_empty().extend(&request.segments);
    }
    url.path().to_string()
}

fn missing(request: &ApiRequest, base_url: &Url) -> FetchError {
    FetchError::MissingResult {
        method: request.method,
        path: request_path(request, base_url),
    }
}

fn decode<T: DeserializeOwned>(request: &ApiRequest, base_url: &Url, value: Value) -> FetchResult<T> {
    serde_json::from_value(value).map_err(|e| FetchError::TransportFailed {
        method: request.method,
        path: request_path(request, base_url),
        cause: FailureCause::Decode(e.to_string()),
    })
}
