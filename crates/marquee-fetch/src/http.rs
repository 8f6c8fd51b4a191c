//! HTTP transport capability consumed by the fetch layer.
//!
//! [`HttpTransport`] is the seam between the resilience logic and the
//! network: production code uses [`ReqwestTransport`], tests plug in
//! scripted stubs. A transport reports any response it receives, including
//! non-2xx statuses, as `Ok`; only failures that produced no response are
//! reported as a [`FailureCause`].

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use marquee_core::Validators;

use crate::error::{FailureCause, FetchResult};

const DEFAULT_USER_AGENT: &str = "marquee/0.1.0 (https://github.com/marquee-catalog/marquee)";

/// HTTP method of a provider request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
            Self::Head => "HEAD",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Method> for reqwest::Method {
    fn from(method: Method) -> Self {
        match method {
            Method::Get => Self::GET,
            Method::Post => Self::POST,
            Method::Put => Self::PUT,
            Method::Patch => Self::PATCH,
            Method::Delete => Self::DELETE,
            Method::Head => Self::HEAD,
        }
    }
}

/// A fully signed request, ready to put on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    /// Header names are stored lower-cased.
    pub headers: BTreeMap<String, String>,
    pub body: Option<serde_json::Value>,
}

impl HttpRequest {
    /// The URL path without the query string.
    ///
    /// Used in logs and errors so credential parameters never leak.
    pub fn path(&self) -> &str {
        self.url.path()
    }
}

/// A provider response as returned by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    /// Header names are stored lower-cased.
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body: Vec::new(),
        }
    }

    /// Build a response with a JSON body.
    pub fn json_body(status: u16, value: &serde_json::Value) -> Self {
        Self::new(status)
            .with_header("content-type", "application/json")
            .with_body(value.to_string().into_bytes())
    }

    #[must_use]
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    /// Look up a header case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// `true` for any 2xx status.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// `true` for `304 Not Modified` answers to a conditional request.
    pub fn is_not_modified(&self) -> bool {
        self.status == 304
    }

    pub fn is_rate_limited(&self) -> bool {
        self.status == 429
    }

    /// The `Retry-After` delay, when given in seconds.
    pub fn retry_after(&self) -> Option<Duration> {
        self.header("retry-after")
            .and_then(|value| value.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
    }

    /// `ETag` / `Last-Modified` for recording in the run ledger.
    pub fn validators(&self) -> Validators {
        Validators::new(
            self.header("etag").map(str::to_string),
            self.header("last-modified").map(str::to_string),
        )
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

/// The outbound HTTP capability: one attempt, one response.
#[async_trait]
pub trait HttpTransport: Send + Sync + fmt::Debug {
    async fn execute(
        &self,
        request: &HttpRequest,
        timeout: Duration,
    ) -> Result<HttpResponse, FailureCause>;
}

/// [`HttpTransport`] backed by a shared [`reqwest::Client`].
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    http: Client,
}

impl ReqwestTransport {
    /// Create a transport with the default user agent.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be created.
    pub fn new() -> FetchResult<Self> {
        Self::with_user_agent(DEFAULT_USER_AGENT)
    }

    pub fn with_user_agent(user_agent: &str) -> FetchResult<Self> {
        let http = Client::builder().user_agent(user_agent).build()?;
        Ok(Self { http })
    }

    /// Wrap an existing client (shares its connection pool).
    pub fn from_client(http: Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(
        &self,
        request: &HttpRequest,
        timeout: Duration,
    ) -> Result<HttpResponse, FailureCause> {
        let mut builder = self
            .http
            .request(request.method.into(), request.url.clone())
            .timeout(timeout);

        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(classify_reqwest_error)?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(classify_reqwest_error)?
            .to_vec();

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

fn classify_reqwest_error(err: reqwest::Error) -> FailureCause {
    if err.is_timeout() {
        FailureCause::Timeout
    } else if err.is_decode() {
        FailureCause::Decode(err.to_string())
    } else {
        FailureCause::Network(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_display() {
        assert_eq!(Method::Get.to_string(), "GET");
        assert_eq!(reqwest::Method::from(Method::Patch), reqwest::Method::PATCH);
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let response = HttpResponse::new(200).with_header("ETag", "\"v1\"");
        assert_eq!(response.header("etag"), Some("\"v1\""));
        assert_eq!(response.header("ETAG"), Some("\"v1\""));
    }

    #[test]
    fn test_status_predicates() {
        assert!(HttpResponse::new(204).is_success());
        assert!(!HttpResponse::new(304).is_success());
        assert!(HttpResponse::new(304).is_not_modified());
        assert!(HttpResponse::new(429).is_rate_limited());
    }

    #[test]
    fn test_retry_after_seconds() {
        let response = HttpResponse::new(429).with_header("Retry-After", " 7 ");
        assert_eq!(response.retry_after(), Some(Duration::from_secs(7)));

        let http_date = HttpResponse::new(429)
            .with_header("Retry-After", "Wed, 21 Oct 2015 07:28:00 GMT");
        assert_eq!(http_date.retry_after(), None);
    }

    #[test]
    fn test_validators_from_headers() {
        let response = HttpResponse::new(200)
            .with_header("ETag", "\"abc\"")
            .with_header("Last-Modified", "Wed, 01 Jan 2025 00:00:00 GMT");
        let validators = response.validators();
        assert_eq!(validators.etag.as_deref(), Some("\"abc\""));
        assert_eq!(
            validators.last_modified.as_deref(),
            Some("Wed, 01 Jan 2025 00:00:00 GMT")
        );
    }

    #[test]
    fn test_json_body_round_trip() {
        let response = HttpResponse::json_body(200, &serde_json::json!({"id": 550}));
        let value: serde_json::Value = response.json().unwrap();
        assert_eq!(value["id"], 550);
        assert_eq!(response.header("content-type"), Some("application/json"));
    }

    #[test]
    fn test_transport_creation_succeeds() {
        assert!(ReqwestTransport::new().is_ok());
    }
}
