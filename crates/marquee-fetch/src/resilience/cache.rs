//! Namespaced, TTL-bounded memo of successful responses.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::http::{HttpRequest, HttpResponse, Method};
use crate::resilience::clock::{Clock, SystemClock};

#[derive(Debug, Clone)]
struct Entry {
    response: HttpResponse,
    stored: Instant,
}

/// Response cache keyed by request signature.
///
/// Only idempotent reads (GET, HEAD) answered with a 2xx are stored.
/// Entries are keyed by `namespace`, method, and the full signed URI, so two
/// clients sharing a cache never see each other's entries unless they share
/// a namespace.
#[derive(Debug, Clone)]
pub struct ResponseCache {
    namespace: String,
    ttl: Duration,
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    clock: Arc<dyn Clock>,
}

impl ResponseCache {
    pub fn new(namespace: impl Into<String>, ttl: Duration) -> Self {
        Self {
            namespace: namespace.into(),
            ttl,
            entries: Arc::new(Mutex::new(HashMap::new())),
            clock: Arc::new(SystemClock),
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// The cache key for `request`, or `None` if it must not be cached.
    pub fn key(&self, request: &HttpRequest) -> Option<String> {
        let cacheable = matches!(request.method, Method::Get | Method::Head)
            && !request.headers.contains_key("if-none-match")
            && !request.headers.contains_key("if-modified-since");
        cacheable.then(|| format!("{}:{} {}", self.namespace, request.method, request.url))
    }

    /// A fresh cached response for `request`; expired entries are evicted.
    pub fn get(&self, request: &HttpRequest) -> Option<HttpResponse> {
        let key = self.key(request)?;
        let now = self.clock.now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);

        match entries.get(&key) {
            Some(entry) if now.saturating_duration_since(entry.stored) < self.ttl => {
                Some(entry.response.clone())
            }
            Some(_) => {
                entries.remove(&key);
                None
            }
            None => None,
        }
    }

    /// Remember `response` for `request` if both are cacheable.
    pub fn put(&self, request: &HttpRequest, response: &HttpResponse) {
        if !response.is_success() {
            return;
        }
        let Some(key) = self.key(request) else {
            return;
        };
        let entry = Entry {
            response: response.clone(),
            stored: self.clock.now(),
        };
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, entry);
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
