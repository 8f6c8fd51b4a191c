//! Deterministic request construction and signing.
//!
//! An [`ApiRequest`] is the logical request a caller wants to make: method,
//! path segments, query, headers, and an optional JSON body. Signing it
//! against a provider's base URL yields the concrete [`HttpRequest`]:
//!
//! - each path segment is percent-encoded on its own and joined with `/`;
//! - query parameters with null or empty values are dropped;
//! - the query is sorted by name, so insertion order never changes the URI;
//! - default parameters and headers (credentials, `Accept`, ...) are added
//!   only where the caller did not supply a value of the same name.
//!
//! Identical logical requests therefore always sign to the identical URI,
//! which the response cache and the run ledger rely on.

use std::collections::BTreeMap;

use reqwest::Url;

use marquee_core::Validators;

use crate::error::{FetchError, FetchResult};
use crate::http::{HttpRequest, Method};

/// A query parameter value; `Null` is dropped during signing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryValue {
    Null,
    Value(String),
}

impl QueryValue {
    fn into_non_empty(self) -> Option<String> {
        match self {
            Self::Value(value) if !value.is_empty() => Some(value),
            _ => None,
        }
    }
}

impl From<&str> for QueryValue {
    fn from(value: &str) -> Self {
        Self::Value(value.to_string())
    }
}

impl From<String> for QueryValue {
    fn from(value: String) -> Self {
        Self::Value(value)
    }
}

impl From<&String> for QueryValue {
    fn from(value: &String) -> Self {
        Self::Value(value.clone())
    }
}

macro_rules! query_value_from_display {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for QueryValue {
                fn from(value: $ty) -> Self {
                    Self::Value(value.to_string())
                }
            }
        )*
    };
}

query_value_from_display!(i32, i64, u32, u64, usize, bool);

impl<T: Into<QueryValue>> From<Option<T>> for QueryValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// A logical provider request, independent of base URL and credentials.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    pub segments: Vec<String>,
    pub query: Vec<(String, QueryValue)>,
    pub headers: BTreeMap<String, String>,
    pub body: Option<serde_json::Value>,
}

impl ApiRequest {
    pub fn new<I, S>(method: Method, segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        Self {
            method,
            segments: segments.into_iter().map(|s| s.to_string()).collect(),
            query: Vec::new(),
            headers: BTreeMap::new(),
            body: None,
        }
    }

    pub fn get<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        Self::new(Method::Get, segments)
    }

    /// Append a path segment (numbers and ids included).
    #[must_use]
    pub fn segment(mut self, segment: impl ToString) -> Self {
        self.segments.push(segment.to_string());
        self
    }

    #[must_use]
    pub fn query(mut self, name: impl Into<String>, value: impl Into<QueryValue>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    #[must_use]
    pub fn json_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Make the request conditional on the stored validators.
    #[must_use]
    pub fn with_validators(mut self, validators: &Validators) -> Self {
        if let Some(etag) = &validators.etag {
            self = self.header("if-none-match", etag.clone());
        }
        if let Some(last_modified) = &validators.last_modified {
            self = self.header("if-modified-since", last_modified.clone());
        }
        self
    }

    /// Sign the request against `base`, injecting defaults.
    ///
    /// # Errors
    /// Returns [`FetchError::InvalidRequest`] when `base` cannot carry a path.
    pub fn sign(
        &self,
        base: &Url,
        default_query: &BTreeMap<String, String>,
        default_headers: &BTreeMap<String, String>,
    ) -> FetchResult<HttpRequest> {
        let mut url = base.clone();

        // Query pairs already on the base URL rank below configured defaults.
        let base_query: Vec<(String, String)> = url
            .query_pairs()
            .map(|(name, value)| (name.into_owned(), value.into_owned()))
            .collect();

        url.path_segments_mut()
            .map_err(|()| {
                FetchError::InvalidRequest(format!("base URL cannot carry a path: {base}"))
            })?
            .pop_if_empty()
            .extend(&self.segments);

        let mut query: BTreeMap<String, String> = BTreeMap::new();
        for (name, value) in &self.query {
            if let Some(value) = value.clone().into_non_empty() {
                query.insert(name.clone(), value);
            }
        }
        let defaults = default_query
            .iter()
            .chain(base_query.iter().map(|(name, value)| (name, value)));
        for (name, value) in defaults {
            if !value.is_empty() {
                query.entry(name.clone()).or_insert_with(|| value.clone());
            }
        }

        if query.is_empty() {
            url.set_query(None);
        } else {
            url.query_pairs_mut().clear().extend_pairs(&query);
        }

        let mut headers = self.headers.clone();
        for (name, value) in default_headers {
            headers
                .entry(name.to_ascii_lowercase())
                .or_insert_with(|| value.clone());
        }

        Ok(HttpRequest {
            method: self.method,
            url,
            headers,
            body: self.body.clone(),
        })
    }
}
