//! Resilient external-data fetch layer for marquee.
//!
//! Provides a rate-limited, retrying HTTP request primitive
//! ([`RateLimitedClient`]), a bounded-concurrency [`BatchExecutor`] built on
//! top of it, and an [`Ingestor`] that consults the run ledger so the same
//! external record is not re-ingested on the same day.

#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]

pub mod batch;
pub mod client;
pub mod config;
pub mod error;
pub mod http;
pub mod ingest;
pub mod resilience;
pub mod uri;

pub use batch::{BatchEvent, BatchExecutor, BatchHooks, BatchReport, PendingRequest};
pub use client::RateLimitedClient;
pub use config::{Config, ProviderConfig};
pub use error::{ErrorClass, FailureCause, FetchError, FetchResult};
pub use http::{HttpRequest, HttpResponse, HttpTransport, Method, ReqwestTransport};
pub use ingest::{IngestOutcome, Ingestor};
pub use resilience::{
    Admission, BackoffSchedule, Clock, InMemoryWindowStore, LimitPolicy, ManualClock,
    RateLimiter, ResponseCache, RetryingTransport, SystemClock, WindowStore,
};
pub use uri::{ApiRequest, QueryValue};
