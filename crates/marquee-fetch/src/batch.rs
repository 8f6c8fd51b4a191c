//! Bounded-concurrency execution of keyed provider requests.
//!
//! A [`BatchExecutor`] owns a set of [`PendingRequest`]s, each submitted
//! under a caller-chosen key, and drives them with at most `concurrency`
//! in flight. Completions are consumed by a single coordinating loop in
//! completion order; that loop invokes the [`BatchHooks`] and pushes
//! [`BatchEvent`]s onto the optional event channel. One key's failure
//! never affects another key.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;

use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use tokio::sync::mpsc::UnboundedSender;

use crate::error::{ErrorClass, FetchError, FetchResult};
use crate::http::HttpResponse;

/// A lazily evaluated provider call, typically from
/// [`RateLimitedClient::prepare`](crate::RateLimitedClient::prepare).
pub type PendingRequest = BoxFuture<'static, FetchResult<HttpResponse>>;

/// Lifecycle callbacks, all optional.
///
/// Hooks run on the coordinating loop, never concurrently with each other.
pub trait BatchHooks<K>: Send {
    /// Before any request is started.
    fn before(&mut self, _total: usize) {}

    /// A key resolved successfully (2xx or 304).
    fn progress(&mut self, _key: &K, _response: &HttpResponse, _completed: usize, _total: usize) {
    }

    /// A key failed; the remaining keys keep running.
    fn catch(&mut self, _key: &K, _error: &FetchError) {}

    /// Every key resolved and none failed.
    fn then(&mut self, _report: &BatchReport<K>) {}

    /// Always, last.
    fn finally(&mut self, _report: &BatchReport<K>) {}
}

/// Progress notifications for callers that prefer a channel to hooks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchEvent<K> {
    Started {
        total: usize,
    },
    Completed {
        key: K,
        /// Response status, or the error's class.
        outcome: Result<u16, ErrorClass>,
        completed: usize,
        total: usize,
    },
    Finished {
        succeeded: usize,
        failed: usize,
    },
}

/// The outcome of a batch: one final result per submitted key.
#[derive(Debug)]
pub struct BatchReport<K> {
    results: HashMap<K, FetchResult<HttpResponse>>,
    succeeded: usize,
    failed: usize,
}

impl<K: Eq + Hash> BatchReport<K> {
    pub fn get(&self, key: &K) -> Option<&FetchResult<HttpResponse>> {
        self.results.get(key)
    }

    pub fn succeeded(&self) -> usize {
        self.succeeded
    }

    pub fn failed(&self) -> usize {
        self.failed
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// `true` when no key failed.
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }

    pub fn failures(&self) -> impl Iterator<Item = (&K, &FetchError)> {
        self.results
            .iter()
            .filter_map(|(key, result)| result.as_ref().err().map(|err| (key, err)))
    }

    pub fn into_results(self) -> HashMap<K, FetchResult<HttpResponse>> {
        self.results
    }
}

/// Drives keyed pending requests to completion.
pub struct BatchExecutor<K> {
    pending: Vec<(K, PendingRequest)>,
    /// Position of each key in `pending`.
    index: HashMap<K, usize>,
    concurrency: Option<usize>,
    hooks: Option<Box<dyn BatchHooks<K>>>,
    events: Option<UnboundedSender<BatchEvent<K>>>,
}

impl<K: fmt::Debug> fmt::Debug for BatchExecutor<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchExecutor")
            .field("keys", &self.pending.iter().map(|(k, _)| k).collect::<Vec<_>>())
            .field("concurrency", &self.concurrency)
            .field("hooks", &self.hooks.is_some())
            .field("events", &self.events.is_some())
            .finish()
    }
}

impl<K> Default for BatchExecutor<K> {
    fn default() -> Self {
        Self {
            pending: Vec::new(),
            index: HashMap::new(),
            concurrency: None,
            hooks: None,
            events: None,
        }
    }
}

impl<K> BatchExecutor<K>
where
    K: Eq + Hash + Clone + fmt::Debug + Send,
{
    /// An executor with unbounded concurrency.
    pub fn new() -> Self {
        Self::default()
    }

    /// At most `limit` requests in flight; zero is treated as one.
    #[must_use]
    pub fn with_concurrency(mut self, limit: usize) -> Self {
        self.concurrency = Some(limit.max(1));
        self
    }

    #[must_use]
    pub fn with_hooks(mut self, hooks: impl BatchHooks<K> + 'static) -> Self {
        self.hooks = Some(Box::new(hooks));
        self
    }

    /// Push a [`BatchEvent`] for every lifecycle step onto `sender`.
    #[must_use]
    pub fn with_events(mut self, sender: UnboundedSender<BatchEvent<K>>) -> Self {
        self.events = Some(sender);
        self
    }

    /// Queue `request` under `key`. Submitting a key again replaces the
    /// earlier request, which is dropped without being started.
    pub fn submit(&mut self, key: K, request: PendingRequest) -> &mut Self {
        if let Some(&slot) = self.index.get(&key) {
            self.pending[slot].1 = request;
        } else {
            self.index.insert(key.clone(), self.pending.len());
            self.pending.push((key, request));
        }
        self
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Run every submitted request and wait until all keys resolve.
    pub async fn run(self) -> BatchReport<K> {
        let Self {
            pending,
            concurrency,
            mut hooks,
            index: _,
            events,
        } = self;

        let total = pending.len();
        let emit = |event: BatchEvent<K>| {
            if let Some(sender) = &events {
                if sender.send(event).is_err() {
                    log::trace!("Batch event receiver dropped");
                }
            }
        };

        log::debug!(
            "Running batch of {} requests (concurrency {:?})",
            total,
            concurrency
        );
        emit(BatchEvent::Started { total });
        if let Some(hooks) = hooks.as_mut() {
            hooks.before(total);
        }

        let limit = concurrency.unwrap_or(total).max(1);
        let mut completions = stream::iter(
            pending
                .into_iter()
                .map(|(key, request)| async move { (key, request.await) }),
        )
        .buffer_unordered(limit);

        let mut results = HashMap::with_capacity(total);
        let mut succeeded = 0;
        let mut failed = 0;

        while let Some((key, result)) = completions.next().await {
            let completed = succeeded + failed + 1;
            let outcome = match &result {
                Ok(response) => {
                    succeeded += 1;
                    if let Some(hooks) = hooks.as_mut() {
                        hooks.progress(&key, response, completed, total);
                    }
                    Ok(response.status)
                }
                Err(err) => {
                    failed += 1;
                    log::warn!("Batch request {:?} failed: {}", key, err);
                    if let Some(hooks) = hooks.as_mut() {
                        hooks.catch(&key, err);
                    }
                    Err(err.class())
                }
            };
            emit(BatchEvent::Completed {
                key: key.clone(),
                outcome,
                completed,
                total,
            });
            results.insert(key, result);
        }

        let report = BatchReport {
            results,
            succeeded,
            failed,
        };

        if let Some(hooks) = hooks.as_mut() {
            if report.all_succeeded() {
                hooks.then(&report);
            }
            hooks.finally(&report);
        }
        emit(BatchEvent::Finished { succeeded, failed });

        if failed > 0 {
            log::warn!("Batch finished: {} succeeded, {} failed", succeeded, failed);
        } else {
            log::debug!("Batch finished: {} succeeded", succeeded);
        }

        report
    }
}
