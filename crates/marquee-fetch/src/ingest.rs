//! Idempotent, conditional ingestion of one external record.

use std::fmt;
use std::sync::Arc;

use chrono::NaiveDate;
use marquee_core::model::today;
use marquee_core::{IngestionRun, RunLedger, SourceSet};

use crate::client::RateLimitedClient;
use crate::error::FetchResult;
use crate::http::HttpResponse;
use crate::uri::ApiRequest;

/// What [`Ingestor::ingest`] did for a record.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// New or changed data was fetched and the run recorded.
    Fetched {
        response: HttpResponse,
        run: IngestionRun,
    },
    /// The provider answered `304 Not Modified`; the run was recorded with
    /// the stored validators.
    NotModified { run: IngestionRun },
    /// A run for the same sources, record, and day already exists.
    Skipped,
}

impl IngestOutcome {
    pub fn response(&self) -> Option<&HttpResponse> {
        match self {
            Self::Fetched { response, .. } => Some(response),
            Self::NotModified { .. } | Self::Skipped => None,
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped)
    }
}

/// Ties a provider client to the run ledger.
///
/// For each record: skip if it already ran today, otherwise fetch it
/// conditionally on the validators of its latest run, then record the run.
#[derive(Clone)]
pub struct Ingestor {
    ledger: Arc<dyn RunLedger>,
    client: RateLimitedClient,
    sources: SourceSet,
}

impl fmt::Debug for Ingestor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ingestor")
            .field("client", &self.client)
            .field("sources", &self.sources)
            .finish_non_exhaustive()
    }
}

impl Ingestor {
    pub fn new(ledger: Arc<dyn RunLedger>, client: RateLimitedClient, sources: SourceSet) -> Self {
        Self {
            ledger,
            client,
            sources,
        }
    }

    pub fn sources(&self) -> &SourceSet {
        &self.sources
    }

    /// Ingest `external_id` for today (UTC).
    pub async fn ingest(&self, external_id: &str, request: ApiRequest) -> FetchResult<IngestOutcome> {
        self.ingest_on(external_id, request, today()).await
    }

    /// Ingest `external_id` as of `day`.
    ///
    /// # Errors
    /// Ledger failures surface as [`FetchError::Ledger`](crate::FetchError::Ledger);
    /// fetch failures are returned unchanged and record nothing.
    pub async fn ingest_on(
        &self,
        external_id: &str,
        request: ApiRequest,
        day: NaiveDate,
    ) -> FetchResult<IngestOutcome> {
        if self.ledger.should_skip(&self.sources, external_id, day)? {
            log::debug!(
                "Skipping {} for [{}]: already ingested on {}",
                external_id,
                self.sources,
                day
            );
            return Ok(IngestOutcome::Skipped);
        }

        let previous = self
            .ledger
            .latest(&self.sources, external_id)?
            .map(|run| run.validators)
            .unwrap_or_default();

        let request = if previous.is_empty() {
            request
        } else {
            request.with_validators(&previous)
        };

        let response = self.client.fetch(&request).await?;

        if response.is_not_modified() {
            let run = self
                .ledger
                .record(&self.sources, external_id, day, &previous)?;
            log::debug!("{} unchanged for [{}]", external_id, self.sources);
            return Ok(IngestOutcome::NotModified { run });
        }

        let validators = response.validators();
        let run = self
            .ledger
            .record(&self.sources, external_id, day, &validators)?;
        log::info!(
            "Ingested {} for [{}] on {}",
            external_id,
            self.sources,
            day
        );
        Ok(IngestOutcome::Fetched { response, run })
    }
}
