use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use super::sources::SourceSet;

/// HTTP cache validators observed on the most recent successful fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validators {
    /// Value of the `ETag` response header.
    pub etag: Option<String>,

    /// Value of the `Last-Modified` response header.
    pub last_modified: Option<String>,
}

impl Validators {
    #[must_use]
    pub fn new(etag: Option<String>, last_modified: Option<String>) -> Self {
        Self {
            etag,
            last_modified,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none()
    }
}

/// One idempotent unit of ingestion work.
///
/// Identified by `(sources, external_id, run_day)`; at most one run exists
/// per tuple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionRun {
    /// Row id; increases with insertion order.
    pub id: i64,

    pub sources: SourceSet,

    /// Identifier of the record at the external provider (e.g. "tt0111161").
    pub external_id: String,

    /// Calendar day (UTC) the ingestion ran on.
    pub run_day: NaiveDate,

    pub validators: Validators,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Normalize a timestamp in any timezone to the UTC calendar day used as
/// the run-ledger key.
pub fn ingestion_day<Tz: TimeZone>(at: &DateTime<Tz>) -> NaiveDate {
    at.with_timezone(&Utc).date_naive()
}

/// The UTC calendar day for "now".
pub fn today() -> NaiveDate {
    Utc::now().date_naive()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::FixedOffset;

    #[test]
    fn test_validators_empty() {
        assert!(Validators::default().is_empty());
        assert!(!Validators::new(Some("\"abc\"".to_string()), None).is_empty());
    }

    #[test]
    fn test_ingestion_day_normalizes_to_utc() {
        // 23:30 at UTC-05:00 is already the next day in UTC.
        let offset = FixedOffset::west_opt(5 * 3600).unwrap();
        let local = offset.with_ymd_and_hms(2025, 1, 1, 23, 30, 0).unwrap();
        assert_eq!(
            ingestion_day(&local),
            NaiveDate::from_ymd_opt(2025, 1, 2).unwrap()
        );
    }

    #[test]
    fn test_ingestion_day_same_day_in_utc() {
        let utc = Utc.with_ymd_and_hms(2025, 1, 1, 8, 0, 0).unwrap();
        assert_eq!(
            ingestion_day(&utc),
            NaiveDate::from_ymd_opt(2025, 1, 1).unwrap()
        );
    }
}
