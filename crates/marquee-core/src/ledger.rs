//! Idempotency ledger for ingestion runs.
//!
//! Before fetching an external record, callers ask the ledger whether the
//! same `(sources, external_id, day)` tuple already ran; after a successful
//! fetch they record the run together with the response validators so the
//! next fetch can be conditional.

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::Type;
use rusqlite::OptionalExtension;

use crate::error::{Error, Result};
use crate::model::{IngestionRun, SourceSet, Validators};
use crate::schema::Database;

const DAY_FORMAT: &str = "%Y-%m-%d";

const RUN_COLUMNS: &str =
    "id, sources, external_id, run_day, etag, last_modified, created_at, updated_at";

/// Storage contract for the ingestion run ledger.
///
/// Implementations must enforce uniqueness of `(sources, external_id, day)`
/// and resolve concurrent writes to the same tuple with last-write-wins on
/// the validator fields.
pub trait RunLedger: Send + Sync {
    /// `true` if a run already exists for the tuple on `day`.
    fn should_skip(&self, sources: &SourceSet, external_id: &str, day: NaiveDate) -> Result<bool>;

    /// The most recent run for the pair regardless of day, ordered by day
    /// and then insertion order, descending.
    fn latest(&self, sources: &SourceSet, external_id: &str) -> Result<Option<IngestionRun>>;

    /// Upsert the run for the tuple, storing the latest validators.
    fn record(
        &self,
        sources: &SourceSet,
        external_id: &str,
        day: NaiveDate,
        validators: &Validators,
    ) -> Result<IngestionRun>;
}

impl RunLedger for Database {
    fn should_skip(&self, sources: &SourceSet, external_id: &str, day: NaiveDate) -> Result<bool> {
        let exists: bool = self.conn().query_row(
            "SELECT EXISTS(
                SELECT 1 FROM ingestion_runs
                WHERE sources = ?1 AND external_id = ?2 AND run_day = ?3
             )",
            rusqlite::params![
                sources.as_str(),
                external_id,
                day.format(DAY_FORMAT).to_string()
            ],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    fn latest(&self, sources: &SourceSet, external_id: &str) -> Result<Option<IngestionRun>> {
        let run = self
            .conn()
            .query_row(
                &format!(
                    "SELECT {RUN_COLUMNS} FROM ingestion_runs
                     WHERE sources = ?1 AND external_id = ?2
                     ORDER BY run_day DESC, id DESC
                     LIMIT 1"
                ),
                rusqlite::params![sources.as_str(), external_id],
                row_to_run,
            )
            .optional()?;
        Ok(run)
    }

    fn record(
        &self,
        sources: &SourceSet,
        external_id: &str,
        day: NaiveDate,
        validators: &Validators,
    ) -> Result<IngestionRun> {
        if external_id.trim().is_empty() {
            return Err(Error::InvalidData(
                "ingestion run needs a non-empty external id".to_string(),
            ));
        }

        let now = Utc::now().to_rfc3339();
        let run = self.conn().query_row(
            &format!(
                "INSERT INTO ingestion_runs (
                    sources, external_id, run_day, etag, last_modified, created_at, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                 ON CONFLICT (sources, external_id, run_day) DO UPDATE SET
                    etag = excluded.etag,
                    last_modified = excluded.last_modified,
                    updated_at = excluded.updated_at
                 RETURNING {RUN_COLUMNS}"
            ),
            rusqlite::params![
                sources.as_str(),
                external_id,
                day.format(DAY_FORMAT).to_string(),
                validators.etag,
                validators.last_modified,
                now,
            ],
            row_to_run,
        )?;

        log::debug!(
            "Recorded ingestion run {} for {} [{}] on {}",
            run.id,
            external_id,
            sources,
            day
        );

        Ok(run)
    }
}

fn row_to_run(row: &rusqlite::Row) -> rusqlite::Result<IngestionRun> {
    let run_day_str: String = row.get(3)?;
    let created_at_str: String = row.get(6)?;
    let updated_at_str: String = row.get(7)?;

    let run_day = NaiveDate::parse_from_str(&run_day_str, DAY_FORMAT)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?;

    Ok(IngestionRun {
        id: row.get(0)?,
        sources: SourceSet::from_key(row.get(1)?),
        external_id: row.get(2)?,
        run_day,
        validators: Validators::new(row.get(4)?, row.get(5)?),
        created_at: parse_timestamp(&created_at_str, 6)?,
        updated_at: parse_timestamp(&updated_at_str, 7)?,
    })
}

fn parse_timestamp(value: &str, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn validators(etag: &str, last_modified: &str) -> Validators {
        Validators::new(Some(etag.to_string()), Some(last_modified.to_string()))
    }

    #[test]
    fn test_record_then_skip_is_case_insensitive() {
        let db = Database::open_in_memory().unwrap();

        db.record(
            &SourceSet::new(["tmdb"]),
            "tt123",
            day(2025, 1, 1),
            &validators("\"e1\"", "Wed, 01 Jan 2025 00:00:00 GMT"),
        )
        .unwrap();

        assert!(db
            .should_skip(&SourceSet::new(["TMDB"]), "tt123", day(2025, 1, 1))
            .unwrap());
        assert!(!db
            .should_skip(&SourceSet::new(["tmdb"]), "tt123", day(2025, 1, 2))
            .unwrap());
    }

    #[test]
    fn test_skip_false_for_other_record_or_sources() {
        let db = Database::open_in_memory().unwrap();
        let sources = SourceSet::new(["tmdb", "omdb"]);
        db.record(&sources, "tt123", day(2025, 1, 1), &Validators::default())
            .unwrap();

        assert!(!db.should_skip(&sources, "tt999", day(2025, 1, 1)).unwrap());
        assert!(!db
            .should_skip(&SourceSet::new(["tmdb"]), "tt123", day(2025, 1, 1))
            .unwrap());
        assert!(db
            .should_skip(&SourceSet::new(["OMDB", "tmdb"]), "tt123", day(2025, 1, 1))
            .unwrap());
    }

    #[test]
    fn test_record_is_idempotent_with_last_write_wins() {
        let db = Database::open_in_memory().unwrap();
        let sources = SourceSet::new(["tmdb"]);

        let first = db
            .record(&sources, "tt123", day(2025, 1, 1), &validators("\"e1\"", "lm1"))
            .unwrap();
        let second = db
            .record(&sources, "tt123", day(2025, 1, 1), &validators("\"e2\"", "lm2"))
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.validators.etag.as_deref(), Some("\"e2\""));
        assert_eq!(second.validators.last_modified.as_deref(), Some("lm2"));
        assert_eq!(first.created_at, second.created_at);

        let count: i64 = db
            .conn()
            .query_row("SELECT COUNT(*) FROM ingestion_runs", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_latest_orders_by_day_descending() {
        let db = Database::open_in_memory().unwrap();
        let sources = SourceSet::new(["tmdb"]);

        db.record(&sources, "tt123", day(2025, 1, 3), &validators("\"e3\"", "lm3"))
            .unwrap();
        db.record(&sources, "tt123", day(2025, 1, 1), &validators("\"e1\"", "lm1"))
            .unwrap();

        let latest = db.latest(&sources, "tt123").unwrap().unwrap();
        assert_eq!(latest.run_day, day(2025, 1, 3));
        assert_eq!(latest.validators.etag.as_deref(), Some("\"e3\""));
    }

    #[test]
    fn test_latest_none_when_never_recorded() {
        let db = Database::open_in_memory().unwrap();
        assert!(db
            .latest(&SourceSet::new(["tmdb"]), "tt123")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_default_source_token_is_comparable() {
        let db = Database::open_in_memory().unwrap();
        let none: [&str; 0] = [];

        db.record(&SourceSet::new(none), "tt1", day(2025, 1, 1), &Validators::default())
            .unwrap();

        assert!(db
            .should_skip(&SourceSet::new([" "]), "tt1", day(2025, 1, 1))
            .unwrap());
        let run = db.latest(&SourceSet::new(none), "tt1").unwrap().unwrap();
        assert!(run.sources.is_default());
    }

    #[test]
    fn test_blank_external_id_is_rejected() {
        let db = Database::open_in_memory().unwrap();
        let err = db
            .record(&SourceSet::new(["tmdb"]), "  ", day(2025, 1, 1), &Validators::default())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidData(_)));
    }
}
