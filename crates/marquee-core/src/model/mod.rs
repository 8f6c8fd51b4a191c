//! Ingestion domain model.

pub mod run;
pub mod sources;

pub use run::{ingestion_day, today, IngestionRun, Validators};
pub use sources::SourceSet;
